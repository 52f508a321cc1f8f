// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::param::{DEFAULT_CONTAINER_NAME, DEFAULT_ENTRYPOINT, DEFAULT_HELPER_SCRIPT};
use crate::util::executable_dir;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    entrypoint: Option<String>,
    #[serde(default = "default_helper_script")]
    helper_script: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default)]
    decrypt_threads: usize,
    #[serde(default)]
    read_timeout_ms: u64,
    #[serde(default = "default_allow_partial_load")]
    allow_partial_load: bool,
}

fn default_helper_script() -> String {
    DEFAULT_HELPER_SCRIPT.to_string()
}

fn default_local() -> bool {
    true
}

fn default_allow_partial_load() -> bool {
    true
}

// 与原生线程池一致：工作线程数为硬件并发度，但不少于 4
fn auto_worker_threads() -> usize {
    num_cpus::get().max(4)
}

impl Config {
    pub fn new() -> Self {
        Self {
            container: None,
            entrypoint: None,
            helper_script: default_helper_script(),
            port: None,
            local: default_local(),
            worker_threads: auto_worker_threads(),
            decrypt_threads: 0,
            read_timeout_ms: 0,
            allow_partial_load: default_allow_partial_load(),
        }
    }

    pub fn from_toml(filename: &str) -> Self {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                warn!("无法打开配置文件{}：{}，使用默认配置", filename, e);
                return Config::new();
            }
        };
        let mut str_val = String::new();
        if let Err(e) = file.read_to_string(&mut str_val) {
            error!("读取配置文件{}失败：{}，使用默认配置", filename, e);
            return Config::new();
        }
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(content: &str) -> Self {
        let mut raw_config: Config = match toml::from_str(content) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = auto_worker_threads();
        }
        if raw_config.helper_script.is_empty() {
            warn!("helper_script为空，将使用默认的{}", DEFAULT_HELPER_SCRIPT);
            raw_config.helper_script = default_helper_script();
        }
        raw_config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    // 未配置时使用可执行文件旁的 gemcore-assets；相对路径也以可执行文件目录为基准
    pub fn container_path(&self) -> PathBuf {
        match &self.container {
            Some(p) => {
                let path = PathBuf::from(p);
                if path.is_absolute() {
                    path
                } else {
                    executable_dir().join(path)
                }
            }
            None => executable_dir().join(DEFAULT_CONTAINER_NAME),
        }
    }

    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint.as_deref()
    }

    pub fn helper_script(&self) -> &str {
        &self.helper_script
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn decrypt_threads(&self) -> usize {
        self.decrypt_threads
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn allow_partial_load(&self) -> bool {
        self.allow_partial_load
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
struct AppSection {
    name: Option<String>,
    version: Option<String>,
    entrypoint: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct WindowSection {
    title: Option<String>,
}

/// 打包在容器内的应用清单（`.gemcore-config.json`）。
///
/// 只关心服务端需要的字段：入口页面、应用名（用于派生端口）、窗口标题（用于日志）。
#[derive(Deserialize, Debug, Clone, Default)]
pub struct AppManifest {
    #[serde(default)]
    app: AppSection,
    #[serde(default)]
    window: WindowSection,
    #[serde(default)]
    entrypoint: Option<String>,
}

const DEFAULT_APP_NAME: &str = "gemcore-app";
const DEFAULT_TITLE: &str = "Gemcore App";

impl AppManifest {
    /// 解析失败时记录日志并返回 `None`，调用方沿用默认值。
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice(bytes) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("应用清单解析失败：{}，使用默认值", e);
                None
            }
        }
    }

    /// 顶层 `entrypoint` 优先于 `app.entrypoint`。
    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint
            .as_deref()
            .or(self.app.entrypoint.as_deref())
    }

    pub fn app_name(&self) -> &str {
        self.app.name.as_deref().unwrap_or(DEFAULT_APP_NAME)
    }

    pub fn version(&self) -> Option<&str> {
        self.app.version.as_deref()
    }

    pub fn title(&self) -> &str {
        match (&self.window.title, &self.app.name) {
            (Some(t), Some(name)) if t == DEFAULT_TITLE => name.as_str(),
            (Some(t), _) => t.as_str(),
            (None, Some(name)) => name.as_str(),
            (None, None) => DEFAULT_TITLE,
        }
    }
}

/// 入口页面的优先级：显式配置 > 应用清单 > `index.html`。
/// 返回的路径不带前导 `/`，与缓存中的资源路径一致。
pub fn resolve_entrypoint(config: &Config, manifest: Option<&AppManifest>) -> String {
    let entrypoint = config
        .entrypoint()
        .or_else(|| manifest.and_then(|m| m.entrypoint()))
        .unwrap_or(DEFAULT_ENTRYPOINT);
    entrypoint.trim_start_matches('/').to_string()
}
