// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use std::{
    collections::hash_map::DefaultHasher,
    env,
    hash::{Hash, Hasher},
    path::PathBuf,
};

use chrono::Utc;
use log::warn;

use crate::param::{BASE_PORT, PORT_SPAN};

pub fn format_file_size(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, units[unit_index])
}

// 可执行文件所在目录，取不到时退回当前目录
pub fn executable_dir() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => match exe.parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        },
        Err(e) => {
            warn!("无法确定可执行文件路径：{}，使用当前目录", e);
            PathBuf::from(".")
        }
    }
}

// 按应用名派生端口，同一个应用每次启动得到相同的端口
pub fn derive_port(app_name: &str) -> u16 {
    let mut hasher = DefaultHasher::new();
    app_name.hash(&mut hasher);
    BASE_PORT + (hasher.finish() % PORT_SPAN) as u16
}

// 交给内嵌浏览器打开的地址。查询串只用于绕过浏览器缓存，服务端会忽略它
pub fn launch_url(port: u16, entrypoint: &str) -> String {
    format!(
        "http://127.0.0.1:{}/{}?t={}",
        port,
        entrypoint.trim_start_matches('/'),
        Utc::now().timestamp()
    )
}
