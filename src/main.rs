// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Gemcore 资源服务器
//!
//! 启动流程：
//! - 加载日志与 TOML 配置
//! - 读取并解密资源容器
//! - 解析应用清单，确定入口页面与端口
//! - 预渲染响应缓存
//! - 启动阻塞式工作线程池，并打开后台管理控制台（help / status / reload / stop）

use gemcore_server::{
    asset::{load_container_file, AssetStore},
    cache::CacheBuilder,
    config::{resolve_entrypoint, AppManifest, Config},
    param::APP_MANIFEST_ASSET,
    server::{bind_listener, listen_addr, spawn, Server},
    util::{derive_port, format_file_size, launch_url},
    ResponseCache,
};

use log::{debug, error, info, warn, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Root},
};

use std::{
    io::{self, BufRead},
    process,
    sync::{mpsc, Arc},
    thread,
    time::Instant,
};

/// 控制台线程发给主线程的指令。
enum Command {
    Reload,
    Stop,
}

fn main() {
    // 1. 初始化日志系统：优先使用 YAML 配置，缺失时退回到只输出到 stderr
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法加载config/log4rs.yaml：{}，日志仅输出到标准错误", e);
        init_fallback_logger();
    }

    // 2. 读取配置
    let config = Config::from_toml("config/development.toml");
    info!("配置文件已载入");

    // 3. 加载资源容器并构建缓存
    let (store, manifest) = match load_assets(&config) {
        Some(loaded) => loaded,
        None => process::exit(1),
    };
    let entrypoint = resolve_entrypoint(&config, manifest.as_ref());
    info!("入口页面：{}", entrypoint);
    let cache = build_cache(&config, &entrypoint, &store);
    drop(store);

    // 4. 确定端口并绑定
    let manifest = manifest.unwrap_or_default();
    let port = match config.port() {
        Some(p) => p,
        None => {
            let p = derive_port(manifest.app_name());
            info!("未配置端口，按应用名{}派生端口{}", manifest.app_name(), p);
            p
        }
    };
    let address = listen_addr(config.local(), port);
    info!("服务端将在{}上监听Socket连接", address);
    let listener = match bind_listener(address) {
        Ok(l) => l,
        Err(e) => {
            error!("{}：{}", e, address);
            process::exit(1);
        }
    };

    // 5. 启动工作线程
    let server = Arc::new(Server::new(cache).with_read_timeout(config.read_timeout()));
    let handle = match spawn(Arc::clone(&server), listener, config.worker_threads()) {
        Ok(h) => h,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    match manifest.version() {
        Some(v) => info!("{} v{} 已就绪", manifest.title(), v),
        None => info!("{} 已就绪", manifest.title()),
    }
    info!("浏览器入口：{}", launch_url(handle.local_addr().port(), &entrypoint));

    // 6. 后台管理控制台
    let (tx, rx) = mpsc::channel();
    let console_server = Arc::clone(&server);
    let console = thread::Builder::new()
        .name("gemcore-console".to_string())
        .spawn(move || run_console(&console_server, tx));
    if let Err(e) = console {
        warn!("无法启动管理控制台：{}", e);
    }

    // 7. 主线程等待控制台指令
    loop {
        match rx.recv() {
            Ok(Command::Reload) => reload(&config, &server),
            Ok(Command::Stop) => {
                info!("收到停机指令，正在关闭服务器...");
                handle.shutdown();
                info!("服务器已关闭");
                return;
            }
            Err(_) => {
                // 标准输入已关闭（例如作为子进程运行），服务器继续运行
                debug!("管理控制台已退出");
                handle.join();
                return;
            }
        }
    }
}

fn init_fallback_logger() {
    let stderr = ConsoleAppender::builder().target(Target::Stderr).build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(LevelFilter::Info));
    match config {
        Ok(c) => {
            if let Err(e) = log4rs::init_config(c) {
                eprintln!("无法初始化日志系统：{}", e);
            }
        }
        Err(e) => eprintln!("无法构建日志配置：{}", e),
    }
}

/// 读取容器并解析应用清单。加载失败，或不允许部分加载时容器不完整，返回 `None`。
fn load_assets(config: &Config) -> Option<(AssetStore, Option<AppManifest>)> {
    let path = config.container_path();
    info!("资源容器：{}", path.display());

    let start_time = Instant::now();
    let outcome = match load_container_file(&path, config.decrypt_threads()) {
        Ok(o) => o,
        Err(e) => {
            error!("资源容器加载失败：{}", e);
            return None;
        }
    };
    debug!(
        "使用{}个解密线程，加载用时{}ms",
        outcome.decrypt_workers,
        start_time.elapsed().as_millis()
    );

    if let Some(e) = outcome.error {
        if !outcome.is_usable(config.allow_partial_load()) {
            error!(
                "资源容器不完整（{}），已读取{}/{}个资源，不能以部分加载继续运行",
                e, outcome.loaded, outcome.declared
            );
            return None;
        }
        warn!(
            "资源容器不完整（{}），将使用已读取的{}/{}个资源继续运行",
            e, outcome.loaded, outcome.declared
        );
    }
    if outcome.skipped > 0 {
        warn!("{}个资源超过单文件上限，已跳过", outcome.skipped);
    }

    let manifest = outcome
        .store
        .get(APP_MANIFEST_ASSET)
        .and_then(|a| AppManifest::from_json(&a.data));
    Some((outcome.store, manifest))
}

fn build_cache(config: &Config, entrypoint: &str, store: &AssetStore) -> ResponseCache {
    let builder = CacheBuilder::new(entrypoint, config.helper_script());
    builder.build(store.paths(), store)
}

/// 重新读取容器并整体替换缓存。失败时保留旧缓存。
fn reload(config: &Config, server: &Server) {
    let (store, manifest) = match load_assets(config) {
        Some(loaded) => loaded,
        None => {
            warn!("重新加载失败，继续使用当前缓存");
            return;
        }
    };
    let entrypoint = resolve_entrypoint(config, manifest.as_ref());
    let cache = build_cache(config, &entrypoint, &store);
    server.swap_cache(cache);
}

fn run_console(server: &Server, tx: mpsc::Sender<Command>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let input = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，正在等待工作线程退出...");
                let _ = tx.send(Command::Stop);
                break;
            }
            "reload" => {
                println!("正在重新加载资源容器...");
                if tx.send(Command::Reload).is_err() {
                    break;
                }
            }
            "help" => {
                println!("== Gemcore Server Help ==");
                println!("stop   - 优雅停机");
                println!("reload - 重新加载资源容器并替换缓存");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("=========================");
            }
            "status" => {
                let stats = server.stats();
                let cache = server.snapshot();
                println!("== Gemcore Server 状态 ==");
                println!("当前活跃连接数: {}", stats.active);
                println!("已发送响应: {}", stats.served);
                println!("404: {}", stats.not_found);
                println!("畸形请求: {}", stats.malformed);
                println!("连接错误: {}", stats.failed);
                println!(
                    "缓存: {}个响应，{}，注入{}个HTML文档",
                    cache.response_count(),
                    format_file_size(cache.total_bytes()),
                    cache.injected_count()
                );
                println!("=========================");
            }
            "" => {}
            other => {
                println!("无效的命令：{}", other);
            }
        }
    }
}
