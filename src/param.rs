// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 容器格式与 HTTP 常量模块
//!
//! 该模块集中定义了：
//! - 资源容器的二进制格式常量（魔数、密钥长度、路径与单文件上限）。
//! - 预渲染响应所用的协议常量与固定的 404 报文。
//! - 文件后缀名到 MIME 类型的映射表。
//! - 首屏关键资源列表。

use std::collections::HashMap;
use lazy_static::lazy_static;

/// 容器文件头部魔数，包含结尾的 NUL。
pub const MAGIC: &[u8; 9] = b"GEMCORE1\0";

/// 混淆密钥长度（字节）。
pub const KEY_LEN: usize = 32;

/// 单条记录路径长度上限（字节）。
pub const MAX_PATH_LEN: u32 = 4096;

/// 单个资源的明文大小上限：100 MiB。
pub const MAX_ASSET_SIZE: u64 = 100 * 1024 * 1024;

/// 默认容器文件名（与可执行文件位于同一目录）。
pub const DEFAULT_CONTAINER_NAME: &str = "gemcore-assets";

/// 默认入口页面。
pub const DEFAULT_ENTRYPOINT: &str = "index.html";

/// 默认注入到 HTML 中的辅助脚本资源名。
pub const DEFAULT_HELPER_SCRIPT: &str = "gemcore-webgpu-helper.js";

/// 打包在容器内部的应用清单资源名。
pub const APP_MANIFEST_ASSET: &str = ".gemcore-config.json";

/// 未配置端口时派生端口的起点与范围。
pub const BASE_PORT: u16 = 8765;
pub const PORT_SPAN: u64 = 1000;

/// HTTP 协议规定的换行符
pub const CRLF: &str = "\r\n";

/// 未命中缓存时发送的固定响应，正文恰好 9 字节。
pub const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";

/// 代码类资源的缓存策略：每次重新构建后都不能读到旧内容。
pub const CACHE_CONTROL_CODE: &str = "no-cache, no-store, must-revalidate";

/// 静态资源的缓存策略：一年且不可变。
pub const CACHE_CONTROL_STATIC: &str = "public, max-age=31536000, immutable";

/// 兜底 MIME 类型
pub const DEFAULT_MIME: &str = "application/octet-stream";

lazy_static! {
    /// 首屏关键资源。入口页面之后按此顺序优先放入缓存。
    pub static ref CRITICAL_ASSETS: Vec<&'static str> = vec![
        "main.js",
        "app.js",
        "game.js",
        "index.js",
        "main.css",
        "style.css",
        "app.css",
        "manifest.json",
        "favicon.ico",
    ];
}

lazy_static! {
    /// 文件后缀名（小写，不含点）到 MIME 类型的映射表。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        // 代码类
        map.insert("html", "text/html; charset=utf-8");
        map.insert("htm", "text/html; charset=utf-8");
        map.insert("js", "text/javascript; charset=utf-8");
        map.insert("mjs", "text/javascript; charset=utf-8");
        map.insert("css", "text/css; charset=utf-8");
        map.insert("json", "application/json");
        map.insert("map", "application/json");
        // 图片
        map.insert("png", "image/png");
        map.insert("jpg", "image/jpeg");
        map.insert("jpeg", "image/jpeg");
        map.insert("gif", "image/gif");
        map.insert("svg", "image/svg+xml");
        map.insert("webp", "image/webp");
        map.insert("avif", "image/avif");
        map.insert("bmp", "image/bmp");
        map.insert("ico", "image/x-icon");
        // 字体
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("ttf", "font/ttf");
        map.insert("otf", "font/otf");
        // 音视频
        map.insert("mp3", "audio/mpeg");
        map.insert("ogg", "audio/ogg");
        map.insert("wav", "audio/wav");
        map.insert("mp4", "video/mp4");
        map.insert("webm", "video/webm");
        // 其他
        map.insert("wasm", "application/wasm");
        map.insert("txt", "text/plain");
        map.insert("xml", "text/xml");
        map
    };
}
