// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应缓存模块
//!
//! 在服务器开始接受连接之前，把每个资源预先渲染成完整的 HTTP 响应：
//! 头部只生成一次，正文直接引用解密后的资源内存。HTML 文档会注入辅助脚本，
//! 注入后的文档是新分配的正文。
//!
//! 缓存构建完成后只读；重新构建会生成一个全新的 `ResponseCache`，
//! 由服务器整体替换。

use std::collections::HashMap;

use bytes::Bytes;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::bytes::Regex;

use crate::{
    asset::AssetProvider,
    param::{CRITICAL_ASSETS, DEFAULT_ENTRYPOINT, DEFAULT_HELPER_SCRIPT},
    response::CachedResponse,
    util::format_file_size,
};

lazy_static! {
    static ref HEAD_CLOSE: Regex = Regex::new(r"</head>").unwrap();
    static ref BODY_OPEN: Regex = Regex::new(r"<body[^>]*>").unwrap();
}

/// 只读的响应缓存，键为带前导 `/` 的 URI。
///
/// 响应保存在一个向量中，映射表只记录下标，因此 `/` 与入口页面可以共享同一个响应。
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    responses: Vec<CachedResponse>,
    index: HashMap<String, usize>,
    root: Option<usize>,
    entrypoint: String,
    injected: usize,
}

impl ResponseCache {
    /// 精确匹配查找。`/` 走单独的快速路径。
    pub fn get(&self, uri: &str) -> Option<&CachedResponse> {
        if uri == "/" {
            return self.root();
        }
        self.index.get(uri).map(|&i| &self.responses[i])
    }

    /// 入口页面的响应，即 `/` 的别名。
    pub fn root(&self) -> Option<&CachedResponse> {
        self.root.map(|i| &self.responses[i])
    }

    /// 可查询的 URI 数量（包括 `/` 别名）。
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// 实际保存的响应数量（不含别名）。
    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    pub fn injected_count(&self) -> usize {
        self.injected
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// 按构建顺序遍历所有响应。
    pub fn iter(&self) -> impl Iterator<Item = &CachedResponse> {
        self.responses.iter()
    }

    pub fn total_bytes(&self) -> u64 {
        self.responses
            .iter()
            .map(|r| (r.headers().len() + r.body().len()) as u64)
            .sum()
    }

    fn push(&mut self, response: CachedResponse) -> usize {
        let i = self.responses.len();
        self.index.insert(response.uri().to_string(), i);
        self.responses.push(response);
        i
    }
}

/// 响应缓存构建器。
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    entrypoint: String,
    helper_script: String,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRYPOINT, DEFAULT_HELPER_SCRIPT)
    }
}

impl CacheBuilder {
    pub fn new(entrypoint: &str, helper_script: &str) -> Self {
        Self {
            entrypoint: entrypoint.trim_start_matches('/').to_string(),
            helper_script: helper_script.trim_start_matches('/').to_string(),
        }
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn helper_script(&self) -> &str {
        &self.helper_script
    }

    /// 按关键路径顺序构建缓存：入口页面、首屏关键资源，然后按 `paths` 的原有顺序放入其余资源。
    ///
    /// `paths` 是提供者中所有资源的相对路径；提供者查不到的路径会被忽略。
    pub fn build<P: AssetProvider + ?Sized>(&self, paths: &[String], provider: &P) -> ResponseCache {
        let mut cache = ResponseCache {
            responses: Vec::with_capacity(paths.len()),
            index: HashMap::with_capacity(paths.len() + 1),
            root: None,
            entrypoint: self.entrypoint.clone(),
            injected: 0,
        };

        let helper = provider.asset(&self.helper_script).map(|a| a.data);
        if helper.is_none() {
            debug!("辅助脚本{}不存在，HTML不做注入", self.helper_script);
        }

        for path in self.ordered(paths) {
            let asset = match provider.asset(path) {
                Some(a) => a,
                None => {
                    warn!("资源{}在提供者中不存在，跳过", path);
                    continue;
                }
            };

            let mut injected = false;
            let body = match (&helper, asset.mime_type.starts_with("text/html")) {
                (Some(script), true) => match inject_helper(&asset.data, script) {
                    Some(doc) => {
                        injected = true;
                        Bytes::from(doc)
                    }
                    None => {
                        debug!("{}中没有找到注入位置", path);
                        asset.data
                    }
                },
                _ => asset.data,
            };
            if injected {
                cache.injected += 1;
            }

            let i = cache.push(CachedResponse::new(
                format!("/{}", path),
                asset.mime_type,
                body,
                injected,
            ));
            if *path == self.entrypoint {
                cache.root = Some(i);
                cache.index.insert("/".to_string(), i);
            }
        }

        if cache.root.is_none() {
            warn!("入口页面{}不存在，\"/\"将返回404", self.entrypoint);
        }
        info!(
            "响应缓存构建完成：{}个响应（{}），注入{}个HTML文档",
            cache.response_count(),
            format_file_size(cache.total_bytes()),
            cache.injected
        );
        cache
    }

    /// 入口页面与首屏关键资源排在最前，其余保持原有顺序，每个路径只出现一次。
    fn ordered<'a>(&self, paths: &'a [String]) -> Vec<&'a String> {
        let mut ordered: Vec<&'a String> = Vec::with_capacity(paths.len());
        let critical = std::iter::once(self.entrypoint.as_str()).chain(CRITICAL_ASSETS.iter().copied());
        for name in critical {
            if let Some(p) = paths.iter().find(|p| p.as_str() == name) {
                if !ordered.contains(&p) {
                    ordered.push(p);
                }
            }
        }
        let head = ordered.len();
        for p in paths {
            if !ordered[..head].contains(&p) {
                ordered.push(p);
            }
        }
        ordered
    }
}

/// 把 `<script>{script}</script>` 插入到第一个 `</head>` 之前；
/// 没有 `</head>` 时插入到第一个 `<body…>` 标签之后。找不到位置返回 `None`。
pub fn inject_helper(html: &[u8], script: &[u8]) -> Option<Vec<u8>> {
    let at = match HEAD_CLOSE.find(html) {
        Some(m) => m.start(),
        None => BODY_OPEN.find(html)?.end(),
    };
    let mut doc = Vec::with_capacity(html.len() + script.len() + 17);
    doc.extend_from_slice(&html[..at]);
    doc.extend_from_slice(b"<script>");
    doc.extend_from_slice(script);
    doc.extend_from_slice(b"</script>");
    doc.extend_from_slice(&html[at..]);
    Some(doc)
}
