// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use crate::param::*;

use bytes::Bytes;
use log::debug;

use std::{
    io::{self, IoSlice, Write},
    path::Path,
};

/// 内容分类，决定浏览器端的缓存策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// HTML / JavaScript / CSS / JSON：每次重新构建后浏览器都必须重新获取
    Code,
    /// 图片、字体、音视频等：长期缓存
    Static,
}

impl ContentClass {
    pub fn from_mime(mime: &str) -> Self {
        let is_code = ["html", "javascript", "css", "json"]
            .iter()
            .any(|kind| mime.contains(kind));
        if is_code {
            ContentClass::Code
        } else {
            ContentClass::Static
        }
    }

    pub fn cache_control(&self) -> &'static str {
        match self {
            ContentClass::Code => CACHE_CONTROL_CODE,
            ContentClass::Static => CACHE_CONTROL_STATIC,
        }
    }
}

/// 预渲染好的 HTTP 响应：头部在构建缓存时一次性生成，正文与解密后的资源共享内存。
#[derive(Debug, Clone)]
pub struct CachedResponse {
    uri: String,
    mime_type: &'static str,
    content_class: ContentClass,
    headers: Bytes,
    body: Bytes,
    injected: bool,
}

impl CachedResponse {
    /// `injected` 表示正文是注入脚本后生成的新文档（独占内存），
    /// 否则正文是对解密资源的零拷贝引用。
    pub fn new(uri: String, mime_type: &'static str, body: Bytes, injected: bool) -> Self {
        let content_class = ContentClass::from_mime(mime_type);
        let headers = render_headers(mime_type, body.len(), content_class);
        Self {
            uri,
            mime_type,
            content_class,
            headers: Bytes::from(headers),
            body,
            injected,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn content_class(&self) -> ContentClass {
        self.content_class
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_injected(&self) -> bool {
        self.injected
    }

    /// 头部与正文拼接后的完整报文，仅用于测试与诊断；发送路径不会拷贝正文。
    pub fn as_bytes(&self) -> Vec<u8> {
        [&self.headers[..], &self.body[..]].concat()
    }
}

/// 生成响应头。
///
/// 连接在每次响应后都会关闭，也不解析 Range 请求，因此头部如实声明
/// `Connection: close` 与 `Accept-Ranges: none`。
pub fn render_headers(mime: &str, content_length: usize, class: ContentClass) -> String {
    let length = content_length.to_string();
    [
        "HTTP/1.1 200 OK",
        CRLF,
        "Content-Type: ",
        mime,
        CRLF,
        "Content-Length: ",
        length.as_str(),
        CRLF,
        "Cache-Control: ",
        class.cache_control(),
        CRLF,
        match class {
            ContentClass::Code => "Pragma: no-cache\r\nExpires: 0\r\n",
            ContentClass::Static => "",
        },
        "Accept-Ranges: none",
        CRLF,
        "Connection: close",
        CRLF,
        CRLF,
    ]
    .concat()
}

/// 用一次分散写（头部、正文两个缓冲区）发送缓存的响应，处理部分写入。
pub fn send_response<W: Write>(writer: &mut W, response: &CachedResponse) -> io::Result<()> {
    let mut slices = [IoSlice::new(&response.headers), IoSlice::new(&response.body)];
    let mut remaining: &mut [IoSlice<'_>] = &mut slices;

    while !remaining.is_empty() {
        match writer.write_vectored(remaining) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole response",
                ))
            }
            Ok(n) => IoSlice::advance_slices(&mut remaining, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

pub fn send_404<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(NOT_FOUND_RESPONSE)?;
    writer.flush()
}

/// 按扩展名（不区分大小写）查找 MIME 类型。
pub fn get_mime(path: &str) -> &'static str {
    let extension = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => {
            debug!("资源{}没有扩展名，使用{}", path, DEFAULT_MIME);
            return DEFAULT_MIME;
        }
    };
    match MIME_TYPES.get(extension.as_str()) {
        Some(v) => *v,
        None => DEFAULT_MIME,
    }
}
