// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求解析模块
//!
//! 服务器只需要请求行中的路径，因此这里不做完整的 HTTP 解析：
//! 1. 请求至少 15 字节，并以 `GET` 开头，否则视为畸形请求。
//! 2. URI 从第 4 个字节开始，到第一个空格或 `?` 为止（查询串被忽略）。
//! 3. 只有 URI 中出现 `%` 或 `+` 时才做百分号解码。

use crate::exception::Exception;
use log::debug;

/// 每个连接只读取一次，缓冲区大小为 8 KiB。
pub const REQUEST_BUFFER_SIZE: usize = 8192;

/// 最短的合法请求长度，`GET / HTTP/1.1` 加上换行恰好超过该值。
pub const MIN_REQUEST_LEN: usize = 15;

/// 请求的目标资源。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `GET /`，直接返回入口页面
    Root,
    /// 需要在缓存中精确查找的路径，带前导 `/`
    Path(String),
    /// 解码后不是合法 UTF-8 的路径，不可能命中缓存
    Invalid,
}

impl RequestTarget {
    /// 从一次读取得到的原始字节中解析请求目标。
    ///
    /// 返回 `Exception::MalformedRequest` 时调用方应直接关闭连接，不发送任何响应。
    pub fn parse(buffer: &[u8], id: u64) -> Result<Self, Exception> {
        if buffer.len() < MIN_REQUEST_LEN {
            debug!("[ID{}]请求过短：{}字节", id, buffer.len());
            return Err(Exception::MalformedRequest);
        }
        if !buffer.starts_with(b"GET") {
            debug!("[ID{}]不支持的请求方法", id);
            return Err(Exception::MalformedRequest);
        }

        let rest = &buffer[4..];
        let end = rest
            .iter()
            .position(|&b| matches!(b, b' ' | b'?' | b'\r' | b'\n'))
            .unwrap_or(rest.len());
        let uri = &rest[..end];

        if uri == b"/" {
            return Ok(RequestTarget::Root);
        }

        let path = if needs_url_decode(uri) {
            String::from_utf8(url_decode(uri))
        } else {
            String::from_utf8(uri.to_vec())
        };
        match path {
            Ok(p) => Ok(RequestTarget::Path(p)),
            Err(_) => {
                debug!("[ID{}]请求路径不是合法的UTF-8", id);
                Ok(RequestTarget::Invalid)
            }
        }
    }
}

pub fn needs_url_decode(uri: &[u8]) -> bool {
    uri.iter().any(|&b| b == b'%' || b == b'+')
}

/// 百分号解码：`+` 变为空格，`%XY` 变为对应字节，非法的转义序列原样保留。
pub fn url_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (
                input.get(i + 1).and_then(|&b| hex_value(b)),
                input.get(i + 2).and_then(|&b| hex_value(b)),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push((hi << 4) | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
