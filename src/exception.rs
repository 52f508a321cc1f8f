// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了资源容器加载与 HTTP 服务过程中可能出现的各类异常情况。
//!
//! ## 分类
//! - **容器解析**：魔数错误、记录损坏、数据流截断、单文件超限。
//! - **网络层**：端口绑定失败、监听失败。
//! - **连接层**：请求报文不合法（静默关闭连接，不向客户端返回错误）。
//!
//! 具体的 I/O 细节在出错位置记录到日志中，`Exception` 本身只携带错误类别。

use std::fmt;

/// 加载或服务过程中发生的异常类型。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    /// 容器文件不存在或无法打开。
    ContainerNotFound,
    /// 魔数不匹配，或文件短于头部。致命错误，立即中止加载。
    InvalidFormat,
    /// 路径长度越界或路径不是合法的 UTF-8。中止加载，但保留已读取的记录。
    CorruptRecord,
    /// 读取记录时数据流提前结束。中止加载，但保留已读取的记录。
    TruncatedStream,
    /// 记录声明的大小超过单文件上限。可恢复：跳过该记录后继续。
    OversizedRecord,
    /// 无法绑定监听地址。
    BindFailure,
    /// 无法在已绑定的套接字上开始监听。
    ListenFailure,
    /// 请求过短或不是 GET 请求。
    MalformedRequest,
}

use Exception::*;

impl Exception {
    /// 该错误发生后是否仍可能带有部分加载结果。
    pub fn keeps_partial_results(&self) -> bool {
        matches!(self, CorruptRecord | TruncatedStream)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerNotFound => write!(f, "Asset container could not be opened"),
            InvalidFormat => write!(f, "Invalid asset container (wrong magic header)"),
            CorruptRecord => write!(f, "Corrupt asset record"),
            TruncatedStream => write!(f, "Asset container ended unexpectedly"),
            OversizedRecord => write!(f, "Asset record exceeds the per-file size limit"),
            BindFailure => write!(f, "Couldn't bind the listening socket"),
            ListenFailure => write!(f, "Couldn't listen on the bound socket"),
            MalformedRequest => write!(f, "Malformed HTTP request"),
        }
    }
}

impl std::error::Error for Exception {}
