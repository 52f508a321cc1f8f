// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 资源存储与加载流水线
//!
//! 启动时的一次性流水线：
//!
//! ```text
//! 容器文件 → read_container（顺序读取密文）
//!          → decrypt（fork-join 并行解密）
//!          → AssetStore（按路径索引，附带 MIME 类型）
//! ```
//!
//! `AssetStore` 实现了 [`AssetProvider`]，供响应缓存构建时按路径取资源。
//! 资源数据以 `Bytes` 保存，缓存中的响应正文直接引用同一块内存。

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
    time::Instant,
};

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::{
    cipher::{decrypt_all, decrypt_with_workers},
    container::{read_container, AssetRecord},
    exception::Exception,
    response::get_mime,
    util::format_file_size,
};

/// 缓存构建时从提供者取得的一个资源。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub data: Bytes,
    pub mime_type: &'static str,
}

impl Asset {
    pub fn new(data: Bytes, mime_type: &'static str) -> Self {
        Self { data, mime_type }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 资源提供者：由嵌入方实现，按相对路径（不带前导 `/`）返回资源。
#[cfg_attr(test, mockall::automock)]
pub trait AssetProvider {
    fn asset(&self, path: &str) -> Option<Asset>;
}

impl<F> AssetProvider for F
where
    F: Fn(&str) -> Option<Asset>,
{
    fn asset(&self, path: &str) -> Option<Asset> {
        self(path)
    }
}

/// 解密后的资源集合，保持容器中的原始顺序。
#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    paths: Vec<String>,
    assets: HashMap<String, Asset>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由已解密的记录构建。路径重复时后出现的记录覆盖先前的记录，位置保持不变。
    pub fn from_records(records: Vec<AssetRecord>) -> Self {
        let mut store = Self {
            paths: Vec::with_capacity(records.len()),
            assets: HashMap::with_capacity(records.len()),
        };
        for record in records {
            let (path, data) = record.into_parts();
            store.insert(path, Bytes::from(data));
        }
        store
    }

    /// 由编译期内嵌的资源数组构建，数据不做拷贝。
    pub fn from_static(entries: &[(&str, &'static [u8])]) -> Self {
        let mut store = Self::new();
        for (path, data) in entries {
            store.insert(path.to_string(), Bytes::from_static(*data));
        }
        store
    }

    pub fn insert(&mut self, path: String, data: Bytes) {
        let asset = Asset::new(data, get_mime(&path));
        if self.assets.contains_key(&path) {
            warn!("资源路径重复：{}，后出现的记录将覆盖之前的记录", path);
        } else {
            self.paths.push(path.clone());
        }
        self.assets.insert(path, asset);
    }

    pub fn get(&self, path: &str) -> Option<&Asset> {
        self.assets.get(path)
    }

    /// 按加载顺序返回所有路径。
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.assets.values().map(|a| a.size() as u64).sum()
    }
}

impl AssetProvider for AssetStore {
    fn asset(&self, path: &str) -> Option<Asset> {
        self.assets.get(path).cloned()
    }
}

/// 一次容器加载的结果。
///
/// `error` 为 `Some` 表示加载中途停止，`store` 中只包含停止前读到的资源；
/// 是否接受这种部分加载由调用方决定。
#[derive(Debug)]
pub struct LoadOutcome {
    pub store: AssetStore,
    pub declared: u32,
    pub loaded: usize,
    pub skipped: u32,
    pub decrypt_workers: usize,
    pub error: Option<Exception>,
}

impl LoadOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// 按部分加载策略判断结果是否可用。完整加载总是可用；
    /// 中途停止时，只有保留了部分结果的错误才能在 `allow_partial` 下继续。
    pub fn is_usable(&self, allow_partial: bool) -> bool {
        match self.error {
            None => true,
            Some(e) => allow_partial && e.keeps_partial_results(),
        }
    }
}

/// 打开容器文件并执行完整的加载流水线。`decrypt_threads` 为 0 时自动决定线程数。
pub fn load_container_file(path: &Path, decrypt_threads: usize) -> Result<LoadOutcome, Exception> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            error!("无法打开资源容器{}：{}", path.display(), e);
            return Err(Exception::ContainerNotFound);
        }
    };
    debug!("打开资源容器：{}", path.display());
    load_container(&mut BufReader::new(file), decrypt_threads)
}

/// 从任意可读可定位的数据源加载容器：顺序读取，随后并行解密。
pub fn load_container<R: Read + Seek>(
    reader: &mut R,
    decrypt_threads: usize,
) -> Result<LoadOutcome, Exception> {
    let start_time = Instant::now();

    // 阶段一：顺序读取（I/O 密集）
    let mut contents = read_container(reader)?;
    let read_elapsed = start_time.elapsed();

    // 阶段二：原地并行解密（CPU 密集）
    let decrypt_workers = match decrypt_threads {
        0 => decrypt_all(&mut contents.records, &contents.key),
        n => decrypt_with_workers(&mut contents.records, &contents.key, n),
    };

    // 阶段三：建立索引
    let loaded = contents.records.len();
    let store = AssetStore::from_records(contents.records);

    info!(
        "已加载{}/{}个资源（{}），跳过{}个，读取{}ms，总用时{}ms",
        loaded,
        contents.declared,
        format_file_size(store.total_bytes()),
        contents.skipped,
        read_elapsed.as_millis(),
        start_time.elapsed().as_millis()
    );
    if let Some(e) = contents.error {
        warn!("资源容器未能完整读取：{}", e);
    }

    Ok(LoadOutcome {
        store,
        declared: contents.declared,
        loaded,
        skipped: contents.skipped,
        decrypt_workers,
        error: contents.error,
    })
}
