// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 资源混淆与并行解密模块
//!
//! 容器中的每个资源使用与位置相关的 XOR 流进行混淆：
//!
//! ```text
//! key_index = (i + (i >> 8)) % 32
//! plain[i]  = cipher[i] ^ key[key_index]
//! ```
//!
//! 密钥序列每 256 字节折叠一次。**这只是防止随手查看的混淆，不提供任何机密性**：
//! 密钥就存放在同一个文件里。保留该算法仅为了与已有容器文件逐字节兼容。
//! 运算是对称的，同一个函数既用于加密也用于解密。
//!
//! 解密阶段是一次 fork-join：记录按步长分配给各工作线程，线程之间没有共享的
//! 可变状态，因此不需要任何锁或原子操作。

use std::thread;

use log::debug;

use crate::{container::AssetRecord, param::KEY_LEN};

/// 每个解密线程至少分到的记录数。
const RECORDS_PER_WORKER: usize = 50;

/// 对一段数据原地执行 XOR 混淆/解混淆。偏移量从 0 开始计算。
pub fn xor_in_place(data: &mut [u8], key: &[u8; KEY_LEN]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(i + (i >> 8)) % KEY_LEN];
    }
}

/// 根据硬件并发度和记录数决定解密线程数。
///
/// `min(hardware, max(1, records / 50))`，`hardware` 为 0 时按 1 处理。
pub fn worker_count(record_count: usize, hardware: usize) -> usize {
    hardware.max(1).min((record_count / RECORDS_PER_WORKER).max(1))
}

/// 使用自动计算的线程数原地解密全部记录。
pub fn decrypt_all(records: &mut [AssetRecord], key: &[u8; KEY_LEN]) -> usize {
    let workers = worker_count(records.len(), num_cpus::get());
    decrypt_with_workers(records, key, workers)
}

/// 使用指定线程数原地解密全部记录。
///
/// 线程 `t` 处理第 `t, t+n, t+2n, …` 条记录；返回前会等待所有线程结束。
/// 线程数不会超过记录数，返回实际使用的线程数。
/// 注意：分配按记录数而不是字节数均衡，资源大小严重倾斜时单个线程可能承担大部分工作量。
pub fn decrypt_with_workers(records: &mut [AssetRecord], key: &[u8; KEY_LEN], workers: usize) -> usize {
    let workers = workers.max(1).min(records.len().max(1));
    if workers == 1 {
        debug!("单线程解密{}个资源", records.len());
        for record in records.iter_mut() {
            xor_in_place(record.data_mut(), key);
        }
        return workers;
    }

    debug!("使用{}个线程并行解密{}个资源", workers, records.len());

    // 按步长把互不重叠的可变引用分到各个桶中
    let mut buckets: Vec<Vec<&mut AssetRecord>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, record) in records.iter_mut().enumerate() {
        buckets[i % workers].push(record);
    }

    thread::scope(|scope| {
        for bucket in buckets {
            scope.spawn(move || {
                for record in bucket {
                    xor_in_place(record.data_mut(), key);
                }
            });
        }
    });
    workers
}
