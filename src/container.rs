// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 资源容器读写模块
//!
//! 容器是把整个 Web 应用打包成的单个文件，格式如下（整数均为小端序）：
//!
//! ```text
//! magic:      9 字节 "GEMCORE1\0"
//! key:        32 字节混淆密钥
//! fileCount:  u32
//! 重复 fileCount 次：
//!   pathLen:  u32 (1..=4096)
//!   path:     pathLen 字节 UTF-8，无 NUL 结尾
//!   size:     u64 明文大小（密文等长）
//!   data:     size 字节密文
//! ```
//!
//! 容器来自磁盘，必须当作不可信输入解析：路径长度有上下限，超过单文件上限的
//! 记录在分配内存之前就被跳过。

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::{debug, error, warn};

use crate::{
    cipher::xor_in_place,
    exception::Exception,
    param::{KEY_LEN, MAGIC, MAX_ASSET_SIZE, MAX_PATH_LEN},
    util::format_file_size,
};

/// 容器中的一条资源记录。解密在 `data` 上原地进行，不保留额外副本。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    path: String,
    data: Vec<u8>,
}

impl AssetRecord {
    pub fn new(path: String, data: Vec<u8>) -> Self {
        Self { path, data }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.path, self.data)
    }
}

/// 一次容器解析的结果。
///
/// `error` 为 `Some` 时表示解析中途停止（`CorruptRecord` 或 `TruncatedStream`），
/// `records` 中仍保留停止前成功读取的记录，由调用方决定是否接受部分加载。
#[derive(Debug)]
pub struct ContainerContents {
    pub key: [u8; KEY_LEN],
    pub declared: u32,
    pub records: Vec<AssetRecord>,
    pub skipped: u32,
    pub error: Option<Exception>,
}

impl ContainerContents {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// 读取并校验头部，然后逐条读取原始（仍为密文的）记录。
///
/// 只有魔数错误或头部不完整时返回 `Err`；记录级错误会体现在返回值的 `error` 字段中。
pub fn read_container<R: Read + Seek>(reader: &mut R) -> Result<ContainerContents, Exception> {
    let mut magic = [0u8; MAGIC.len()];
    if let Err(e) = reader.read_exact(&mut magic) {
        error!("无法读取容器头部：{}", e);
        return Err(Exception::InvalidFormat);
    }
    if &magic != MAGIC {
        error!("容器魔数不匹配，不是合法的资源容器");
        return Err(Exception::InvalidFormat);
    }

    let mut key = [0u8; KEY_LEN];
    if let Err(e) = reader.read_exact(&mut key) {
        error!("无法读取容器密钥：{}", e);
        return Err(Exception::TruncatedStream);
    }

    let declared = match read_u32(reader) {
        Ok(n) => n,
        Err(e) => {
            error!("无法读取容器记录数：{}", e);
            return Err(Exception::TruncatedStream);
        }
    };
    debug!("容器声明了{}条资源记录", declared);

    let mut contents = ContainerContents {
        key,
        declared,
        // 记录数来自不可信输入，预分配量需要封顶
        records: Vec::with_capacity(declared.min(4096) as usize),
        skipped: 0,
        error: None,
    };

    for index in 0..declared {
        match read_record(reader, index, declared) {
            Ok(record) => contents.records.push(record),
            Err(Exception::OversizedRecord) => contents.skipped += 1,
            Err(e) => {
                contents.error = Some(e);
                break;
            }
        }
    }

    if contents.skipped > 0 {
        warn!("跳过了{}个超出大小上限的资源", contents.skipped);
    }
    Ok(contents)
}

/// 读取一条记录。
///
/// 超出大小上限的记录返回 `OversizedRecord`，此时数据区已被跳过，可以继续读取下一条。
fn read_record<R: Read + Seek>(
    reader: &mut R,
    index: u32,
    declared: u32,
) -> Result<AssetRecord, Exception> {
    let path_len = match read_u32(reader) {
        Ok(n) => n,
        Err(e) => {
            error!("读取第{}/{}条记录的路径长度失败：{}", index, declared, e);
            return Err(Exception::TruncatedStream);
        }
    };
    if path_len == 0 || path_len > MAX_PATH_LEN {
        error!("第{}条记录的路径长度非法：{}", index, path_len);
        return Err(Exception::CorruptRecord);
    }

    let mut path_bytes = vec![0u8; path_len as usize];
    if let Err(e) = reader.read_exact(&mut path_bytes) {
        error!("读取第{}条记录的路径失败：{}", index, e);
        return Err(Exception::TruncatedStream);
    }
    let path = match String::from_utf8(path_bytes) {
        Ok(p) => p,
        Err(_) => {
            error!("第{}条记录的路径不是合法的UTF-8", index);
            return Err(Exception::CorruptRecord);
        }
    };

    let size = match read_u64(reader) {
        Ok(n) => n,
        Err(e) => {
            error!("读取资源{}的大小失败：{}", path, e);
            return Err(Exception::TruncatedStream);
        }
    };

    if size > MAX_ASSET_SIZE {
        warn!("资源过大：{} ({}，已跳过)", path, format_file_size(size));
        // 跳过数据区，不分配内存
        let skip = match i64::try_from(size) {
            Ok(n) => n,
            Err(_) => return Err(Exception::TruncatedStream),
        };
        if let Err(e) = reader.seek(SeekFrom::Current(skip)) {
            error!("跳过资源{}的数据失败：{}", path, e);
            return Err(Exception::TruncatedStream);
        }
        return Err(Exception::OversizedRecord);
    }

    let mut data = vec![0u8; size as usize];
    if let Err(e) = reader.read_exact(&mut data) {
        error!("读取资源{}的数据失败：{}", path, e);
        return Err(Exception::TruncatedStream);
    }

    Ok(AssetRecord::new(path, data))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// 把 `(路径, 明文)` 列表写成容器，数据使用同一混淆算法加密。
pub fn write_container<W: Write>(
    writer: &mut W,
    key: &[u8; KEY_LEN],
    entries: &[(&str, &[u8])],
) -> io::Result<()> {
    let count = u32::try_from(entries.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many assets"))?;

    writer.write_all(MAGIC)?;
    writer.write_all(key)?;
    writer.write_all(&count.to_le_bytes())?;

    for (path, data) in entries {
        let path_len = match u32::try_from(path.len()) {
            Ok(n) if n > 0 && n <= MAX_PATH_LEN => n,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid asset path length: {}", path.len()),
                ))
            }
        };
        writer.write_all(&path_len.to_le_bytes())?;
        writer.write_all(path.as_bytes())?;
        writer.write_all(&(data.len() as u64).to_le_bytes())?;

        let mut encrypted = data.to_vec();
        xor_in_place(&mut encrypted, key);
        writer.write_all(&encrypted)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        for (i, k) in key.iter_mut().enumerate() {
            *k = 0xA5 ^ (i as u8);
        }
        key
    }

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_container(&mut buf, &key(), entries).unwrap();
        buf
    }

    /// 手工拼接一条记录头，便于构造非法数据
    fn push_record_header(buf: &mut Vec<u8>, path: &[u8], size: u64) {
        buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&size.to_le_bytes());
    }

    fn header(count: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&key());
        buf.extend_from_slice(&count.to_le_bytes());
        buf
    }

    #[test]
    fn test_read_valid_container() {
        let bytes = build(&[("index.html", b"<html></html>"), ("img/a.png", b"\x01\x02\x03")]);
        let contents = read_container(&mut Cursor::new(bytes)).unwrap();

        assert!(contents.is_complete());
        assert_eq!(contents.declared, 2);
        assert_eq!(contents.skipped, 0);
        assert_eq!(contents.key, key());
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.records[0].path(), "index.html");
        assert_eq!(contents.records[1].path(), "img/a.png");
        // 读取阶段数据仍是密文
        assert_ne!(contents.records[0].data(), b"<html></html>");
        assert_eq!(contents.records[0].data().len(), 13);
    }

    #[test]
    fn test_wrong_magic() {
        let mut bytes = build(&[("a.txt", b"a")]);
        bytes[0] = b'X';
        let result = read_container(&mut Cursor::new(bytes));
        assert_eq!(result.unwrap_err(), Exception::InvalidFormat);
    }

    #[test]
    fn test_short_header_is_invalid_format() {
        let result = read_container(&mut Cursor::new(b"GEMC".to_vec()));
        assert_eq!(result.unwrap_err(), Exception::InvalidFormat);
    }

    #[test]
    fn test_missing_count_is_truncated() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&key());
        let result = read_container(&mut Cursor::new(bytes));
        assert_eq!(result.unwrap_err(), Exception::TruncatedStream);
    }

    #[test]
    fn test_zero_path_length_is_corrupt() {
        let mut bytes = build(&[("ok.txt", b"ok")]);
        // 把记录数改为 2，并追加一条路径长度为 0 的记录
        bytes[MAGIC.len() + KEY_LEN..MAGIC.len() + KEY_LEN + 4].copy_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(contents.error, Some(Exception::CorruptRecord));
        assert_eq!(contents.records.len(), 1);
        assert_eq!(contents.records[0].path(), "ok.txt");
    }

    #[test]
    fn test_path_length_over_limit_is_corrupt() {
        let mut bytes = header(1);
        bytes.extend_from_slice(&(MAX_PATH_LEN + 1).to_le_bytes());
        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(contents.error, Some(Exception::CorruptRecord));
        assert!(contents.records.is_empty());
    }

    #[test]
    fn test_non_utf8_path_is_corrupt() {
        let mut bytes = header(1);
        push_record_header(&mut bytes, &[0xFF, 0xFE], 0);
        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(contents.error, Some(Exception::CorruptRecord));
    }

    #[test]
    fn test_truncated_data_keeps_earlier_records() {
        let mut bytes = build(&[("first.js", b"let a = 1;"), ("second.js", b"let b = 2;")]);
        bytes.truncate(bytes.len() - 3);

        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(contents.error, Some(Exception::TruncatedStream));
        assert_eq!(contents.records.len(), 1);
        assert_eq!(contents.records[0].path(), "first.js");
    }

    #[test]
    fn test_oversized_record_is_skipped_without_allocation() {
        let oversized = MAX_ASSET_SIZE + 1;
        let mut bytes = header(2);
        push_record_header(&mut bytes, b"huge.bin", oversized);
        // 临时文件中留出一段空洞作为数据区，之后再追加一条正常记录
        let after_huge = bytes.len() as u64 + oversized;
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&bytes).unwrap();
        file.seek(SeekFrom::Start(after_huge)).unwrap();
        let mut tail = Vec::new();
        push_record_header(&mut tail, b"small.txt", 2);
        let mut payload = b"hi".to_vec();
        xor_in_place(&mut payload, &key());
        tail.extend_from_slice(&payload);
        file.write_all(&tail).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let contents = read_container(&mut file).unwrap();
        assert!(contents.is_complete());
        assert_eq!(contents.skipped, 1);
        assert_eq!(contents.records.len(), 1);
        assert_eq!(contents.records[0].path(), "small.txt");
    }

    #[test]
    fn test_oversized_record_reports_variant_and_skips_data() {
        let mut bytes = Vec::new();
        push_record_header(&mut bytes, b"movie.webm", MAX_ASSET_SIZE + 1);
        let header_len = bytes.len() as u64;
        let mut cursor = Cursor::new(bytes);

        let result = read_record(&mut cursor, 0, 1);
        assert_eq!(result, Err(Exception::OversizedRecord));
        // 数据区已跳过，读取位置指向下一条记录
        assert_eq!(cursor.position(), header_len + MAX_ASSET_SIZE + 1);
    }

    #[test]
    fn test_oversized_record_at_end_of_stream() {
        let mut bytes = header(2);
        push_record_header(&mut bytes, b"huge.bin", MAX_ASSET_SIZE + 10);

        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        // 跳过后已经没有下一条记录可读
        assert_eq!(contents.skipped, 1);
        assert_eq!(contents.error, Some(Exception::TruncatedStream));
        assert!(contents.records.is_empty());
    }

    #[test]
    fn test_empty_asset_is_allowed() {
        let bytes = build(&[("empty.txt", b"")]);
        let contents = read_container(&mut Cursor::new(bytes)).unwrap();
        assert!(contents.is_complete());
        assert_eq!(contents.records[0].data().len(), 0);
    }

    #[test]
    fn test_write_rejects_empty_path() {
        let mut buf = Vec::new();
        let result = write_container(&mut buf, &key(), &[("", b"x")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_write_rejects_overlong_path() {
        let long = "a".repeat(MAX_PATH_LEN as usize + 1);
        let mut buf = Vec::new();
        let result = write_container(&mut buf, &key(), &[(long.as_str(), b"x")]);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);

        let longest = "b".repeat(MAX_PATH_LEN as usize);
        assert!(write_container(&mut Vec::new(), &key(), &[(longest.as_str(), b"x")]).is_ok());
    }
}
