//! Checksum 验证模块
//!
//! 页面与 WAL 记录的完整性校验（CRC32），防止静默损坏。
//!
//! ## 使用场景
//! - 页面写回磁盘前计算校验和，读入时验证
//! - WAL 记录（整页镜像）校验，恢复时跳过损坏记录

use crc32fast::Hasher;

/// Checksum 计算器（IEEE CRC32，crc32fast 硬件加速）
pub struct Checksum;

impl Checksum {
    /// 计算数据的 checksum
    pub fn compute(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    /// 验证数据的 checksum
    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }

        Ok(())
    }

    /// 计算页面 checksum：跳过页面内存放 checksum 本身的 4 字节
    ///
    /// `hole` 为 checksum 字段在页面内的字节范围。
    pub fn compute_page(page: &[u8], hole: std::ops::Range<usize>) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&page[..hole.start]);
        hasher.update(&page[hole.end..]);
        hasher.finalize()
    }
}

/// Checksum 错误类型
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },
}

impl From<ChecksumError> for crate::StorageError {
    fn from(err: ChecksumError) -> Self {
        crate::StorageError::Corruption(err.to_string())
    }
}
