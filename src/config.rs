//! Index configuration and durability levels
//!
//! 三层配置：
//! - `FlatOptions`: 索引级选项（建索引时给定，写入 MetaPage）
//! - `FlatSettings`: 进程级可调参数（显式传入，不使用全局状态）
//! - `IndexConfig`: 存储层参数（页大小、缓冲池、排序内存、持久性级别）

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// `check` 选项的下限
pub const MIN_RATIO: i32 = 1;
/// `check` / `random_ratio` 的上限
pub const MAX_RATIO: i32 = 100;
/// `check` / `random_ratio` 的默认值
pub const DEFAULT_RATIO: i32 = 50;

/// 持久性级别（Durability Level）
///
/// 决定 WAL 提交后何时 fsync：
/// - Synchronous: 每次页提交立即 fsync
/// - GroupCommit: 累积若干条记录后 fsync（或显式 flush）
/// - NoSync: 只写入 OS 缓冲区（仅用于测试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// 同步模式：每次提交立即 fsync（最安全，最慢）
    Synchronous,

    /// Group Commit：多次提交共享一次 fsync
    GroupCommit {
        /// 单次批量刷盘的最大记录数（默认：64）
        max_batch_size: usize,
    },

    /// 不刷盘：⚠️ 崩溃时会丢失未刷盘的记录，仅用于测试
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::GroupCommit { max_batch_size: 64 }
    }
}

/// Index-level options (the `WITH (...)` clause of the index definition).
///
/// `check` is persisted in the MetaPage `config` field. It does not take part
/// in ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatOptions {
    pub check: i32,
}

impl Default for FlatOptions {
    fn default() -> Self {
        Self { check: DEFAULT_RATIO }
    }
}

impl FlatOptions {
    /// Parse `key=value` pairs, e.g. `[("check", "10")]`.
    ///
    /// With `validate == false` unknown keys are ignored (the host re-reads
    /// stored options that were validated when first written).
    pub fn parse<'a, I>(pairs: I, validate: bool) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            match key.trim().to_ascii_lowercase().as_str() {
                "check" => {
                    let v: i32 = value.trim().parse().map_err(|_| {
                        StorageError::Config(format!(
                            "invalid value for integer option \"check\": {}",
                            value
                        ))
                    })?;
                    opts.check = v;
                }
                other if validate => {
                    return Err(StorageError::Config(format!(
                        "unrecognized parameter \"{}\"",
                        other
                    )));
                }
                _ => {}
            }
        }
        if validate {
            opts.validate()?;
        }
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        check_range("check", self.check)
    }
}

/// Process-wide tunables, passed explicitly to each index handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSettings {
    /// Percentage (1..=100) of the total scan cost charged before the first
    /// row; used by cost estimation only.
    pub random_ratio: i32,
}

impl Default for FlatSettings {
    fn default() -> Self {
        Self { random_ratio: DEFAULT_RATIO }
    }
}

impl FlatSettings {
    pub fn with_random_ratio(random_ratio: i32) -> Result<Self> {
        check_range("random_ratio", random_ratio)?;
        Ok(Self { random_ratio })
    }
}

fn check_range(name: &str, value: i32) -> Result<()> {
    if !(MIN_RATIO..=MAX_RATIO).contains(&value) {
        return Err(StorageError::Config(format!(
            "value {} out of bounds for option \"{}\" (valid range is {}..{})",
            value, name, MIN_RATIO, MAX_RATIO
        )));
    }
    Ok(())
}

/// 存储层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// 页大小（字节），默认 8KB
    pub page_size: usize,

    /// 缓冲池容量（页数），超过后按 LRU 淘汰未被 pin 的页
    pub buffer_capacity: usize,

    /// 外部排序可用内存（字节），超过后溢写到临时文件
    pub work_mem: usize,

    /// 持久性级别
    pub durability: DurabilityLevel,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: 8192,
            buffer_capacity: 1024,
            work_mem: 4 * 1024 * 1024, // 4MB
            durability: DurabilityLevel::default(),
        }
    }
}

impl IndexConfig {
    /// 创建测试用配置（最快）
    pub fn for_testing() -> Self {
        Self {
            durability: DurabilityLevel::NoSync,
            ..Default::default()
        }
    }

    /// 创建最安全的配置
    pub fn for_safety() -> Self {
        Self {
            durability: DurabilityLevel::Synchronous,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1024..=32768).contains(&self.page_size) || !self.page_size.is_power_of_two() {
            return Err(StorageError::Config(format!(
                "page_size must be a power of two in 1024..=32768, got {}",
                self.page_size
            )));
        }
        if self.buffer_capacity < 4 {
            return Err(StorageError::Config(format!(
                "buffer_capacity must be at least 4 pages, got {}",
                self.buffer_capacity
            )));
        }
        if self.work_mem < 64 * 1024 {
            return Err(StorageError::Config(format!(
                "work_mem must be at least 64kB, got {}",
                self.work_mem
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durability_presets() {
        assert_eq!(DurabilityLevel::default(), DurabilityLevel::GroupCommit { max_batch_size: 64 });
        assert_eq!(IndexConfig::for_testing().durability, DurabilityLevel::NoSync);
        assert_eq!(IndexConfig::default().page_size, 8192);
    }

    #[test]
    fn test_options_parse() {
        let opts = FlatOptions::parse([("check", "10")], true).unwrap();
        assert_eq!(opts.check, 10);

        let opts = FlatOptions::parse(std::iter::empty(), true).unwrap();
        assert_eq!(opts.check, DEFAULT_RATIO);

        assert!(FlatOptions::parse([("check", "0")], true).is_err());
        assert!(FlatOptions::parse([("check", "101")], true).is_err());
        assert!(FlatOptions::parse([("check", "abc")], true).is_err());
        assert!(FlatOptions::parse([("lists", "10")], true).is_err());
        assert!(FlatOptions::parse([("lists", "10")], false).is_ok());
    }

    #[test]
    fn test_settings_range() {
        assert_eq!(FlatSettings::default().random_ratio, 50);
        assert!(FlatSettings::with_random_ratio(1).is_ok());
        assert!(FlatSettings::with_random_ratio(100).is_ok());
        assert!(FlatSettings::with_random_ratio(0).is_err());
    }

    #[test]
    fn test_index_config_validate() {
        assert!(IndexConfig::default().validate().is_ok());
        let bad = IndexConfig { page_size: 3000, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = IndexConfig { buffer_capacity: 1, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
