//! 配置模块：通道、工蜂与蜂后(Pool)参数
//!
//! 所有配置均可由 JSON 反序列化，并可通过环境变量覆盖：
//!
//! | 变量 | 字段 |
//! |---|---|
//! | `ZERG_WORKERS` | `PoolConfig::workers_count` |
//! | `ZERG_BUFFER_SIZE` | `ChannelConfig::buffer_size` |
//! | `ZERG_TASK_TIMEOUT` | `DroneConfig::timeout_secs` |
//! | `ZERG_POLL_INTERVAL_US` | `DroneConfig::poll_interval_micros` |
//! | `ZERG_WRITE_TIMEOUT_MS` | `ChannelConfig` 写超时 |

use crate::proto::MIN_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_WORKERS: &str = "ZERG_WORKERS";
pub const ENV_BUFFER_SIZE: &str = "ZERG_BUFFER_SIZE";
pub const ENV_TASK_TIMEOUT: &str = "ZERG_TASK_TIMEOUT";
pub const ENV_POLL_INTERVAL_US: &str = "ZERG_POLL_INTERVAL_US";
pub const ENV_WRITE_TIMEOUT_MS: &str = "ZERG_WRITE_TIMEOUT_MS";

/// 配置错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("缓冲区过小: {size} 字节 (至少 {min} 字节)")]
    BufferTooSmall { size: usize, min: usize },
    #[error("工蜂数量必须大于0")]
    NoWorkers,
    #[error("进程数限制必须大于0")]
    ZeroProcessLimit,
    #[error("环境变量 {name} 的值无效: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("配置解析失败: {0}")]
    Parse(String),
}

fn parse_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

/// Socket channel settings shared by both ends of a drone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest chunk written or read at once.
    pub buffer_size: usize,
    pub write_timeout_secs: u64,
    pub write_timeout_micros: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            write_timeout_secs: 5,
            write_timeout_micros: 0,
        }
    }
}

impl ChannelConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Time a single chunk may wait for write readiness.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs) + Duration::from_micros(self.write_timeout_micros)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall {
                size: self.buffer_size,
                min: MIN_BUFFER_SIZE,
            });
        }
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(size) = parse_env(ENV_BUFFER_SIZE)? {
            self.buffer_size = size;
        }
        if let Some(ms) = parse_env::<u64>(ENV_WRITE_TIMEOUT_MS)? {
            self.write_timeout_secs = ms / 1000;
            self.write_timeout_micros = (ms % 1000) * 1000;
        }
        Ok(self)
    }
}

/// 单个工蜂的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Seconds before the alarm kills the drone, `0` disables it.
    pub timeout_secs: u32,
    pub poll_interval_micros: u64,
    pub channel: ChannelConfig,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            poll_interval_micros: 1000,
            channel: ChannelConfig::default(),
        }
    }
}

impl DroneConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_micros)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(secs) = parse_env(ENV_TASK_TIMEOUT)? {
            self.timeout_secs = secs;
        }
        if let Some(us) = parse_env(ENV_POLL_INTERVAL_US)? {
            self.poll_interval_micros = us;
        }
        self.channel = self.channel.with_env_overrides()?;
        Ok(self)
    }
}

/// 蜂后(Pool)配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers_count: usize,
    /// Sleep between two checks while the pool waits.
    pub sleep_interval_micros: u64,
    pub drone: DroneConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers_count: num_cpus::get(),
            sleep_interval_micros: 1000,
            drone: DroneConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers_count: usize) -> Self {
        Self {
            workers_count,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_micros(self.sleep_interval_micros)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        self.drone.validate()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(workers) = parse_env(ENV_WORKERS)? {
            self.workers_count = workers;
        }
        self.drone = self.drone.with_env_overrides()?;
        Ok(self)
    }
}
