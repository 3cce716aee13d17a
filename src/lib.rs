//! ZergHive 核心库入口
//!
//! 在独立的子进程(工蜂/Drone)中执行任务，由单一的父进程(蜂后/Queen)协调：
//!
//! - [`proto`]: 帧格式(`0x02` + 大端长度 + 负载)、编解码器与任务结果消息
//! - [`DroneBuilder`]: fork 子进程并通过 socketpair 通道交换消息
//! - [`DronePool`]: 固定数量常驻工蜂的调度器
//! - [`ZergRush`]: 每个任务一个一次性工蜂的批量执行器

pub mod config;
pub mod proto;
mod drone;
mod queen;
mod zerg;

use std::time::Duration;

/// 进程标识类型
pub type ProcessId = nix::unistd::Pid;

/// 任务闭包可返回的装箱错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 子进程执行任务前运行的钩子
pub type BeforeHook = std::sync::Arc<dyn Fn() -> std::result::Result<(), BoxError> + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("创建子进程失败: {0}")]
    ForkFailure(nix::errno::Errno),

    #[error("配置无效: {0}")]
    InvalidConfiguration(#[from] config::ConfigError),

    #[error("等待空闲工蜂超时 ({0:?})")]
    DispatchTimeout(Duration),

    #[error("等待工蜂输出超时 ({0:?})")]
    Timeout(Duration),

    #[error("所有工蜂均已死亡")]
    AllWorkersKilled,

    #[error("工蜂池已创建")]
    PoolAlreadyCreated,

    #[error("任务已在执行中")]
    TasksAlreadyInProcess,

    #[error("通道错误: {0}")]
    Channel(#[from] ChannelError),

    #[error("安装信号处理器失败: {0}")]
    Signal(nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// 公开导出模块的公共接口
pub use config::{ChannelConfig, ConfigError, DroneConfig, PoolConfig};
pub use drone::channel::{Channel, ChannelError};
pub use drone::persistent::PersistentDrone;
pub use drone::{Drone, DroneBuilder, DroneStatus, TerminationReason};
pub use proto::{ExceptionKind, TaskResult, WorkerException};
pub use queen::DronePool;
pub use zerg::ZergRush;
