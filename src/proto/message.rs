//! 任务结果消息：成功值或带类型的工蜂异常

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;

/// What a drone reports back for one task.
///
/// Task failures never crash the supervisor; they arrive as the `Err` side of
/// this result and the caller branches on it.
pub type TaskResult<T> = Result<T, WorkerException>;

/// Category of a [`WorkerException`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// The task returned an error.
    TaskFailure,
    /// The task panicked.
    TaskPanic,
    /// The drone's alarm fired before the task finished; the drone is gone.
    WorkerTimeout,
    /// The shared before-execution hook failed.
    BeforeHook,
    /// The drone process died without replying.
    WorkerLost,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::TaskFailure => "task failure",
            ExceptionKind::TaskPanic => "task panic",
            ExceptionKind::WorkerTimeout => "worker timeout",
            ExceptionKind::BeforeHook => "before hook failure",
            ExceptionKind::WorkerLost => "worker lost",
        };
        f.write_str(name)
    }
}

/// 工蜂异常消息
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} ({class}): {message}")]
pub struct WorkerException {
    pub kind: ExceptionKind,
    /// Type name of the original error, or `panic`.
    pub class: String,
    pub message: String,
    pub stacktrace: String,
}

impl WorkerException {
    pub fn new(kind: ExceptionKind, class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: class.into(),
            message: message.into(),
            stacktrace: String::new(),
        }
    }

    /// Wrap an error returned by a task.
    pub fn task_failure<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::new(
            ExceptionKind::TaskFailure,
            std::any::type_name::<E>(),
            error.to_string(),
        )
        .with_backtrace()
    }

    /// Wrap the payload caught from a panicking task.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(ExceptionKind::TaskPanic, "panic", message).with_backtrace()
    }

    pub fn before_hook<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::new(ExceptionKind::BeforeHook, "before_hook", error.to_string()).with_backtrace()
    }

    pub fn timeout(seconds: u32) -> Self {
        Self::new(
            ExceptionKind::WorkerTimeout,
            "WorkerTimeout",
            format!("Worker killed by timeout: {} seconds.", seconds),
        )
    }

    pub fn worker_lost(pid: i32) -> Self {
        Self::new(
            ExceptionKind::WorkerLost,
            "WorkerLost",
            format!("drone {} exited without replying", pid),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ExceptionKind::WorkerTimeout
    }

    fn with_backtrace(mut self) -> Self {
        self.stacktrace = Backtrace::capture().to_string();
        self
    }
}
