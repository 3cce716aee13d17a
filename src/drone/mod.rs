//! 工蜂(Drone)节点实现模块
//!
//! 每只工蜂是一个 fork 出来的子进程加上一条 socketpair 通道。
//! 父进程端只做非阻塞轮询，子进程端执行任务后通过通道回传 [`TaskResult`]。

pub mod channel;
pub mod oneshot;
pub mod persistent;
pub mod signals;

pub use self::persistent::PersistentDrone;

use self::channel::{Channel, ChannelError};
use crate::config::DroneConfig;
use crate::proto::{
    default_packer_factory, BincodeCodec, Codec, ExceptionKind, PackerFactory, TaskResult,
    WorkerException,
};
use crate::{BeforeHook, PoolError, ProcessId, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use serde::de::DeserializeOwned;
use socket2::{Domain, Socket, Type};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

/// Exit code of a child whose body panicked outside the task.
const CHILD_PANIC_EXIT: i32 = 101;

/// 工蜂状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroneStatus {
    /// Waiting for a task (persistent drones only).
    Idle,
    /// Running a task.
    Active,
    /// The process is gone.
    Killed,
}

/// How a drone's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    /// `waitpid` could not tell, e.g. the child was already reaped.
    Vanished,
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
            WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
            _ => TerminationReason::Vanished,
        }
    }
}

/// A task as the child runs it: failures are already turned into exceptions.
pub type Task<T> = Box<dyn FnOnce() -> TaskResult<T>>;

/// Box a fallible closure into a [`Task`].
pub fn into_task<T, E, F>(task: F) -> Task<T>
where
    F: FnOnce() -> std::result::Result<T, E> + 'static,
    E: fmt::Display,
{
    Box::new(move || task().map_err(|e| WorkerException::task_failure(&e)))
}

/// Run the hook and the task, turning errors and panics into exceptions.
pub(crate) fn execute<T>(
    before: Option<&BeforeHook>,
    task: impl FnOnce() -> TaskResult<T>,
) -> TaskResult<T> {
    if let Some(hook) = before {
        match panic::catch_unwind(AssertUnwindSafe(|| (**hook)())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(WorkerException::before_hook(&e)),
            Err(payload) => {
                let mut exc = WorkerException::from_panic(payload);
                exc.kind = ExceptionKind::BeforeHook;
                return Err(exc);
            }
        }
    }
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(payload) => Err(WorkerException::from_panic(payload)),
    }
}

/// Parent-side handle of one child process.
///
/// Dropping a drone that is still alive kills and reaps it.
pub struct Drone<T, C: Codec = BincodeCodec> {
    pid: ProcessId,
    status: DroneStatus,
    channel: Channel<C>,
    termination: Option<TerminationReason>,
    _output: PhantomData<fn() -> T>,
}

impl<T, C: Codec> fmt::Debug for Drone<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drone")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("termination", &self.termination)
            .field("channel", &self.channel)
            .finish()
    }
}

impl<T, C: Codec> Drone<T, C> {
    pub(crate) fn new(pid: ProcessId, status: DroneStatus, channel: Channel<C>) -> Self {
        Self {
            pid,
            status,
            channel,
            termination: None,
            _output: PhantomData,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Current status, checking whether the process is still alive first.
    pub fn status(&mut self) -> DroneStatus {
        self.refresh();
        self.status
    }

    pub fn is_alive(&mut self) -> bool {
        self.status() != DroneStatus::Killed
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.status == DroneStatus::Killed
    }

    pub(crate) fn set_status(&mut self, status: DroneStatus) {
        if self.status != DroneStatus::Killed {
            self.status = status;
        }
    }

    pub(crate) fn channel_mut(&mut self) -> &mut Channel<C> {
        &mut self.channel
    }

    /// Reap the child without blocking and record how it ended.
    fn refresh(&mut self) {
        if self.status == DroneStatus::Killed {
            return;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => self.mark_dead(status.into()),
            Err(e) => {
                debug!("waitpid({}) failed: {}", self.pid, e);
                self.mark_dead(TerminationReason::Vanished);
            }
        }
    }

    fn mark_dead(&mut self, reason: TerminationReason) {
        debug!("drone {} terminated: {:?}", self.pid, reason);
        self.status = DroneStatus::Killed;
        self.termination = Some(reason);
    }

    /// `SIGKILL` the child, reap it and close the channel.
    pub fn kill(&mut self) -> Result<()> {
        if self.status != DroneStatus::Killed {
            match signal::kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(PoolError::Signal(e)),
            }
            let reason = reap(self.pid);
            self.mark_dead(reason);
            metrics::counter!("zerg_drones_killed_total").increment(1);
            info!("drone {} killed", self.pid);
        }
        self.channel.close();
        Ok(())
    }
}

impl<T: DeserializeOwned, C: Codec> Drone<T, C> {
    /// One non-blocking look at the channel.
    pub fn get_output(&mut self) -> Result<Option<TaskResult<T>>> {
        self.refresh();
        Ok(self.channel.receive::<TaskResult<T>>()?)
    }

    /// Poll until a result arrives.
    ///
    /// A zero `timeout` waits forever. A drone that dies without replying
    /// yields a `WorkerLost` exception.
    pub fn wait_output(
        &mut self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskResult<T>> {
        let start = Instant::now();
        loop {
            if let Some(result) = self.get_output()? {
                return Ok(result);
            }
            if self.is_killed() {
                warn!("drone {} exited without output", self.pid);
                metrics::counter!("zerg_workers_lost_total").increment(1);
                return Ok(Err(WorkerException::worker_lost(self.pid.as_raw())));
            }
            if !timeout.is_zero() && start.elapsed() >= timeout {
                return Err(PoolError::Timeout(timeout));
            }
            thread::sleep(poll_interval);
        }
    }
}

impl<T, C: Codec> Drop for Drone<T, C> {
    fn drop(&mut self) {
        if self.status != DroneStatus::Killed {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            reap(self.pid);
        }
    }
}

fn reap(pid: ProcessId) -> TerminationReason {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return status.into(),
            Err(Errno::EINTR) => continue,
            Err(_) => return TerminationReason::Vanished,
        }
    }
}

/// 工蜂构造器
#[derive(Clone)]
pub struct DroneBuilder<C: Codec = BincodeCodec> {
    config: DroneConfig,
    packer: PackerFactory,
    codec: C,
}

impl Default for DroneBuilder<BincodeCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl DroneBuilder<BincodeCodec> {
    pub fn new() -> Self {
        Self {
            config: DroneConfig::default(),
            packer: default_packer_factory(),
            codec: BincodeCodec,
        }
    }
}

impl<C: Codec> fmt::Debug for DroneBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DroneBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Codec> DroneBuilder<C> {
    pub fn config(mut self, config: DroneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn get_config(&self) -> &DroneConfig {
        &self.config
    }

    /// Seconds before the alarm kills a running task; `0` disables it.
    pub fn timeout(mut self, secs: u32) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.channel.buffer_size = size;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_micros = interval.as_micros() as u64;
        self
    }

    pub fn packer(mut self, factory: PackerFactory) -> Self {
        self.packer = factory;
        self
    }

    pub fn codec<D: Codec>(self, codec: D) -> DroneBuilder<D> {
        DroneBuilder {
            config: self.config,
            packer: self.packer,
            codec,
        }
    }

    /// Fork a child that runs `body` on its channel end and exits with the
    /// returned code. Returns the child's pid and the parent channel end.
    pub(crate) fn fork_with<B>(&self, body: B) -> Result<(ProcessId, Channel<C>)>
    where
        B: FnOnce(Channel<C>) -> i32,
    {
        self.config.validate()?;
        let (parent_end, child_end) =
            Socket::pair(Domain::UNIX, Type::STREAM, None).map_err(ChannelError::Io)?;
        let channel_config = &self.config.channel;
        let parent = Channel::new(parent_end, channel_config.clone(), self.codec.clone(), &self.packer)?;
        let child = Channel::new(child_end, channel_config.clone(), self.codec.clone(), &self.packer)?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(parent);
                let code = panic::catch_unwind(AssertUnwindSafe(|| body(child)))
                    .unwrap_or(CHILD_PANIC_EXIT);
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child: pid }) => {
                drop(child);
                metrics::counter!("zerg_drones_spawned_total").increment(1);
                debug!("spawned drone {}", pid);
                Ok((pid, parent))
            }
            Err(errno) => {
                error!("fork failed: {}", errno);
                Err(PoolError::ForkFailure(errno))
            }
        }
    }
}
