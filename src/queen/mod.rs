//! Queen模块实现 - 常驻工蜂池调度器
//!
//! 蜂后维护空闲/忙碌两个列表。所有状态迁移都发生在调用方线程里：
//! `has_available_worker`、`has_worker_in_process` 与 `pull_workers_output`
//! 会顺带做一次非阻塞的回收(reconciliation)。

use crate::config::PoolConfig;
use crate::drone::{DroneBuilder, DroneStatus, PersistentDrone};
use crate::proto::{BincodeCodec, Codec, PackerFactory, TaskResult, WorkerException};
use crate::{BeforeHook, BoxError, ChannelError, PoolError, ProcessId, Result};
use log::{debug, info, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 进程池管理结构体
pub struct DronePool<I, O, C: Codec = BincodeCodec> {
    config: PoolConfig,
    builder: DroneBuilder<C>,
    before: Option<BeforeHook>,
    idle: VecDeque<PersistentDrone<I, O, C>>,
    busy: Vec<PersistentDrone<I, O, C>>,
    /// Results in completion order, waiting to be pulled.
    outputs: Vec<TaskResult<O>>,
}

impl<I, O, C: Codec> fmt::Debug for DronePool<I, O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DronePool")
            .field("workers_count", &self.config.workers_count)
            .field("idle", &self.idle.len())
            .field("busy", &self.busy.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl<I, O> DronePool<I, O, BincodeCodec> {
    /// 创建包含 `workers_count` 只工蜂的进程池(尚未启动)
    pub fn create(workers_count: usize) -> Result<Self> {
        Self::with_config(PoolConfig::with_workers(workers_count))
    }

    pub fn with_config(config: PoolConfig) -> Result<Self> {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<I, O, C: Codec> DronePool<I, O, C> {
    pub fn with_codec(config: PoolConfig, codec: C) -> Result<Self> {
        config.validate()?;
        let builder = DroneBuilder::new().config(config.drone.clone()).codec(codec);
        Ok(Self {
            config,
            builder,
            before: None,
            idle: VecDeque::new(),
            busy: Vec::new(),
            outputs: Vec::new(),
        })
    }

    /// Framing strategy for every drone spawned afterwards.
    pub fn packer(mut self, factory: PackerFactory) -> Self {
        self.builder = self.builder.packer(factory);
        self
    }

    /// Hook run once in each drone before it serves its first task.
    pub fn before_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.config.sleep_interval_micros = interval.as_micros() as u64;
        self
    }

    pub fn workers_count(&self) -> usize {
        self.config.workers_count
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.idle
            .iter()
            .chain(self.busy.iter())
            .map(|drone| drone.pid())
            .collect()
    }

    /// 启动全部工蜂
    pub fn run<H, E>(&mut self, handler: H) -> Result<&mut Self>
    where
        I: DeserializeOwned,
        O: Serialize,
        E: fmt::Display,
        H: Fn(I) -> std::result::Result<O, E>,
    {
        if !self.idle.is_empty() || !self.busy.is_empty() {
            return Err(PoolError::PoolAlreadyCreated);
        }
        for _ in 0..self.config.workers_count {
            let drone = self.builder.spawn_persistent(&handler, self.before.clone())?;
            self.idle.push_back(drone);
        }
        info!(
            "drone pool started with {} workers: {:?}",
            self.config.workers_count,
            self.pids()
        );
        Ok(self)
    }

    /// Kill every drone and forget them.
    pub fn destroy(&mut self) {
        for mut drone in self.idle.drain(..).chain(self.busy.drain(..)) {
            if let Err(e) = drone.kill() {
                warn!("failed to kill drone {}: {}", drone.pid(), e);
            }
        }
        metrics::gauge!("zerg_pool_busy_drones").set(0.0);
        info!("drone pool destroyed");
    }

    fn killed_count(&mut self) -> usize {
        self.idle
            .iter_mut()
            .chain(self.busy.iter_mut())
            .map(|drone| drone.status())
            .filter(|status| *status == DroneStatus::Killed)
            .count()
    }
}

impl<I, O: DeserializeOwned, C: Codec> DronePool<I, O, C> {
    /// Harvest finished busy drones without blocking.
    fn check_completions(&mut self) {
        let busy = std::mem::take(&mut self.busy);
        for mut drone in busy {
            match drone.get_output() {
                Ok(Some(result)) => {
                    trace!("drone {} finished a task", drone.pid());
                    metrics::counter!("zerg_tasks_completed_total").increment(1);
                    self.outputs.push(result);
                    self.idle.push_back(drone);
                }
                Ok(None) if drone.is_killed() => {
                    warn!("drone {} died while busy", drone.pid());
                    metrics::counter!("zerg_workers_lost_total").increment(1);
                    self.outputs
                        .push(Err(WorkerException::worker_lost(drone.pid().as_raw())));
                    self.idle.push_back(drone);
                }
                Ok(None) => self.busy.push(drone),
                Err(e) => {
                    warn!("unreadable reply from drone {}: {}", drone.pid(), e);
                    self.outputs.push(Err(WorkerException::task_failure(&e)));
                    self.idle.push_back(drone);
                }
            }
        }
        metrics::gauge!("zerg_pool_busy_drones").set(self.busy.len() as f64);
    }

    /// Whether a live idle drone can take a task right now.
    ///
    /// Fails with [`PoolError::AllWorkersKilled`] once every drone is dead.
    pub fn has_available_worker(&mut self) -> Result<bool> {
        self.check_completions();
        let killed = self.killed_count();
        if killed > 0 && killed == self.config.workers_count {
            return Err(PoolError::AllWorkersKilled);
        }
        Ok(self.idle.iter().any(|drone| !drone.is_killed()))
    }

    pub fn has_worker_in_process(&mut self) -> Result<bool> {
        self.check_completions();
        Ok(!self.busy.is_empty())
    }

    /// Block until no drone is busy.
    pub fn wait(&mut self) -> Result<()> {
        let interval = self.config.sleep_interval();
        while self.has_worker_in_process()? {
            thread::sleep(interval);
        }
        Ok(())
    }

    /// Take every result collected so far, in completion order.
    pub fn pull_workers_output(&mut self) -> Result<Vec<TaskResult<O>>> {
        self.check_completions();
        Ok(std::mem::take(&mut self.outputs))
    }
}

impl<I: Serialize, O: DeserializeOwned, C: Codec> DronePool<I, O, C> {
    /// 将任务派发给第一只空闲工蜂
    ///
    /// Waits up to `wait_timeout` for a drone to free up; zero waits forever.
    pub fn dispatch(&mut self, task: I, wait_timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let interval = self.config.sleep_interval();
        loop {
            if !wait_timeout.is_zero() && start.elapsed() > wait_timeout {
                debug!("no idle drone within {:?}", wait_timeout);
                return Err(PoolError::DispatchTimeout(wait_timeout));
            }
            if self.has_available_worker()? && self.send_to_idle(&task)? {
                return Ok(());
            }
            thread::sleep(interval);
        }
    }

    /// Send `task` to the first live idle drone; `Ok(false)` when none is left.
    ///
    /// A drone whose socket is broken is killed and the next one is tried.
    fn send_to_idle(&mut self, task: &I) -> Result<bool> {
        while let Some(index) = self.idle.iter().position(|drone| !drone.is_killed()) {
            let Some(mut drone) = self.idle.remove(index) else {
                break;
            };
            match drone.dispatch(task) {
                Ok(()) => {
                    self.busy.push(drone);
                    metrics::gauge!("zerg_pool_busy_drones").set(self.busy.len() as f64);
                    return Ok(true);
                }
                Err(PoolError::Channel(ChannelError::Io(e))) => {
                    warn!("drone {} channel broken ({}), dropping it", drone.pid(), e);
                    let killed = drone.kill();
                    self.idle.push_back(drone);
                    killed?;
                }
                Err(e) => {
                    self.idle.push_back(drone);
                    return Err(e);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{self, Signal};

    #[test]
    fn test_broken_drone_is_skipped_on_dispatch() {
        let mut pool: DronePool<i32, i32> = DronePool::create(2).unwrap();
        pool.run(|n: i32| Ok::<_, String>(n + 1)).unwrap();

        // 子进程已退出但尚未被回收，池子还把它当作空闲
        let dead = pool.idle[0].pid();
        signal::kill(dead, Signal::SIGKILL).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(!pool.idle[0].is_killed());

        assert!(pool.send_to_idle(&41).unwrap());
        assert_eq!(pool.busy_count(), 1);
        assert_ne!(pool.busy[0].pid(), dead);
        assert_eq!(pool.idle.len(), 1);
        assert!(pool.idle[0].is_killed());
        assert_eq!(pool.idle[0].pid(), dead);

        pool.wait().unwrap();
        assert_eq!(pool.pull_workers_output().unwrap(), vec![Ok(42)]);

        // 仅剩的一只工蜂照常接活
        pool.dispatch(1, Duration::from_secs(5)).unwrap();
        pool.wait().unwrap();
        assert_eq!(pool.pull_workers_output().unwrap(), vec![Ok(2)]);
        pool.destroy();
    }
}
