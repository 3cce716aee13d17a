//! Zerg rush: 每个任务派出一只一次性工蜂

use crate::config::ConfigError;
use crate::drone::{into_task, Drone, DroneBuilder, Task};
use crate::proto::{BincodeCodec, Codec, TaskResult};
use crate::{BeforeHook, BoxError, PoolError, Result};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// An ordered batch of tasks, each run in its own short-lived drone.
///
/// Outputs always come back in task order.
pub struct ZergRush<T, C: Codec = BincodeCodec> {
    builder: DroneBuilder<C>,
    before: Option<BeforeHook>,
    tasks: Vec<Task<T>>,
    drones: Vec<Drone<T, C>>,
    started: bool,
}

impl<T, C: Codec> fmt::Debug for ZergRush<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZergRush")
            .field("pending", &self.tasks.len())
            .field("drones", &self.drones)
            .field("started", &self.started)
            .finish()
    }
}

impl<T: 'static> Default for ZergRush<T, BincodeCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> ZergRush<T, BincodeCodec> {
    pub fn new() -> Self {
        Self {
            builder: DroneBuilder::new(),
            before: None,
            tasks: Vec::new(),
            drones: Vec::new(),
            started: false,
        }
    }

    /// Batch built from an iterator of closures, kept in iteration order.
    pub fn add<It, F, E>(tasks: It) -> Self
    where
        It: IntoIterator<Item = F>,
        F: FnOnce() -> std::result::Result<T, E> + 'static,
        E: fmt::Display,
    {
        tasks.into_iter().fold(Self::new(), |rush, task| rush.task(task))
    }
}

impl<T: 'static, C: Codec> ZergRush<T, C> {
    /// Append one task.
    pub fn task<F, E>(mut self, task: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, E> + 'static,
        E: fmt::Display,
    {
        self.tasks.push(into_task(task));
        self
    }

    /// Per-drone timeout in seconds, `0` disables it.
    pub fn timeout(mut self, secs: u32) -> Self {
        self.builder = self.builder.timeout(secs);
        self
    }

    /// Hook run in every child before its task.
    pub fn before_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    /// Spawn drones with a custom builder (config, packer, codec).
    ///
    /// A timeout set earlier with [`timeout`](Self::timeout) is kept unless
    /// `builder` sets its own.
    pub fn with_builder<D: Codec>(self, mut builder: DroneBuilder<D>) -> ZergRush<T, D> {
        let timeout = self.builder.get_config().timeout_secs;
        if builder.get_config().timeout_secs == 0 && timeout > 0 {
            builder = builder.timeout(timeout);
        }
        ZergRush {
            builder,
            before: self.before,
            tasks: self.tasks,
            drones: Vec::new(),
            started: self.started,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len() + self.drones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drones in task order, once [`run`](Self::run) has been called.
    pub fn drones(&self) -> &[Drone<T, C>] {
        &self.drones
    }

    /// The drone running task `index`.
    pub fn drone_mut(&mut self, index: usize) -> Option<&mut Drone<T, C>> {
        self.drones.get_mut(index)
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PoolError::TasksAlreadyInProcess);
        }
        self.started = true;
        Ok(())
    }
}

impl<T: Serialize + 'static, C: Codec> ZergRush<T, C> {
    /// 为每个任务派出一只工蜂
    pub fn run(&mut self) -> Result<&mut Self> {
        self.start()?;
        info!("zerg rush: spawning {} drones", self.tasks.len());
        for task in std::mem::take(&mut self.tasks) {
            let drone = self.builder.spawn_task(self.before.clone(), task)?;
            self.drones.push(drone);
        }
        Ok(self)
    }
}

impl<T: DeserializeOwned, C: Codec> ZergRush<T, C> {
    /// Wait for every drone in task order. `timeout` applies to each drone.
    pub fn wait_output(&mut self, poll_interval: Duration, timeout: Duration) -> Result<Vec<TaskResult<T>>> {
        self.drones
            .iter_mut()
            .map(|drone| drone.wait_output(poll_interval, timeout))
            .collect()
    }
}

impl<T: Serialize + DeserializeOwned + 'static, C: Codec> ZergRush<T, C> {
    /// Run the batch at most `limit` drones at a time.
    ///
    /// Each chunk is fully awaited before the next one starts.
    pub fn run_with_process_limitation(
        &mut self,
        limit: usize,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<TaskResult<T>>> {
        if limit == 0 {
            return Err(ConfigError::ZeroProcessLimit.into());
        }
        self.start()?;

        let mut pending = std::mem::take(&mut self.tasks);
        let mut outputs = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let take = limit.min(pending.len());
            let chunk: Vec<Task<T>> = pending.drain(..take).collect();
            debug!("zerg rush: running chunk of {}", chunk.len());

            let mut drones = Vec::with_capacity(chunk.len());
            for task in chunk {
                drones.push(self.builder.spawn_task(self.before.clone(), task)?);
            }
            for drone in drones.iter_mut() {
                outputs.push(drone.wait_output(poll_interval, wait_timeout)?);
            }
        }
        Ok(outputs)
    }
}
