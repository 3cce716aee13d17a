//! 一次性工蜂：执行单个任务，回传结果后退出

use super::channel::Channel;
use super::signals::{self, TimeoutAlarm};
use super::{execute, into_task, Drone, DroneBuilder, DroneStatus, Task};
use crate::proto::Codec;
use crate::{BeforeHook, Result};
use log::error;
use serde::Serialize;
use std::fmt;

impl<C: Codec> DroneBuilder<C> {
    /// Fork a drone that runs `task` once.
    ///
    /// The returned drone is already [`DroneStatus::Active`]; its single
    /// result is read with [`Drone::get_output`] or [`Drone::wait_output`].
    pub fn spawn<T, E, F>(&self, task: F) -> Result<Drone<T, C>>
    where
        T: Serialize + 'static,
        E: fmt::Display,
        F: FnOnce() -> std::result::Result<T, E> + 'static,
    {
        self.spawn_task(None, into_task(task))
    }

    /// Like [`spawn`](Self::spawn), running `before` in the child first.
    pub fn spawn_with_hook<T, E, F>(&self, before: BeforeHook, task: F) -> Result<Drone<T, C>>
    where
        T: Serialize + 'static,
        E: fmt::Display,
        F: FnOnce() -> std::result::Result<T, E> + 'static,
    {
        self.spawn_task(Some(before), into_task(task))
    }

    pub(crate) fn spawn_task<T: Serialize>(
        &self,
        before: Option<BeforeHook>,
        task: Task<T>,
    ) -> Result<Drone<T, C>> {
        let timeout_secs = self.get_config().timeout_secs;
        let (pid, channel) =
            self.fork_with(move |channel| run_once(channel, timeout_secs, before, task))?;
        Ok(Drone::new(pid, DroneStatus::Active, channel))
    }
}

fn run_once<T: Serialize, C: Codec>(
    mut channel: Channel<C>,
    timeout_secs: u32,
    before: Option<BeforeHook>,
    task: Task<T>,
) -> i32 {
    if let Err(e) = signals::install(&channel, timeout_secs) {
        error!("drone setup failed: {}", e);
        return 1;
    }

    let alarm = TimeoutAlarm::new(timeout_secs);
    alarm.arm();
    let result = execute(before.as_ref(), task);
    alarm.disarm();

    match channel.send(&result) {
        Ok(()) => 0,
        Err(e) => {
            error!("drone failed to send result: {}", e);
            1
        }
    }
}
