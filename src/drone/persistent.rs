//! 常驻工蜂：循环 接收任务 → 执行 → 回传结果

use super::channel::{Channel, ChannelError};
use super::signals::{self, TimeoutAlarm};
use super::{execute, Drone, DroneBuilder, DroneStatus, TerminationReason};
use crate::config::DroneConfig;
use crate::proto::{BincodeCodec, Codec, TaskResult, WorkerException};
use crate::{BeforeHook, ProcessId, Result};
use log::{debug, error, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::thread;
use std::time::Duration;

/// A long-lived drone taking tasks of type `I` and answering with `O`.
pub struct PersistentDrone<I, O, C: Codec = BincodeCodec> {
    drone: Drone<O, C>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, C: Codec> fmt::Debug for PersistentDrone<I, O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PersistentDrone").field(&self.drone).finish()
    }
}

impl<C: Codec> DroneBuilder<C> {
    /// Fork a drone serving tasks with `handler` until its parent closes the
    /// channel or kills it.
    ///
    /// `before` runs once in the child. If it fails, the first task the drone
    /// receives is answered with that `BeforeHook` exception and later tasks
    /// run normally.
    pub fn spawn_persistent<I, O, E, H>(
        &self,
        handler: H,
        before: Option<BeforeHook>,
    ) -> Result<PersistentDrone<I, O, C>>
    where
        I: DeserializeOwned,
        O: Serialize,
        E: fmt::Display,
        H: Fn(I) -> std::result::Result<O, E>,
    {
        let config = self.get_config().clone();
        let (pid, channel) = self.fork_with(move |channel| serve(channel, &config, handler, before))?;
        Ok(PersistentDrone {
            drone: Drone::new(pid, DroneStatus::Idle, channel),
            _input: PhantomData,
        })
    }
}

fn serve<I, O, E, H, C>(
    mut channel: Channel<C>,
    config: &DroneConfig,
    handler: H,
    before: Option<BeforeHook>,
) -> i32
where
    I: DeserializeOwned,
    O: Serialize,
    E: fmt::Display,
    H: Fn(I) -> std::result::Result<O, E>,
    C: Codec,
{
    if let Err(e) = signals::install(&channel, config.timeout_secs) {
        error!("drone setup failed: {}", e);
        return 1;
    }

    let mut hook_failure = before.and_then(|hook| execute(Some(&hook), || Ok(())).err());
    if let Some(exc) = &hook_failure {
        error!("before hook failed: {}", exc);
    }

    let alarm = TimeoutAlarm::new(config.timeout_secs);
    let poll_interval = config.poll_interval();
    loop {
        let task = match channel.receive::<I>() {
            Ok(Some(task)) => Ok(task),
            Ok(None) if channel.is_peer_closed() => {
                debug!("parent closed the channel, drone exiting");
                return 0;
            }
            Ok(None) => {
                thread::sleep(poll_interval);
                continue;
            }
            Err(ChannelError::Codec(e)) => Err(WorkerException::task_failure(&e)),
            Err(e) => {
                error!("drone receive failed: {}", e);
                return 1;
            }
        };

        // 钩子失败只回报一次，由第一个任务带回
        let reply: TaskResult<O> = match (task, hook_failure.take()) {
            (_, Some(exc)) => Err(exc),
            (Err(exc), None) => Err(exc),
            (Ok(task), None) => {
                alarm.arm();
                let result = execute(None, || {
                    handler(task).map_err(|e| WorkerException::task_failure(&e))
                });
                alarm.disarm();
                result
            }
        };

        if let Err(e) = channel.send(&reply) {
            error!("drone failed to send reply: {}", e);
            return 1;
        }
        trace!("reply sent");
    }
}

impl<I, O, C: Codec> PersistentDrone<I, O, C> {
    pub fn pid(&self) -> ProcessId {
        self.drone.pid()
    }

    pub fn status(&mut self) -> DroneStatus {
        self.drone.status()
    }

    pub fn is_idle(&mut self) -> bool {
        self.status() == DroneStatus::Idle
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.drone.is_killed()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.drone.termination()
    }

    pub fn kill(&mut self) -> Result<()> {
        self.drone.kill()
    }
}

impl<I: Serialize, O, C: Codec> PersistentDrone<I, O, C> {
    /// Hand one task to the child and mark the drone Active.
    pub fn dispatch(&mut self, task: &I) -> Result<()> {
        self.drone.channel_mut().send(task)?;
        self.drone.set_status(DroneStatus::Active);
        metrics::counter!("zerg_tasks_dispatched_total").increment(1);
        trace!("task dispatched to drone {}", self.pid());
        Ok(())
    }
}

impl<I, O: DeserializeOwned, C: Codec> PersistentDrone<I, O, C> {
    /// Non-blocking read of one reply; a reply makes the drone Idle again.
    pub fn get_output(&mut self) -> Result<Option<TaskResult<O>>> {
        let output = self.drone.get_output()?;
        if output.is_some() {
            self.drone.set_status(DroneStatus::Idle);
        }
        Ok(output)
    }

    pub fn wait_output(&mut self, poll_interval: Duration, timeout: Duration) -> Result<TaskResult<O>> {
        let output = self.drone.wait_output(poll_interval, timeout)?;
        self.drone.set_status(DroneStatus::Idle);
        Ok(output)
    }
}
