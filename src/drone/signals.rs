//! 子进程信号处理：超时闹钟与自杀
//!
//! Handlers only touch the [`SignalContext`] installed before the task
//! starts, and only through async-signal-safe calls (`send`, `poll`,
//! `getpid`, `kill`).

use super::channel::{Channel, ChannelError, SEND_FLAGS};
use crate::proto::{Codec, TaskResult, WorkerException};
use crate::{PoolError, Result};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{alarm, Pid};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// How long the alarm handler waits for the socket to drain before giving up.
const ALARM_WRITE_WAIT_MS: libc::c_int = 1000;

/// What the alarm handler needs: where to write and what.
struct SignalContext {
    fd: RawFd,
    /// Fully framed `WorkerTimeout` reply.
    frame: Vec<u8>,
}

static CONTEXT: AtomicPtr<SignalContext> = AtomicPtr::new(ptr::null_mut());

/// Install the drone's signal handlers. Called in the child right after fork.
pub(crate) fn install<C: Codec>(channel: &Channel<C>, timeout_secs: u32) -> Result<()> {
    let fd = channel.raw_fd().ok_or(ChannelError::Closed)?;
    let reply: TaskResult<()> = Err(WorkerException::timeout(timeout_secs));
    let frame = channel.frame_bytes(&reply)?;

    let fresh = Box::into_raw(Box::new(SignalContext { fd, frame }));
    let previous = CONTEXT.swap(fresh, Ordering::SeqCst);
    if !previous.is_null() {
        // 只有同一进程中重复安装时才会出现；此时不会有闹钟在途
        drop(unsafe { Box::from_raw(previous) });
    }

    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let timeout = SigAction::new(
        SigHandler::Handler(on_alarm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        for sig in [Signal::SIGQUIT, Signal::SIGTERM, Signal::SIGINT] {
            signal::sigaction(sig, &terminate).map_err(PoolError::Signal)?;
        }
        signal::sigaction(Signal::SIGALRM, &timeout).map_err(PoolError::Signal)?;
    }
    debug!("signal handlers installed in drone {}", Pid::this());
    Ok(())
}

/// Kill the current process outright.
pub fn kill_self() {
    let _ = signal::kill(Pid::this(), Signal::SIGKILL);
}

extern "C" fn on_terminate(_: libc::c_int) {
    kill_self();
}

extern "C" fn on_alarm(_: libc::c_int) {
    let ctx = CONTEXT.load(Ordering::SeqCst);
    if !ctx.is_null() {
        let ctx = unsafe { &*ctx };
        write_all_raw(ctx.fd, &ctx.frame);
    }
    kill_self();
}

/// Best-effort blocking write usable from a signal handler.
fn write_all_raw(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        let n = unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), SEND_FLAGS) };
        if n >= 0 {
            data = &data[n as usize..];
            continue;
        }
        match Errno::last() {
            Errno::EINTR => {}
            Errno::EAGAIN => {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                if unsafe { libc::poll(&mut pfd, 1, ALARM_WRITE_WAIT_MS) } <= 0 {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Per-drone `SIGALRM` timer. A zero timeout never arms.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutAlarm {
    secs: u32,
}

impl TimeoutAlarm {
    pub(crate) fn new(secs: u32) -> Self {
        Self { secs }
    }

    pub(crate) fn arm(&self) {
        if self.secs > 0 {
            alarm::set(self.secs);
        }
    }

    pub(crate) fn disarm(&self) {
        if self.secs > 0 {
            alarm::cancel();
        }
    }
}
