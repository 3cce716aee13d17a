//! 工蜂与蜂后之间的双工消息通道
//!
//! 基于 `socketpair(AF_UNIX, SOCK_STREAM)` 的一端，写入前按帧格式切块，
//! 读取时逐块喂给 [`Packer`] 重组消息。

use crate::config::ChannelConfig;
use crate::proto::{BincodeCodec, Codec, CodecError, FrameError, Packer, PackerFactory};
use bytes::Bytes;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{Domain, Socket, Type};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Flags for every `send` so a vanished peer never raises `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const SEND_FLAGS: libc::c_int = 0;

/// 通道错误类型
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("channel closed")]
    Closed,
}

pub struct Channel<C: Codec = BincodeCodec> {
    socket: Option<Socket>,
    packer: Box<dyn Packer>,
    codec: C,
    config: ChannelConfig,
    /// Messages reconstructed but not yet handed out.
    inbox: VecDeque<Bytes>,
    peer_closed: bool,
}

impl<C: Codec> fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.raw_fd())
            .field("buffer_size", &self.config.buffer_size)
            .field("queued", &self.inbox.len())
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}

impl<C: Codec> Channel<C> {
    /// Wrap one end of a connected stream socket.
    pub fn new(
        socket: Socket,
        config: ChannelConfig,
        codec: C,
        factory: &PackerFactory,
    ) -> Result<Self, ChannelError> {
        let packer = factory(config.buffer_size)?;
        socket.set_nonblocking(true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;

        Ok(Self {
            socket: Some(socket),
            packer,
            codec,
            config,
            inbox: VecDeque::new(),
            peer_closed: false,
        })
    }

    /// Two channels connected to each other.
    pub fn pair(
        config: ChannelConfig,
        codec: C,
        factory: &PackerFactory,
    ) -> Result<(Self, Self), ChannelError> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        Ok((
            Self::new(a, config.clone(), codec.clone(), factory)?,
            Self::new(b, config, codec, factory)?,
        ))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Whether a read has seen end of stream.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Encode and frame a value without sending it.
    pub fn frame_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ChannelError> {
        let payload = self.codec.encode(value)?;
        let chunks = self.packer.pack(&payload)?;
        Ok(chunks.iter().flat_map(|c| c.iter().copied()).collect())
    }

    /// Send one message.
    ///
    /// A chunk that cannot be written within the configured write timeout
    /// aborts the send; the rest of the message is dropped and `Ok` is
    /// returned.
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ChannelError> {
        let socket = self.socket.as_ref().ok_or(ChannelError::Closed)?;
        let payload = self.codec.encode(value)?;
        let chunks = self.packer.pack(&payload)?;
        let timeout = self.config.write_timeout();

        for chunk in &chunks {
            let mut rest: &[u8] = chunk;
            while !rest.is_empty() {
                if !wait_writable(socket, timeout)? {
                    warn!(
                        "write readiness timed out after {:?}, dropping {} byte message",
                        timeout,
                        payload.len()
                    );
                    return Ok(());
                }
                match socket.send_with_flags(rest, SEND_FLAGS) {
                    Ok(n) => rest = &rest[n..],
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        trace!("sent {} byte message in {} chunks", payload.len(), chunks.len());
        Ok(())
    }

    /// Non-blocking receive.
    ///
    /// `Ok(None)` means no complete message is available yet, or the channel
    /// is closed. Bytes of a partial message stay buffered for the next call.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ChannelError> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(self.codec.decode(&message)?));
        }
        let Some(mut socket) = self.socket.as_ref() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => {
                    if !self.peer_closed {
                        debug!("channel peer closed (fd {})", socket.as_raw_fd());
                    }
                    self.peer_closed = true;
                    self.packer.unpack(&[]);
                    return Ok(None);
                }
                Ok(n) => {
                    self.inbox.extend(self.packer.unpack(&buf[..n]));
                    if let Some(message) = self.inbox.pop_front() {
                        return Ok(Some(self.codec.decode(&message)?));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    debug!("channel read failed: {}", e);
                    self.peer_closed = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Close the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            trace!("closing channel fd {}", socket.as_raw_fd());
        }
        self.inbox.clear();
    }
}

fn wait_writable(socket: &Socket, timeout: Duration) -> Result<bool, ChannelError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128);
        let mut fds = [PollFd::new(socket, PollFlags::POLLOUT)];
        match poll(&mut fds, millis as libc::c_int) {
            Ok(0) => return Ok(false),
            // errors and hang-ups surface from the following send
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ChannelError::Io(e.into())),
        }
    }
}
