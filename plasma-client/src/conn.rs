// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Framed connection to a store or manager socket.
//!
//! Wraps a Unix stream socket with the `[type][length][payload]` framing
//! from the `protocol` module and the ancillary-data fd passing from
//! `fling`. Strictly request/reply: the caller sends one frame and reads
//! one frame; there is no pipelining and no background reader.
//!
//! On platforms without ancillary fd passing (`fling::supported()` is
//! false) `connect` fails cleanly with `NotSupported` before any socket is
//! touched; the type still compiles there but can never be constructed.

use bytes::Bytes;

use plasma_common::error::{PlasmaError, PlasmaResult};

use crate::fling;
use crate::protocol::MessageType;

#[cfg(unix)]
use bytes::Buf;
#[cfg(unix)]
use crate::protocol::{HEADER_SIZE, MAX_MESSAGE_SIZE};

#[cfg(unix)]
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// One framed stream socket to the store or the manager.
#[derive(Debug)]
pub struct SocketConn {
    #[cfg(unix)]
    stream: UnixStream,
    path: String,
}

impl SocketConn {
    /// Connect to a Unix socket, retrying with backoff while the daemon
    /// comes up. `num_retries` bounds the attempts. Fails with
    /// `NotSupported` on platforms that cannot pass file descriptors over
    /// local sockets.
    pub fn connect(path: &str, num_retries: u32) -> PlasmaResult<Self> {
        if !fling::supported() {
            return Err(PlasmaError::not_supported(
                "this platform cannot pass file descriptors over local sockets",
            ));
        }

        #[cfg(unix)]
        {
            let mut policy = plasma_common::retry::RetryPolicy::new(num_retries.max(1));
            loop {
                match UnixStream::connect(path) {
                    Ok(stream) => {
                        tracing::debug!(path, attempts = policy.attempts_made() + 1, "connected");
                        return Ok(Self {
                            stream,
                            path: path.to_string(),
                        });
                    }
                    Err(err) => match policy.next_backoff() {
                        Some(delay) => {
                            tracing::debug!(path, %err, ?delay, "connect failed, retrying");
                            std::thread::sleep(delay);
                        }
                        None => {
                            return Err(PlasmaError::connection_failed(format!(
                                "could not connect to {} after {} attempts: {}",
                                path,
                                policy.attempts_made(),
                                err
                            )));
                        }
                    },
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = num_retries;
            unreachable!("rejected above: fd passing is unsupported here")
        }
    }

    /// Wrap an already-connected stream (used by in-process store
    /// implementations and tests).
    #[cfg(unix)]
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            path: String::new(),
        }
    }

    pub fn peer_path(&self) -> &str {
        &self.path
    }

    /// Write one framed message.
    pub fn send(&mut self, message_type: MessageType, payload: &[u8]) -> PlasmaResult<()> {
        #[cfg(unix)]
        {
            let mut header = [0u8; HEADER_SIZE];
            header[..4].copy_from_slice(&(message_type as i32).to_le_bytes());
            header[4..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            self.stream.write_all(&header)?;
            self.stream.write_all(payload)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = (message_type, payload);
            Err(PlasmaError::not_supported("no local socket support"))
        }
    }

    /// Read one framed message of any type.
    pub fn recv(&mut self) -> PlasmaResult<(MessageType, Bytes)> {
        #[cfg(unix)]
        {
            let mut header = [0u8; HEADER_SIZE];
            self.stream.read_exact(&mut header)?;

            let mut cursor = &header[..];
            let raw_type = cursor.get_i32_le();
            let length = cursor.get_u64_le();

            let message_type = MessageType::from_i32(raw_type).ok_or_else(|| {
                PlasmaError::protocol_error(format!("unknown message type {raw_type}"))
            })?;
            if length > MAX_MESSAGE_SIZE {
                return Err(PlasmaError::protocol_error(format!(
                    "payload of {length} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap"
                )));
            }

            let mut payload = vec![0u8; length as usize];
            self.stream.read_exact(&mut payload)?;
            Ok((message_type, Bytes::from(payload)))
        }
        #[cfg(not(unix))]
        Err(PlasmaError::not_supported("no local socket support"))
    }

    /// Read one framed message and require it to be of `expected` type.
    pub fn recv_expect(&mut self, expected: MessageType) -> PlasmaResult<Bytes> {
        let (message_type, payload) = self.recv()?;
        if message_type != expected {
            return Err(PlasmaError::protocol_error(format!(
                "expected {expected:?} but received {message_type:?}"
            )));
        }
        Ok(payload)
    }

    /// Receive a file descriptor from the ancillary channel.
    #[cfg(unix)]
    pub fn recv_fd(&mut self) -> PlasmaResult<OwnedFd> {
        fling::recv_fd(self.stream.as_raw_fd()).map_err(PlasmaError::from)
    }

    /// Send a file descriptor over the ancillary channel.
    #[cfg(unix)]
    pub fn send_fd(&mut self, fd: RawFd) -> PlasmaResult<()> {
        fling::send_fd(self.stream.as_raw_fd(), fd).map_err(PlasmaError::from)
    }
}
