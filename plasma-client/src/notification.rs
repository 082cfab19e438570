// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The seal-notification channel.
//!
//! `subscribe` hands the store one end of a socket pair; the store writes a
//! fixed 36-byte frame to it for every seal (and deletion). The stream is
//! independent of the request/reply socket and is driven by the caller one
//! frame at a time. Do not read it from the thread currently blocked in a
//! get unless a poll/select loop is interposed.

#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd};

use bytes::Buf;

use plasma_common::constants::OBJECT_ID_SIZE;
use plasma_common::error::{PlasmaError, PlasmaResult};
use plasma_common::id::ObjectID;

/// Size of one notification frame: object ID + two i64 sizes.
pub const NOTIFICATION_FRAME_SIZE: usize = OBJECT_ID_SIZE + 16;

/// One event on a subscription: an object was sealed, or deleted (both
/// sizes are -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectNotification {
    pub object_id: ObjectID,
    pub data_size: i64,
    pub metadata_size: i64,
}

impl ObjectNotification {
    pub fn is_deletion(&self) -> bool {
        self.data_size < 0
    }
}

/// Block until the next notification frame arrives on the subscription fd
/// and decode it.
#[cfg(unix)]
pub fn get_notification(fd: BorrowedFd<'_>) -> PlasmaResult<ObjectNotification> {
    let mut frame = [0u8; NOTIFICATION_FRAME_SIZE];
    read_exact_fd(fd.as_raw_fd(), &mut frame)?;
    decode_notification(&frame)
}

/// Decode one 36-byte notification frame.
pub fn decode_notification(frame: &[u8]) -> PlasmaResult<ObjectNotification> {
    if frame.len() != NOTIFICATION_FRAME_SIZE {
        return Err(PlasmaError::protocol_error(format!(
            "notification frame of {} bytes, expected {}",
            frame.len(),
            NOTIFICATION_FRAME_SIZE
        )));
    }
    let object_id = ObjectID::from_binary(&frame[..OBJECT_ID_SIZE]);
    let mut sizes = &frame[OBJECT_ID_SIZE..];
    let data_size = sizes.get_i64_le();
    let metadata_size = sizes.get_i64_le();
    Ok(ObjectNotification {
        object_id,
        data_size,
        metadata_size,
    })
}

/// Encode one notification frame (the store side of the channel).
pub fn encode_notification(notification: &ObjectNotification) -> [u8; NOTIFICATION_FRAME_SIZE] {
    let mut frame = [0u8; NOTIFICATION_FRAME_SIZE];
    frame[..OBJECT_ID_SIZE].copy_from_slice(notification.object_id.as_bytes());
    frame[OBJECT_ID_SIZE..OBJECT_ID_SIZE + 8].copy_from_slice(&notification.data_size.to_le_bytes());
    frame[OBJECT_ID_SIZE + 8..].copy_from_slice(&notification.metadata_size.to_le_bytes());
    frame
}

/// Read exactly `buf.len()` bytes from a raw fd, retrying on EINTR.
#[cfg(unix)]
fn read_exact_fd(fd: i32, buf: &mut [u8]) -> PlasmaResult<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let remaining = &mut buf[filled..];
        let n = unsafe {
            libc::read(
                fd,
                remaining.as_mut_ptr() as *mut libc::c_void,
                remaining.len(),
            )
        };
        if n > 0 {
            filled += n as usize;
        } else if n == 0 {
            return Err(PlasmaError::io_error(
                "notification stream closed by the store",
            ));
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
    Ok(())
}
