// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! File descriptor passing over Unix domain sockets via `SCM_RIGHTS`.
//!
//! The store hands clients the descriptors of newly created mapped files
//! through the ancillary channel of the store socket, and clients pass the
//! store their notification socket end the same way. The send/receive
//! functions exist only on Unix; elsewhere [`supported`] returns false and
//! `SocketConn::connect` fails cleanly with `NotSupported`.
//!
//! # Safety
//!
//! The `sendmsg`/`recvmsg` control-message plumbing is inherently unsafe;
//! it is confined to this module.

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Whether this platform can pass file descriptors over local sockets.
/// Checked by `SocketConn::connect` before any socket is opened.
pub fn supported() -> bool {
    cfg!(unix)
}

/// Send `fd` over the connected Unix socket `conn`.
#[cfg(unix)]
pub fn send_fd(conn: RawFd, fd: RawFd) -> io::Result<()> {
    use libc::{c_void, iovec, msghdr, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_SPACE};
    use std::mem;

    // One payload byte is required for the ancillary data to be delivered.
    let mut byte = [0u8; 1];
    let mut iov = iovec {
        iov_base: byte.as_mut_ptr() as *mut c_void,
        iov_len: 1,
    };

    let cmsg_space = unsafe { CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("CMSG_FIRSTHDR returned null"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            &fd as *const RawFd as *const u8,
            CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );
    }

    loop {
        let ret = unsafe { libc::sendmsg(conn, &msg, 0) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive a file descriptor from the connected Unix socket `conn`.
///
/// The returned [`OwnedFd`] closes on drop; callers that only need the
/// mapping close it right after `mmap`.
#[cfg(unix)]
pub fn recv_fd(conn: RawFd) -> io::Result<OwnedFd> {
    use libc::{c_void, iovec, msghdr, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_SPACE};
    use std::mem;

    let mut byte = [0u8; 1];
    let mut iov = iovec {
        iov_base: byte.as_mut_ptr() as *mut c_void,
        iov_len: 1,
    };

    let cmsg_space = unsafe { CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_space as _;

    let received = loop {
        let ret = unsafe { libc::recvmsg(conn, &mut msg, 0) };
        if ret > 0 {
            break ret;
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "socket closed while waiting for a file descriptor",
            ));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    debug_assert_eq!(received, 1);

    let fd = unsafe {
        let cmsg = CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no control message received",
            ));
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected control message type",
            ));
        }
        if (*cmsg).cmsg_len < CMSG_LEN(mem::size_of::<RawFd>() as u32) as _ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "control message too short",
            ));
        }
        let mut fd: RawFd = -1;
        std::ptr::copy_nonoverlapping(
            CMSG_DATA(cmsg),
            &mut fd as *mut RawFd as *mut u8,
            mem::size_of::<RawFd>(),
        );
        fd
    };

    if fd < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "received invalid file descriptor",
        ));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
