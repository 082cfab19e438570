// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Plasma client error types.
//!
//! Every public operation returns `PlasmaResult<T>`. Errors fall into a few
//! families:
//! - connection/transport/protocol failures (`ConnectionFailed`,
//!   `Disconnected`, `IOError`, `ProtocolError`) render the client unusable;
//! - per-call failures (`IllegalState`, capacity codes, `TimedOut`,
//!   `NoManager`, `ObjectNotFound`) leave the client fully usable.

use std::fmt;

/// Error codes for plasma client operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Socket open/connect/handshake failure (retried internally first).
    ConnectionFailed,
    /// The connection was lost or the client was poisoned by an earlier
    /// transport failure.
    Disconnected,
    /// Short read/write or descriptor-passing failure on an open connection.
    IOError,
    /// Malformed header, oversized payload, or reply type mismatch.
    ProtocolError,
    /// Operation not legal for the object's current lifecycle state.
    IllegalState,
    /// The store already holds an object with this ID.
    ObjectExists,
    /// The object is not present where the API promises to report absence.
    ObjectNotFound,
    /// The store cannot allocate the requested object.
    OutOfMemory,
    /// The store is full but eviction may free space; the caller can retry.
    TransientStoreFull,
    /// A blocking call reached its deadline.
    TimedOut,
    /// A manager-routed operation was invoked with no manager connection.
    NoManager,
    /// The platform or build lacks a required capability
    /// (ancillary fd passing, device memory).
    NotSupported,
    /// A malformed argument (e.g. `num_ready` larger than the request set).
    InvalidArgument,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "ConnectionFailed",
            Self::Disconnected => "Disconnected",
            Self::IOError => "IOError",
            Self::ProtocolError => "ProtocolError",
            Self::IllegalState => "IllegalState",
            Self::ObjectExists => "ObjectExists",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::OutOfMemory => "OutOfMemory",
            Self::TransientStoreFull => "TransientStoreFull",
            Self::TimedOut => "TimedOut",
            Self::NoManager => "NoManager",
            Self::NotSupported => "NotSupported",
            Self::InvalidArgument => "InvalidArgument",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for plasma client operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct PlasmaError {
    pub code: ErrorCode,
    pub message: String,
}

impl PlasmaError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    // Convenience constructors, one per code.
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, msg)
    }
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Disconnected, msg)
    }
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::IOError, msg)
    }
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, msg)
    }
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::IllegalState, msg)
    }
    pub fn object_exists(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ObjectExists, msg)
    }
    pub fn object_not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ObjectNotFound, msg)
    }
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::OutOfMemory, msg)
    }
    pub fn transient_store_full(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientStoreFull, msg)
    }
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::TimedOut, msg)
    }
    pub fn no_manager(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoManager, msg)
    }
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, msg)
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, msg)
    }

    // Predicates.
    pub fn is_illegal_state(&self) -> bool {
        self.code == ErrorCode::IllegalState
    }
    pub fn is_timed_out(&self) -> bool {
        self.code == ErrorCode::TimedOut
    }
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::ObjectNotFound
    }
    pub fn is_no_manager(&self) -> bool {
        self.code == ErrorCode::NoManager
    }

    /// True for store-capacity failures where an `evict` + retry may succeed.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::OutOfMemory | ErrorCode::TransientStoreFull
        )
    }

    /// True for failures that leave the connection unusable. After one of
    /// these, every subsequent call on the same client fails fast.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ConnectionFailed
                | ErrorCode::Disconnected
                | ErrorCode::IOError
                | ErrorCode::ProtocolError
        )
    }
}

impl From<std::io::Error> for PlasmaError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

/// Convenience alias used throughout the client.
pub type PlasmaResult<T> = Result<T, PlasmaError>;
