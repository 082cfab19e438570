// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client library for the plasma shared-memory object store.
//!
//! The store is a separate daemon holding large immutable objects in
//! memory-mapped files; clients on the same host map those files into their
//! own address spaces and read them zero-copy. This crate provides the
//! in-process client: one IPC connection to the store (plus an optional
//! manager connection for cross-host operations), a table of shared
//! mappings, per-object reference counts, and a delayed-release buffer that
//! keeps recently-released objects mapped for cheap reacquisition.
//!
//! Object lifecycle as seen by one client:
//!
//! ```text
//! create → (write payload) → seal → get*/release* → delayed flush
//!        ↘ abort
//! ```
//!
//! A [`PlasmaClient`] is single-threaded: callers must serialize all
//! operations on one instance. The store IPC is a synchronous request/reply
//! stream, so the client takes no locks and spawns no threads.

pub mod buffer;
pub mod client;
pub mod config;
pub mod conn;
pub mod device;
pub mod fling;
pub mod mmap_table;
pub mod notification;
pub mod object_table;
pub mod protocol;
pub mod release_buffer;

pub use buffer::{ObjectBuffer, PlasmaObject};
pub use client::PlasmaClient;
pub use config::PlasmaClientConfig;
pub use device::{DeviceMapper, HostOnlyMapper};
pub use notification::ObjectNotification;
#[cfg(unix)]
pub use notification::get_notification;
pub use protocol::{ObjectRequest, ObjectStatus, QueryType};

pub use plasma_common::error::{ErrorCode, PlasmaError, PlasmaResult};
pub use plasma_common::id::ObjectID;
