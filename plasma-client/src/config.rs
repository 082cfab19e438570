// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client configuration. All configuration flows through
//! [`PlasmaClient::connect`](crate::client::PlasmaClient::connect); the
//! client owns no environment variables, CLI flags, or on-disk state.

use plasma_common::constants::{DEFAULT_CONNECT_RETRIES, DEFAULT_RELEASE_DELAY};

/// Configuration for a plasma client, fixed at connect time.
#[derive(Debug, Clone)]
pub struct PlasmaClientConfig {
    /// Number of release calls kept pending before the store-side release is
    /// performed. Released objects inside this window are reacquirable by a
    /// subsequent get without a store round-trip or a fresh mmap.
    pub release_delay: usize,
    /// Byte bound on objects sitting in the release window. `None` derives
    /// the bound from the store's capacity reported at connect time:
    /// `min(L3_CACHE_SIZE_BYTES, store_capacity / 100)`.
    pub cache_limit_bytes: Option<i64>,
    /// Number of attempts when connecting to the store or manager socket.
    pub num_retries: u32,
}

impl Default for PlasmaClientConfig {
    fn default() -> Self {
        Self {
            release_delay: DEFAULT_RELEASE_DELAY,
            cache_limit_bytes: None,
            num_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}
