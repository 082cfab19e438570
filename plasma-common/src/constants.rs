// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared across the plasma client crates.

/// Length of plasma object IDs in bytes.
pub const OBJECT_ID_SIZE: usize = 20;

/// Length of object content digests in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Number of release calls kept pending before the store-side release is
/// actually performed. Keeping recently-released objects mapped lets an
/// immediately-following get reuse them without a round trip or remap.
pub const DEFAULT_RELEASE_DELAY: usize = 64;

/// Default number of attempts when connecting to a store or manager socket.
pub const DEFAULT_CONNECT_RETRIES: u32 = 50;

/// Overestimate of the CPU L3 cache size. Bounds how many bytes of
/// released-but-still-mapped objects the client keeps around.
pub const L3_CACHE_SIZE_BYTES: i64 = 100_000_000;
