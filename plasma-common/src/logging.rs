// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use tracing_subscriber::EnvFilter;

/// Initialize logging for a plasma client process.
///
/// Filter precedence: `PLASMA_LOG_LEVEL`, then `RUST_LOG`, then the
/// `verbosity` argument (0 = info, 1 = debug, 2+ = trace).
///
/// Intended for binaries and tests; libraries embedding the client should
/// install their own subscriber instead.
pub fn init_plasma_logging(verbosity: i32) {
    let filter = EnvFilter::try_from_env("PLASMA_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| {
            let level = match verbosity {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            EnvFilter::new(level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
