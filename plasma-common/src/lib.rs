// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for the plasma client: IDs, error/status types, logging,
//! retry policy, shared constants.

pub mod constants;
pub mod error;
pub mod id;
pub mod logging;
pub mod retry;
