// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Device-resident object support.
//!
//! Objects with `device_num > 0` live in accelerator memory rather than a
//! host mapping. Resolving their layout to a device-space address sits
//! behind [`DeviceMapper`] so the rest of the client never touches device
//! APIs; builds without device support use [`HostOnlyMapper`].

use plasma_common::error::{PlasmaError, PlasmaResult};

use crate::buffer::PlasmaObject;

/// Maps device-resident objects to device-space base addresses.
///
/// `map_object` is called once when an object enters the in-use table and
/// `unmap_object` once when it leaves; the returned pointer must stay valid
/// in between. The pointer is a device-space address: host code must not
/// dereference it.
pub trait DeviceMapper {
    /// Whether objects on this device can be mapped at all. Checked before
    /// asking the store to allocate there.
    fn supports_device(&self, device_num: i32) -> bool;
    fn map_object(&mut self, object: &PlasmaObject) -> PlasmaResult<*mut u8>;
    fn unmap_object(&mut self, object: &PlasmaObject) -> PlasmaResult<()>;
}

/// Default mapper for hosts without accelerator support: every
/// device-resident object is rejected.
pub struct HostOnlyMapper;

impl DeviceMapper for HostOnlyMapper {
    fn supports_device(&self, _device_num: i32) -> bool {
        false
    }

    fn map_object(&mut self, object: &PlasmaObject) -> PlasmaResult<*mut u8> {
        Err(PlasmaError::not_supported(format!(
            "object on device {} but this client was built without device support",
            object.device_num
        )))
    }

    fn unmap_object(&mut self, _object: &PlasmaObject) -> PlasmaResult<()> {
        Ok(())
    }
}
