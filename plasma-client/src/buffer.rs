// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object layout descriptors and caller-facing buffers.
//!
//! A [`PlasmaObject`] is the store's description of where one object lives
//! inside a memory-mapped file. An [`ObjectBuffer`] is the view handed to
//! the caller: raw pointers into the shared mapping plus the sizes, valid
//! until the matching `release` (or `abort` for an unsealed object).

/// Store-reported layout of one object within a mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlasmaObject {
    /// Store-assigned identifier of the mapped file holding this object.
    /// This is the store's stable key, not a file descriptor in this
    /// process.
    pub store_fd: i32,
    /// Total length of that mapped file.
    pub map_size: i64,
    /// Byte offset of the data payload within the mapping.
    pub data_offset: u64,
    /// Size of the data payload.
    pub data_size: i64,
    /// Byte offset of the caller-supplied metadata within the mapping.
    pub metadata_offset: u64,
    /// Size of the metadata.
    pub metadata_size: i64,
    /// 0 = host memory, >0 = accelerator device index.
    pub device_num: i32,
}

impl PlasmaObject {
    /// The layout used for objects a batched get could not return in time.
    pub fn absent() -> Self {
        Self {
            store_fd: -1,
            data_size: -1,
            metadata_size: -1,
            ..Default::default()
        }
    }

    /// Bytes this object pins in the mapping (data + metadata).
    pub fn total_size(&self) -> i64 {
        self.data_size + self.metadata_size
    }
}

/// A caller-facing view of one object's bytes in shared memory.
///
/// The pointers alias a mapping shared with the store and other clients.
/// They stay valid until this client releases (or aborts) the object; using
/// a buffer after that point is undefined behavior, exactly as with any
/// dangling pointer. Only the buffer returned by `create` is writable, and
/// only until `seal`.
pub struct ObjectBuffer {
    data: *mut u8,
    data_size: i64,
    metadata: *mut u8,
    metadata_size: i64,
    device_num: i32,
    writable: bool,
}

// The pointers target shared memory that is immutable once sealed and is
// coordinated by the store protocol across processes.
unsafe impl Send for ObjectBuffer {}

impl ObjectBuffer {
    pub(crate) fn new(
        data: *mut u8,
        data_size: i64,
        metadata: *mut u8,
        metadata_size: i64,
        device_num: i32,
        writable: bool,
    ) -> Self {
        Self {
            data,
            data_size,
            metadata,
            metadata_size,
            device_num,
            writable,
        }
    }

    /// The slot value for an object that was not retrieved (`data_size()`
    /// reports -1, no reference is held, no release is owed).
    pub(crate) fn absent() -> Self {
        Self {
            data: std::ptr::null_mut(),
            data_size: -1,
            metadata: std::ptr::null_mut(),
            metadata_size: -1,
            device_num: 0,
            writable: false,
        }
    }

    /// False when a batched get timed out before this object was available.
    pub fn is_present(&self) -> bool {
        self.data_size >= 0
    }

    pub fn data_size(&self) -> i64 {
        self.data_size
    }

    pub fn metadata_size(&self) -> i64 {
        self.metadata_size
    }

    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    /// Raw data pointer. For `device_num > 0` this is a device-space address
    /// that host code must not dereference.
    pub fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// The object's data bytes. Panics on an absent slot or a
    /// device-resident object.
    pub fn data(&self) -> &[u8] {
        assert!(self.is_present(), "buffer for an object that was not retrieved");
        assert_eq!(self.device_num, 0, "device-resident buffer is not host-readable");
        unsafe { std::slice::from_raw_parts(self.data, self.data_size as usize) }
    }

    /// Mutable data bytes; only the creator's buffer is writable, and only
    /// before `seal`. Panics otherwise.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.writable, "buffer is read-only");
        assert_eq!(self.device_num, 0, "device-resident buffer is not host-writable");
        unsafe { std::slice::from_raw_parts_mut(self.data, self.data_size as usize) }
    }

    /// The caller-supplied metadata bytes. Panics on an absent slot or a
    /// device-resident object.
    pub fn metadata(&self) -> &[u8] {
        assert!(self.is_present(), "buffer for an object that was not retrieved");
        assert_eq!(self.device_num, 0, "device-resident buffer is not host-readable");
        unsafe { std::slice::from_raw_parts(self.metadata, self.metadata_size as usize) }
    }
}

impl std::fmt::Debug for ObjectBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("data_size", &self.data_size)
            .field("metadata_size", &self.metadata_size)
            .field("device_num", &self.device_num)
            .field("writable", &self.writable)
            .finish()
    }
}
