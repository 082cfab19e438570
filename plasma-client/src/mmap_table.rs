// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The per-process table of mapped files shared with the store.
//!
//! Each entry is one mapped file, keyed by the store's stable identifier
//! for it (`store_fd`). The actual descriptor received over the socket is
//! only needed for the `mmap` call and is closed immediately after; the
//! mapping itself persists until no in-use object pins it.
//!
//! # Safety
//!
//! `mmap`/`munmap` raw-pointer handling is confined to this module.

use std::collections::HashMap;

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};
#[cfg(unix)]
use std::ptr;

#[cfg(unix)]
use plasma_common::error::{PlasmaError, PlasmaResult};

/// One mapped file shared with the store.
struct MmapEntry {
    /// Base of the mapping in this process.
    pointer: *mut u8,
    /// Length of the mapped file.
    length: usize,
    /// Number of in-use objects living in this mapping. The region is
    /// unmapped when this returns to zero.
    count: i64,
}

/// Table of mapped files, keyed by the store's identifier.
pub struct MmapTable {
    entries: HashMap<i32, MmapEntry>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Return the base pointer for `store_fd`, mapping the received
    /// descriptor first if this is the first time the store has referenced
    /// it. The descriptor is closed either way; only the mapping persists.
    #[cfg(unix)]
    pub fn lookup_or_mmap(
        &mut self,
        fd: OwnedFd,
        store_fd: i32,
        map_size: i64,
    ) -> PlasmaResult<*mut u8> {
        if let Some(entry) = self.entries.get(&store_fd) {
            // Already mapped; the duplicate descriptor closes on drop.
            return Ok(entry.pointer);
        }

        if map_size <= 0 {
            return Err(PlasmaError::protocol_error(format!(
                "store sent a mapping of {map_size} bytes"
            )));
        }
        let length = map_size as usize;

        let pointer = unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(PlasmaError::io_error(format!(
                    "mmap of {} bytes for store fd {} failed: {}",
                    length,
                    store_fd,
                    std::io::Error::last_os_error()
                )));
            }
            ptr as *mut u8
        };
        drop(fd);

        tracing::debug!(store_fd, length, "mapped shared file");
        self.entries.insert(
            store_fd,
            MmapEntry {
                pointer,
                length,
                count: 0,
            },
        );
        Ok(pointer)
    }

    /// Base pointer for an already-mapped file.
    pub fn lookup(&self, store_fd: i32) -> Option<*mut u8> {
        self.entries.get(&store_fd).map(|entry| entry.pointer)
    }

    pub fn contains(&self, store_fd: i32) -> bool {
        self.entries.contains_key(&store_fd)
    }

    /// Record one more in-use object in this mapping. The entry must exist;
    /// a missing entry means the in-use table is corrupt, which is a
    /// memory-safety hazard, so this aborts rather than returning an error.
    pub fn increment(&mut self, store_fd: i32) {
        let entry = self
            .entries
            .get_mut(&store_fd)
            .unwrap_or_else(|| panic!("no mapping for store fd {store_fd}"));
        entry.count += 1;
    }

    /// Record that an in-use object left this mapping; unmaps the region
    /// when the count returns to zero. Aborts on a missing entry or a
    /// negative count for the same reason as [`increment`](Self::increment).
    pub fn decrement(&mut self, store_fd: i32) {
        let entry = self
            .entries
            .get_mut(&store_fd)
            .unwrap_or_else(|| panic!("no mapping for store fd {store_fd}"));
        entry.count -= 1;
        assert!(
            entry.count >= 0,
            "mapping for store fd {store_fd} released more times than acquired"
        );
        if entry.count == 0 {
            let entry = self.entries.remove(&store_fd).unwrap();
            tracing::debug!(store_fd, length = entry.length, "unmapping shared file");
            #[cfg(unix)]
            unsafe {
                libc::munmap(entry.pointer as *mut libc::c_void, entry.length);
            }
        }
    }

    /// Object count of one mapping, for accounting checks.
    pub fn count(&self, store_fd: i32) -> Option<i64> {
        self.entries.get(&store_fd).map(|entry| entry.count)
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MmapTable {
    fn drop(&mut self) {
        // Unmap whatever is left so a dropped client cannot leak address
        // space for the life of the process.
        for (store_fd, entry) in self.entries.drain() {
            if entry.count != 0 {
                tracing::warn!(
                    store_fd,
                    count = entry.count,
                    "unmapping shared file that still has in-use objects"
                );
            }
            #[cfg(unix)]
            unsafe {
                libc::munmap(entry.pointer as *mut libc::c_void, entry.length);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    /// A real file descriptor backed by a sized temp file.
    fn backing_fd(size: usize) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn test_map_and_unmap() {
        let mut table = MmapTable::new();
        let base = table.lookup_or_mmap(backing_fd(4096), 1, 4096).unwrap();
        assert!(!base.is_null());
        assert_eq!(table.lookup(1), Some(base));
        assert_eq!(table.count(1), Some(0));

        table.increment(1);
        table.increment(1);
        table.decrement(1);
        assert_eq!(table.count(1), Some(1));
        table.decrement(1);
        assert!(!table.contains(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_lookup_or_mmap_reuses_mapping() {
        let mut table = MmapTable::new();
        let first = table.lookup_or_mmap(backing_fd(4096), 7, 4096).unwrap();
        // A second descriptor for the same store fd maps to the same region.
        let second = table.lookup_or_mmap(backing_fd(4096), 7, 4096).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        table.increment(7);
        table.decrement(7);
    }

    #[test]
    fn test_mapping_is_shared_with_backing_file() {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; 4096]).unwrap();
        let fd = OwnedFd::from(file.try_clone().unwrap());

        let mut table = MmapTable::new();
        let base = table.lookup_or_mmap(fd, 3, 4096).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(base, 4).copy_from_slice(b"plas");
        }

        let mut readback = [0u8; 4];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut readback).unwrap();
        assert_eq!(&readback, b"plas");
    }

    #[test]
    #[should_panic(expected = "no mapping for store fd")]
    fn test_increment_missing_entry_panics() {
        let mut table = MmapTable::new();
        table.increment(42);
    }

    #[test]
    #[should_panic(expected = "no mapping for store fd")]
    fn test_decrement_past_zero_panics() {
        let mut table = MmapTable::new();
        table.lookup_or_mmap(backing_fd(4096), 1, 4096).unwrap();
        table.increment(1);
        table.decrement(1);
        // The entry was unmapped at zero; one decrement too many must abort.
        table.decrement(1);
    }

    #[test]
    fn test_rejects_nonpositive_map_size() {
        let mut table = MmapTable::new();
        assert!(table.lookup_or_mmap(backing_fd(16), 1, 0).is_err());
    }
}
