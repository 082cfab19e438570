// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The table of objects this client currently holds references to.
//!
//! One entry per object the client has observed locally via create or get.
//! Each live entry pins exactly one mmap-table entry (by `store_fd`); the
//! lifecycle controller in `client` keeps the two tables consistent.

use std::collections::HashMap;

use plasma_common::id::ObjectID;

use crate::buffer::PlasmaObject;

/// One object in use by this client.
pub struct ObjectInUseEntry {
    /// Store-reported layout of the object.
    pub object: PlasmaObject,
    /// Number of outstanding create/get references. An entry with zero
    /// references sits in the release buffer awaiting its store-side
    /// release.
    pub count: i64,
    /// Whether the object has been sealed. Unsealed entries belong to the
    /// creator and always have exactly one reference.
    pub is_sealed: bool,
    /// Device-space base address for `device_num > 0` objects; null for
    /// host objects (their base comes from the mmap table).
    pub device_base: *mut u8,
}

/// Map from object ID to this client's in-use entry.
pub struct ObjectTable {
    objects: HashMap<ObjectID, ObjectInUseEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    /// Start using an object. Inserts an entry with one reference if the
    /// object is new to this client, otherwise adds a reference. Returns
    /// true when the entry was newly inserted (the caller then pins the
    /// mapping).
    pub fn begin_use(
        &mut self,
        object_id: ObjectID,
        object: PlasmaObject,
        is_sealed: bool,
        device_base: *mut u8,
    ) -> bool {
        match self.objects.get_mut(&object_id) {
            Some(entry) => {
                entry.count += 1;
                false
            }
            None => {
                self.objects.insert(
                    object_id,
                    ObjectInUseEntry {
                        object,
                        count: 1,
                        is_sealed,
                        device_base,
                    },
                );
                true
            }
        }
    }

    /// Drop one reference. Returns the remaining count; the entry stays in
    /// the table at zero (it moves to the release buffer, not out of the
    /// table). Panics if the entry is missing or already at zero.
    pub fn end_use(&mut self, object_id: &ObjectID) -> i64 {
        let entry = self
            .objects
            .get_mut(object_id)
            .unwrap_or_else(|| panic!("no in-use entry for object {object_id}"));
        assert!(entry.count > 0, "object {object_id} has no references to drop");
        entry.count -= 1;
        entry.count
    }

    pub fn lookup(&self, object_id: &ObjectID) -> Option<&ObjectInUseEntry> {
        self.objects.get(object_id)
    }

    pub fn lookup_mut(&mut self, object_id: &ObjectID) -> Option<&mut ObjectInUseEntry> {
        self.objects.get_mut(object_id)
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.objects.contains_key(object_id)
    }

    /// Remove an entry entirely (final release or abort). The caller
    /// unpins the mapping.
    pub fn remove(&mut self, object_id: &ObjectID) -> Option<ObjectInUseEntry> {
        self.objects.remove(object_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectID, &ObjectInUseEntry)> {
        self.objects.iter()
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn make_oid(val: u8) -> ObjectID {
        let mut data = [0u8; ObjectID::SIZE];
        data[0] = val;
        ObjectID::from_binary(&data)
    }

    fn host_object(store_fd: i32) -> PlasmaObject {
        PlasmaObject {
            store_fd,
            map_size: 4096,
            data_size: 128,
            metadata_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_begin_use_inserts_then_increments() {
        let mut table = ObjectTable::new();
        let oid = make_oid(1);

        assert!(table.begin_use(oid, host_object(3), true, ptr::null_mut()));
        assert!(!table.begin_use(oid, host_object(3), true, ptr::null_mut()));
        assert_eq!(table.lookup(&oid).unwrap().count, 2);
    }

    #[test]
    fn test_end_use_keeps_entry_at_zero() {
        let mut table = ObjectTable::new();
        let oid = make_oid(1);
        table.begin_use(oid, host_object(3), true, ptr::null_mut());

        assert_eq!(table.end_use(&oid), 0);
        // Zero references, but the entry survives for the release window.
        assert!(table.contains(&oid));
    }

    #[test]
    #[should_panic(expected = "no references to drop")]
    fn test_end_use_at_zero_panics() {
        let mut table = ObjectTable::new();
        let oid = make_oid(1);
        table.begin_use(oid, host_object(3), true, ptr::null_mut());
        table.end_use(&oid);
        table.end_use(&oid);
    }

    #[test]
    fn test_remove() {
        let mut table = ObjectTable::new();
        let oid = make_oid(9);
        table.begin_use(oid, host_object(1), false, ptr::null_mut());
        let entry = table.remove(&oid).unwrap();
        assert!(!entry.is_sealed);
        assert!(table.is_empty());
    }
}
