// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The plasma client: connection handling, the object lifecycle state
//! machine, and the orchestration of the mmap table, in-use table, and
//! release buffer.
//!
//! A client is single-threaded by contract: the store IPC is one
//! synchronous request/reply stream, and interleaved callers would corrupt
//! the framing. Callers must serialize all operations on one instance;
//! independent instances in the same process are fine.

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use sha1::{Digest, Sha1};

use plasma_common::constants::{DIGEST_SIZE, L3_CACHE_SIZE_BYTES};
use plasma_common::error::{PlasmaError, PlasmaResult};
use plasma_common::id::ObjectID;

use crate::buffer::ObjectBuffer;
use crate::config::PlasmaClientConfig;
use crate::conn::SocketConn;
use crate::device::{DeviceMapper, HostOnlyMapper};
use crate::mmap_table::MmapTable;
use crate::object_table::ObjectTable;
use crate::protocol::{self, MessageType, ObjectRequest, ObjectStatus, StoreError};
use crate::release_buffer::ReleaseBuffer;

/// A connection to the local plasma store (and optionally to the manager
/// that mediates cross-host transfers).
///
/// Each successful `create` or `get` hands out a buffer aliasing shared
/// memory and must be balanced by exactly one `release` (or `abort` for an
/// unsealed object). Buffers must not be used after the balancing call.
pub struct PlasmaClient {
    store_conn: SocketConn,
    manager_conn: Option<SocketConn>,
    mmap_table: MmapTable,
    objects_in_use: ObjectTable,
    release_buffer: ReleaseBuffer,
    store_capacity: i64,
    device_mapper: Box<dyn DeviceMapper>,
    /// Set after a transport or protocol failure; all later calls fail
    /// fast, since the stream can no longer be trusted to be in frame.
    poisoned: bool,
}

impl PlasmaClient {
    /// Connect to the store socket (and the manager socket when
    /// `manager_socket_name` is non-empty), retrieve the store capacity,
    /// and initialize empty tables. On platforms without ancillary fd
    /// passing this fails with `NotSupported` before opening anything.
    pub fn connect(
        store_socket_name: &str,
        manager_socket_name: Option<&str>,
        config: PlasmaClientConfig,
    ) -> PlasmaResult<Self> {
        let mut store_conn = SocketConn::connect(store_socket_name, config.num_retries)?;
        let manager_conn = match manager_socket_name {
            Some(path) if !path.is_empty() => Some(SocketConn::connect(path, config.num_retries)?),
            _ => None,
        };

        let store_capacity = (|| -> PlasmaResult<i64> {
            store_conn.send(MessageType::ConnectRequest, &[])?;
            let mut reply = store_conn.recv_expect(MessageType::ConnectReply)?;
            protocol::decode_connect_reply(&mut reply)
        })()
        .map_err(|err| {
            PlasmaError::connection_failed(format!("store handshake failed: {err}"))
        })?;

        let byte_limit = config
            .cache_limit_bytes
            .unwrap_or_else(|| L3_CACHE_SIZE_BYTES.min(store_capacity / 100));
        tracing::debug!(
            store = store_socket_name,
            store_capacity,
            byte_limit,
            release_delay = config.release_delay,
            "plasma client connected"
        );

        Ok(Self {
            store_conn,
            manager_conn,
            mmap_table: MmapTable::new(),
            objects_in_use: ObjectTable::new(),
            release_buffer: ReleaseBuffer::new(config.release_delay, byte_limit),
            store_capacity,
            device_mapper: Box::new(HostOnlyMapper),
            poisoned: false,
        })
    }

    /// Replace the device-memory backend used for `device_num > 0` objects.
    pub fn set_device_mapper(&mut self, mapper: Box<dyn DeviceMapper>) {
        self.device_mapper = mapper;
    }

    // ─── Object creation ────────────────────────────────────────────────

    /// Create an object and return a writable buffer over its data region.
    /// The caller writes the payload, then calls [`seal`](Self::seal);
    /// `metadata` is copied into shared memory here.
    pub fn create(
        &mut self,
        object_id: ObjectID,
        data_size: i64,
        metadata: &[u8],
        device_num: i32,
    ) -> PlasmaResult<ObjectBuffer> {
        self.check_usable()?;
        if data_size < 0 {
            return Err(PlasmaError::invalid_argument(format!(
                "negative data size {data_size}"
            )));
        }
        if device_num != 0 && !self.device_mapper.supports_device(device_num) {
            return Err(PlasmaError::not_supported(format!(
                "no device support configured for device {device_num}"
            )));
        }
        if self.objects_in_use.contains(&object_id) {
            return Err(PlasmaError::illegal_state(format!(
                "object {object_id} is already in use by this client"
            )));
        }

        let payload =
            protocol::encode_create_request(&object_id, data_size, metadata.len() as i64, device_num);
        let mut reply =
            self.store_round_trip(MessageType::CreateRequest, &payload, MessageType::CreateReply)?;
        let decoded = protocol::decode_create_reply(&mut reply);
        let (reply_id, error, object) = self.note_fatal(decoded)?;
        if reply_id != object_id {
            return self.note_fatal(Err(PlasmaError::protocol_error(
                "create reply names a different object",
            )));
        }
        if error != StoreError::Ok {
            return Err(map_store_error(error, "create"));
        }
        if object.metadata_size != metadata.len() as i64 || object.data_size != data_size {
            return self.note_fatal(Err(PlasmaError::protocol_error(
                "create reply layout does not match the request",
            )));
        }

        let device_base = if object.device_num == 0 {
            let base = self.receive_and_map(object.store_fd, object.map_size)?;
            // The metadata lives in shared memory from the start.
            if !metadata.is_empty() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        metadata.as_ptr(),
                        base.add(object.metadata_offset as usize),
                        metadata.len(),
                    );
                }
            }
            std::ptr::null_mut()
        } else {
            self.device_mapper.map_object(&object)?
        };

        let newly = self
            .objects_in_use
            .begin_use(object_id, object, false, device_base);
        debug_assert!(newly);
        if object.device_num == 0 {
            self.mmap_table.increment(object.store_fd);
        }
        Ok(self.buffer_for_entry(&object_id))
    }

    /// Seal an object created by this client, making it immutable and
    /// visible to other clients. The content digest is computed here and
    /// shipped with the request.
    pub fn seal(&mut self, object_id: &ObjectID) -> PlasmaResult<()> {
        self.check_usable()?;
        let entry = self.objects_in_use.lookup(object_id).ok_or_else(|| {
            PlasmaError::illegal_state(format!("cannot seal {object_id}: not created by this client"))
        })?;
        if entry.is_sealed {
            return Err(PlasmaError::illegal_state(format!(
                "object {object_id} is already sealed"
            )));
        }
        let digest = self.compute_digest_for(object_id)?;

        let payload = protocol::encode_seal_request(object_id, &digest);
        let mut reply =
            self.store_round_trip(MessageType::SealRequest, &payload, MessageType::SealReply)?;
        let decoded = protocol::decode_object_reply(&mut reply);
        let (_, error) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            return Err(map_store_error(error, "seal"));
        }

        self.objects_in_use
            .lookup_mut(object_id)
            .expect("entry verified above")
            .is_sealed = true;
        Ok(())
    }

    /// Abort an unsealed object, returning its memory to the store as if it
    /// had never been created. Requires that the creator's reference is the
    /// only one.
    pub fn abort(&mut self, object_id: &ObjectID) -> PlasmaResult<()> {
        self.check_usable()?;
        let entry = self.objects_in_use.lookup(object_id).ok_or_else(|| {
            PlasmaError::illegal_state(format!("cannot abort {object_id}: not created by this client"))
        })?;
        if entry.is_sealed {
            return Err(PlasmaError::illegal_state(format!(
                "cannot abort {object_id}: already sealed"
            )));
        }
        if entry.count != 1 {
            return Err(PlasmaError::illegal_state(format!(
                "cannot abort {object_id}: {} outstanding references",
                entry.count
            )));
        }

        let payload = protocol::encode_id_request(object_id);
        let mut reply =
            self.store_round_trip(MessageType::AbortRequest, &payload, MessageType::AbortReply)?;
        let decoded = protocol::decode_object_reply(&mut reply);
        let (_, error) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            return Err(map_store_error(error, "abort"));
        }

        self.drop_entry(object_id);
        Ok(())
    }

    // ─── Acquiring and releasing ────────────────────────────────────────

    /// Get a batch of objects, blocking until all are available locally or
    /// `timeout_ms` elapses (-1 waits indefinitely). Slots for objects not
    /// available in time report `data_size() == -1` and hold no reference;
    /// every present slot must be balanced by one `release`.
    pub fn get(
        &mut self,
        object_ids: &[ObjectID],
        timeout_ms: i64,
    ) -> PlasmaResult<Vec<ObjectBuffer>> {
        self.check_usable()?;
        // Validate up front so an illegal request mutates nothing.
        for object_id in object_ids {
            if let Some(entry) = self.objects_in_use.lookup(object_id) {
                if !entry.is_sealed {
                    return Err(PlasmaError::illegal_state(format!(
                        "object {object_id} is still being created by this client"
                    )));
                }
            }
        }

        // Partition into locally-held and missing; the store request is
        // deduplicated so each in-use entry pins exactly one store-side
        // reference however many slots ask for the same object.
        let mut slots: Vec<Option<ObjectBuffer>> = Vec::with_capacity(object_ids.len());
        let mut missing: Vec<ObjectID> = Vec::new();
        let mut missing_slots: Vec<Vec<usize>> = Vec::new();
        let mut missing_index: std::collections::HashMap<ObjectID, usize> =
            std::collections::HashMap::new();
        for (index, object_id) in object_ids.iter().enumerate() {
            if self.objects_in_use.contains(object_id) {
                self.add_local_ref(*object_id);
                slots.push(Some(self.buffer_for_entry(object_id)));
            } else {
                slots.push(None);
                match missing_index.get(object_id) {
                    Some(&position) => missing_slots[position].push(index),
                    None => {
                        missing_index.insert(*object_id, missing.len());
                        missing.push(*object_id);
                        missing_slots.push(vec![index]);
                    }
                }
            }
        }

        if !missing.is_empty() {
            let payload = protocol::encode_get_request(&missing, timeout_ms);
            let mut reply =
                self.store_round_trip(MessageType::GetRequest, &payload, MessageType::GetReply)?;
            let decoded = protocol::decode_get_reply(&mut reply);
            let (objects, mmap_fds) = self.note_fatal(decoded)?;
            if objects.len() != missing.len() {
                return self.note_fatal(Err(PlasmaError::protocol_error(format!(
                    "get reply carries {} objects for {} requested",
                    objects.len(),
                    missing.len()
                ))));
            }

            // Map every new region first; descriptors arrive in reply order.
            for (store_fd, mmap_size) in &mmap_fds {
                self.receive_and_map(*store_fd, *mmap_size)?;
            }

            for (position, (reply_id, object)) in objects.iter().enumerate() {
                if *reply_id != missing[position] {
                    return self.note_fatal(Err(PlasmaError::protocol_error(
                        "get reply out of order with the request",
                    )));
                }
                if object.data_size < 0 {
                    continue; // not available in time; slot stays absent
                }
                let device_base = if object.device_num == 0 {
                    std::ptr::null_mut()
                } else {
                    self.device_mapper.map_object(object)?
                };
                for &slot in &missing_slots[position] {
                    let newly =
                        self.objects_in_use
                            .begin_use(*reply_id, *object, true, device_base);
                    if newly && object.device_num == 0 {
                        self.mmap_table.increment(object.store_fd);
                    }
                    slots[slot] = Some(self.buffer_for_entry(reply_id));
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(ObjectBuffer::absent))
            .collect())
    }

    /// Drop one reference to an object. When the last reference goes, the
    /// object enters the release window: it stays mapped and reacquirable
    /// until enough newer releases (or queued bytes) push it out, at which
    /// point the store-side release is performed.
    pub fn release(&mut self, object_id: &ObjectID) -> PlasmaResult<()> {
        self.check_usable()?;
        let entry = self.objects_in_use.lookup(object_id).ok_or_else(|| {
            PlasmaError::illegal_state(format!("release of {object_id} without a matching get"))
        })?;
        if !entry.is_sealed {
            return Err(PlasmaError::illegal_state(format!(
                "object {object_id} is still being created; seal or abort it"
            )));
        }
        if entry.count == 0 {
            return Err(PlasmaError::illegal_state(format!(
                "release of {object_id} without a matching get"
            )));
        }
        let object_bytes = entry.object.total_size();

        if self.objects_in_use.end_use(object_id) == 0 {
            self.release_buffer.push(*object_id, object_bytes);
            self.flush_over_limit()?;
        }
        Ok(())
    }

    // ─── One-shot store queries ─────────────────────────────────────────

    /// Whether the store holds a sealed copy of the object.
    pub fn contains(&mut self, object_id: &ObjectID) -> PlasmaResult<bool> {
        self.check_usable()?;
        let payload = protocol::encode_id_request(object_id);
        let mut reply = self.store_round_trip(
            MessageType::ContainsRequest,
            &payload,
            MessageType::ContainsReply,
        )?;
        let decoded = protocol::decode_contains_reply(&mut reply);
        let (_, has_object) = self.note_fatal(decoded)?;
        Ok(has_object)
    }

    /// Ask the store to delete an object. Best-effort: the store silently
    /// ignores objects that are absent, unsealed, or still in use.
    pub fn delete(&mut self, object_id: &ObjectID) -> PlasmaResult<()> {
        self.check_usable()?;
        let payload = protocol::encode_id_request(object_id);
        let mut reply = self.store_round_trip(
            MessageType::DeleteRequest,
            &payload,
            MessageType::DeleteReply,
        )?;
        let decoded = protocol::decode_object_reply(&mut reply);
        let (_, error) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            tracing::debug!(object_id = %object_id, ?error, "delete ignored by the store");
        }
        Ok(())
    }

    /// Ask the store to evict up to `num_bytes` of sealed, unused objects.
    /// Returns the number of bytes actually freed.
    pub fn evict(&mut self, num_bytes: i64) -> PlasmaResult<i64> {
        self.check_usable()?;
        let payload = protocol::encode_evict_request(num_bytes);
        let mut reply =
            self.store_round_trip(MessageType::EvictRequest, &payload, MessageType::EvictReply)?;
        let decoded = protocol::decode_evict_reply(&mut reply);
        self.note_fatal(decoded)
    }

    /// The content digest of an object: computed locally while this client
    /// is still creating it, otherwise fetched from the store (which may
    /// return its cached value).
    pub fn hash(&mut self, object_id: &ObjectID) -> PlasmaResult<[u8; DIGEST_SIZE]> {
        self.check_usable()?;
        if let Some(entry) = self.objects_in_use.lookup(object_id) {
            if !entry.is_sealed {
                return self.compute_digest_for(object_id);
            }
        }

        let payload = protocol::encode_id_request(object_id);
        let mut reply =
            self.store_round_trip(MessageType::HashRequest, &payload, MessageType::HashReply)?;
        let decoded = protocol::decode_hash_reply(&mut reply);
        let (_, error, digest) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            return Err(map_store_error(error, "hash"));
        }
        Ok(digest)
    }

    /// A human-readable dump of the store's state.
    pub fn get_debug_string(&mut self) -> PlasmaResult<String> {
        self.check_usable()?;
        let mut reply = self.store_round_trip(
            MessageType::DebugStringRequest,
            &[],
            MessageType::DebugStringReply,
        )?;
        let decoded = protocol::decode_debug_string_reply(&mut reply);
        self.note_fatal(decoded)
    }

    // ─── Notifications ──────────────────────────────────────────────────

    /// Subscribe to seal notifications. Returns the read end of a socket
    /// pair whose write end was handed to the store; one 36-byte frame
    /// arrives per seal or deletion (see [`crate::notification`]).
    #[cfg(unix)]
    pub fn subscribe(&mut self) -> PlasmaResult<OwnedFd> {
        self.check_usable()?;

        let mut raw: [libc::c_int; 2] = [0; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, raw.as_mut_ptr()) };
        if ret != 0 {
            return Err(PlasmaError::io_error(format!(
                "socketpair for notifications failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let client_end = unsafe { OwnedFd::from_raw_fd(raw[0]) };
        let store_end = unsafe { OwnedFd::from_raw_fd(raw[1]) };

        // The store's end is non-blocking: its event loop never stalls on a
        // slow subscriber.
        unsafe {
            let flags = libc::fcntl(store_end.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(store_end.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let sent = self
            .store_conn
            .send(MessageType::SubscribeRequest, &[])
            .and_then(|_| self.store_conn.send_fd(store_end.as_raw_fd()));
        self.note_fatal(sent)?;
        drop(store_end);
        Ok(client_end)
    }

    // ─── Manager operations ─────────────────────────────────────────────

    /// Ask the manager to start transferring objects to the local store.
    /// Non-blocking and idempotent; arrival is not guaranteed.
    pub fn fetch(&mut self, object_ids: &[ObjectID]) -> PlasmaResult<()> {
        self.check_usable()?;
        self.require_manager()?;
        let payload = protocol::encode_fetch_request(object_ids);
        let sent = self
            .manager_conn
            .as_mut()
            .expect("manager checked above")
            .send(MessageType::FetchRequest, &payload);
        self.note_fatal(sent)
    }

    /// Block until `num_ready` of the given requests are satisfied or the
    /// timeout expires. Each output slot reports where the object was
    /// found; slots still unsatisfied at return report `Nonexistent`.
    pub fn wait(
        &mut self,
        requests: &[ObjectRequest],
        num_ready: usize,
        timeout_ms: i64,
    ) -> PlasmaResult<Vec<ObjectStatus>> {
        self.check_usable()?;
        self.require_manager()?;
        if num_ready > requests.len() {
            return Err(PlasmaError::invalid_argument(format!(
                "num_ready {} exceeds the {} requests",
                num_ready,
                requests.len()
            )));
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let payload = protocol::encode_wait_request(requests, num_ready as i32, timeout_ms);
        let mut reply =
            self.manager_round_trip(MessageType::WaitRequest, &payload, MessageType::WaitReply)?;
        let decoded = protocol::decode_wait_reply(&mut reply);
        let results = self.note_fatal(decoded)?;
        if results.len() != requests.len() {
            return self.note_fatal(Err(PlasmaError::protocol_error(format!(
                "wait reply carries {} results for {} requests",
                results.len(),
                requests.len()
            ))));
        }
        for (request, (reply_id, _)) in requests.iter().zip(&results) {
            if request.object_id != *reply_id {
                return self.note_fatal(Err(PlasmaError::protocol_error(
                    "wait reply out of order with the request",
                )));
            }
        }
        Ok(results.into_iter().map(|(_, status)| status).collect())
    }

    /// Ask the manager to push a local object to a remote manager.
    pub fn transfer(&mut self, addr: &str, port: i32, object_id: &ObjectID) -> PlasmaResult<()> {
        self.check_usable()?;
        self.require_manager()?;
        let payload = protocol::encode_transfer_request(addr, port, object_id);
        let mut reply = self.manager_round_trip(
            MessageType::TransferRequest,
            &payload,
            MessageType::TransferReply,
        )?;
        let decoded = protocol::decode_object_reply(&mut reply);
        let (_, error) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            return Err(map_store_error(error, "transfer"));
        }
        Ok(())
    }

    /// Where the object currently is, possibly consulting the object table.
    pub fn info(&mut self, object_id: &ObjectID) -> PlasmaResult<ObjectStatus> {
        self.check_usable()?;
        self.require_manager()?;
        let payload = protocol::encode_id_request(object_id);
        let mut reply = self.manager_round_trip(
            MessageType::StatusRequest,
            &payload,
            MessageType::StatusReply,
        )?;
        let decoded = protocol::decode_status_reply(&mut reply);
        let (_, status) = self.note_fatal(decoded)?;
        Ok(status)
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Flush the whole release window, then shut down. Fails if the caller
    /// still holds references (unbalanced create/get); the mappings are
    /// reclaimed by `Drop` regardless.
    pub fn disconnect(mut self) -> PlasmaResult<()> {
        self.check_usable()?;
        while let Some(oldest) = self.release_buffer.pop_oldest() {
            self.perform_release(oldest)?;
        }
        if !self.objects_in_use.is_empty() {
            return Err(PlasmaError::illegal_state(format!(
                "{} objects still referenced at disconnect",
                self.objects_in_use.len()
            )));
        }
        debug_assert!(self.mmap_table.is_empty());
        Ok(())
    }

    // ─── Introspection ──────────────────────────────────────────────────

    /// Memory capacity the store reported at connect time.
    pub fn store_capacity(&self) -> i64 {
        self.store_capacity
    }

    /// Number of objects this client currently holds entries for
    /// (including those sitting in the release window).
    pub fn num_objects_in_use(&self) -> usize {
        self.objects_in_use.len()
    }

    /// Number of live shared mappings.
    pub fn num_mapped_regions(&self) -> usize {
        self.mmap_table.len()
    }

    /// Number of objects in the release window.
    pub fn pending_release_count(&self) -> usize {
        self.release_buffer.len()
    }

    /// Bytes of objects in the release window.
    pub fn pending_release_bytes(&self) -> i64 {
        self.release_buffer.queued_bytes()
    }

    /// Whether the manager connection exists.
    pub fn has_manager(&self) -> bool {
        self.manager_conn.is_some()
    }

    /// Verify the cross-table accounting; panics on violation. Exposed for
    /// tests and debugging.
    pub fn check_consistency(&self) {
        use std::collections::{HashMap, HashSet};

        let mut expected_counts: HashMap<i32, i64> = HashMap::new();
        for (object_id, entry) in self.objects_in_use.iter() {
            assert!(entry.count >= 0, "negative count for {object_id}");
            if entry.object.device_num == 0 {
                assert!(
                    self.mmap_table.contains(entry.object.store_fd),
                    "in-use object {object_id} has no mapping"
                );
                *expected_counts.entry(entry.object.store_fd).or_insert(0) += 1;
            }
            if !entry.is_sealed {
                assert_eq!(
                    entry.count, 1,
                    "unsealed object {object_id} must hold exactly the creator's reference"
                );
                assert!(
                    !self.release_buffer.contains(object_id),
                    "unsealed object {object_id} is in the release window"
                );
            }
            if entry.count == 0 {
                assert!(
                    self.release_buffer.contains(object_id),
                    "zero-reference object {object_id} is missing from the release window"
                );
            }
        }
        assert_eq!(
            self.mmap_table.len(),
            expected_counts.len(),
            "mappings exist with no in-use objects"
        );
        for (store_fd, count) in expected_counts {
            assert_eq!(
                self.mmap_table.count(store_fd),
                Some(count),
                "mapping {store_fd} count does not match its in-use objects"
            );
        }

        let mut seen = HashSet::new();
        for object_id in self.release_buffer.iter() {
            assert!(seen.insert(*object_id), "object {object_id} queued twice");
            let entry = self
                .objects_in_use
                .lookup(object_id)
                .unwrap_or_else(|| panic!("queued object {object_id} is not in the in-use table"));
            assert_eq!(entry.count, 0, "queued object {object_id} still has references");
            assert!(entry.is_sealed, "queued object {object_id} is unsealed");
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn check_usable(&self) -> PlasmaResult<()> {
        if self.poisoned {
            return Err(PlasmaError::disconnected(
                "client is unusable after an earlier transport failure",
            ));
        }
        Ok(())
    }

    /// Record fatal failures so later calls fail fast.
    fn note_fatal<T>(&mut self, result: PlasmaResult<T>) -> PlasmaResult<T> {
        if let Err(error) = &result {
            if error.is_fatal() {
                tracing::error!(%error, "plasma connection is no longer usable");
                self.poisoned = true;
            }
        }
        result
    }

    fn store_round_trip(
        &mut self,
        request_type: MessageType,
        payload: &[u8],
        reply_type: MessageType,
    ) -> PlasmaResult<bytes::Bytes> {
        let result = self
            .store_conn
            .send(request_type, payload)
            .and_then(|_| self.store_conn.recv_expect(reply_type));
        self.note_fatal(result)
    }

    fn manager_round_trip(
        &mut self,
        request_type: MessageType,
        payload: &[u8],
        reply_type: MessageType,
    ) -> PlasmaResult<bytes::Bytes> {
        let conn = self
            .manager_conn
            .as_mut()
            .expect("caller checked require_manager");
        let result = conn
            .send(request_type, payload)
            .and_then(|_| conn.recv_expect(reply_type));
        self.note_fatal(result)
    }

    fn require_manager(&self) -> PlasmaResult<()> {
        if self.manager_conn.is_none() {
            return Err(PlasmaError::no_manager(
                "operation requires a manager connection, and none was configured",
            ));
        }
        Ok(())
    }

    /// Receive the descriptor the store just queued on the ancillary
    /// channel and ensure its file is mapped.
    #[cfg(unix)]
    fn receive_and_map(&mut self, store_fd: i32, map_size: i64) -> PlasmaResult<*mut u8> {
        let fd = {
            let received = self.store_conn.recv_fd();
            self.note_fatal(received)?
        };
        let mapped = self.mmap_table.lookup_or_mmap(fd, store_fd, map_size);
        self.note_fatal(mapped)
    }

    /// Unreachable in practice: `connect` refuses platforms without fd
    /// passing, so no client exists to call this.
    #[cfg(not(unix))]
    fn receive_and_map(&mut self, _store_fd: i32, _map_size: i64) -> PlasmaResult<*mut u8> {
        Err(PlasmaError::not_supported(
            "no file descriptor passing on this platform",
        ))
    }

    /// Add a reference to an object already in the table, reclaiming it
    /// from the release window if its count had reached zero.
    fn add_local_ref(&mut self, object_id: ObjectID) {
        let entry = self
            .objects_in_use
            .lookup_mut(&object_id)
            .expect("caller checked presence");
        if entry.count == 0 {
            let reclaimed = self.release_buffer.reclaim(&object_id);
            debug_assert!(reclaimed, "zero-reference object was not queued");
        }
        entry.count += 1;
    }

    /// Build the caller-facing buffer for an in-use entry.
    fn buffer_for_entry(&self, object_id: &ObjectID) -> ObjectBuffer {
        let entry = self
            .objects_in_use
            .lookup(object_id)
            .expect("caller ensured the entry exists");
        let object = &entry.object;
        let base = if object.device_num == 0 {
            self.mmap_table
                .lookup(object.store_fd)
                .unwrap_or_else(|| panic!("no mapping for in-use object {object_id}"))
        } else {
            entry.device_base
        };
        unsafe {
            ObjectBuffer::new(
                base.add(object.data_offset as usize),
                object.data_size,
                base.add(object.metadata_offset as usize),
                object.metadata_size,
                object.device_num,
                !entry.is_sealed,
            )
        }
    }

    /// Flush the oldest queued releases until both window bounds hold.
    fn flush_over_limit(&mut self) -> PlasmaResult<()> {
        while self.release_buffer.over_limit() {
            let Some(oldest) = self.release_buffer.pop_oldest() else {
                break;
            };
            self.perform_release(oldest)?;
        }
        Ok(())
    }

    /// Send the store-side release for an object leaving the window. The
    /// local entry is dropped whether or not the store acknowledges: once
    /// the request is on the wire the store is the source of truth.
    fn perform_release(&mut self, object_id: ObjectID) -> PlasmaResult<()> {
        let result = self.release_round_trip(&object_id);
        self.drop_entry(&object_id);
        result
    }

    fn release_round_trip(&mut self, object_id: &ObjectID) -> PlasmaResult<()> {
        let payload = protocol::encode_id_request(object_id);
        let mut reply = self.store_round_trip(
            MessageType::ReleaseRequest,
            &payload,
            MessageType::ReleaseReply,
        )?;
        let decoded = protocol::decode_object_reply(&mut reply);
        let (_, error) = self.note_fatal(decoded)?;
        if error != StoreError::Ok {
            return Err(map_store_error(error, "release"));
        }
        Ok(())
    }

    /// Remove an in-use entry and unpin its mapping (unmapping at zero).
    fn drop_entry(&mut self, object_id: &ObjectID) {
        if let Some(entry) = self.objects_in_use.remove(object_id) {
            if entry.object.device_num == 0 {
                self.mmap_table.decrement(entry.object.store_fd);
            } else if let Err(error) = self.device_mapper.unmap_object(&entry.object) {
                tracing::warn!(%object_id, %error, "failed to unmap device object");
            }
        }
    }

    /// SHA-1 over the object's data then metadata, read from the mapping.
    fn compute_digest_for(&self, object_id: &ObjectID) -> PlasmaResult<[u8; DIGEST_SIZE]> {
        let entry = self
            .objects_in_use
            .lookup(object_id)
            .expect("caller ensured the entry exists");
        let object = &entry.object;
        if object.device_num != 0 {
            return Err(PlasmaError::not_supported(
                "hashing device-resident objects",
            ));
        }
        let base = self
            .mmap_table
            .lookup(object.store_fd)
            .unwrap_or_else(|| panic!("no mapping for in-use object {object_id}"));

        let mut hasher = Sha1::new();
        unsafe {
            hasher.update(std::slice::from_raw_parts(
                base.add(object.data_offset as usize),
                object.data_size as usize,
            ));
            hasher.update(std::slice::from_raw_parts(
                base.add(object.metadata_offset as usize),
                object.metadata_size as usize,
            ));
        }
        Ok(hasher.finalize().into())
    }
}

impl Drop for PlasmaClient {
    fn drop(&mut self) {
        if !self.objects_in_use.is_empty() {
            tracing::warn!(
                objects = self.objects_in_use.len(),
                "plasma client dropped with objects still referenced"
            );
        }
        // Sockets close and the mmap table unmaps its regions with their
        // own Drop impls.
    }
}

fn map_store_error(error: StoreError, what: &str) -> PlasmaError {
    match error {
        StoreError::Ok => PlasmaError::protocol_error(format!("{what}: spurious ok mapping")),
        StoreError::ObjectExists => {
            PlasmaError::object_exists(format!("{what}: the store already holds this object"))
        }
        StoreError::ObjectNonexistent => {
            PlasmaError::object_not_found(format!("{what}: the store does not hold this object"))
        }
        StoreError::OutOfMemory => {
            PlasmaError::out_of_memory(format!("{what}: the store cannot allocate the object"))
        }
        StoreError::TransientOutOfMemory => PlasmaError::transient_store_full(format!(
            "{what}: the store is full; evicting may free space"
        )),
        StoreError::ObjectNotSealed => {
            PlasmaError::illegal_state(format!("{what}: the object is not sealed"))
        }
        StoreError::ObjectInUse => {
            PlasmaError::illegal_state(format!("{what}: the object is in use"))
        }
        StoreError::ObjectSealed => {
            PlasmaError::illegal_state(format!("{what}: the object is already sealed"))
        }
        StoreError::UnexpectedError => {
            PlasmaError::protocol_error(format!("{what}: the store reported an unexpected error"))
        }
    }
}
