// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wire protocol for the store and manager sockets.
//!
//! Every message is framed as `[type: i32 LE][length: u64 LE][payload]`.
//! Payloads are fixed per type and encoded field-by-field little-endian;
//! requests and replies are strictly paired, one outstanding call at a
//! time. Mapping-carrying replies are followed by file descriptors on the
//! socket's ancillary channel (see the `fling` module).
//!
//! Both directions are implemented: the client encodes requests and decodes
//! replies; in-process store implementations (the integration tests run
//! one) use the other half.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use plasma_common::constants::{DIGEST_SIZE, OBJECT_ID_SIZE};
use plasma_common::error::{PlasmaError, PlasmaResult};
use plasma_common::id::ObjectID;

use crate::buffer::PlasmaObject;

/// Frame header: 4-byte type tag + 8-byte payload length.
pub const HEADER_SIZE: usize = 12;

/// Upper bound on a single payload; anything larger is a protocol error.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

// ─── Message types ──────────────────────────────────────────────────────────

/// Frame type tags. Requests are even, their replies odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    ConnectRequest = 0,
    ConnectReply = 1,
    CreateRequest = 2,
    CreateReply = 3,
    SealRequest = 4,
    SealReply = 5,
    AbortRequest = 6,
    AbortReply = 7,
    ReleaseRequest = 8,
    ReleaseReply = 9,
    ContainsRequest = 10,
    ContainsReply = 11,
    GetRequest = 12,
    GetReply = 13,
    DeleteRequest = 14,
    DeleteReply = 15,
    EvictRequest = 16,
    EvictReply = 17,
    SubscribeRequest = 18,
    HashRequest = 19,
    HashReply = 20,
    FetchRequest = 21,
    WaitRequest = 22,
    WaitReply = 23,
    StatusRequest = 24,
    StatusReply = 25,
    TransferRequest = 26,
    TransferReply = 27,
    DebugStringRequest = 28,
    DebugStringReply = 29,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::ConnectRequest,
            1 => Self::ConnectReply,
            2 => Self::CreateRequest,
            3 => Self::CreateReply,
            4 => Self::SealRequest,
            5 => Self::SealReply,
            6 => Self::AbortRequest,
            7 => Self::AbortReply,
            8 => Self::ReleaseRequest,
            9 => Self::ReleaseReply,
            10 => Self::ContainsRequest,
            11 => Self::ContainsReply,
            12 => Self::GetRequest,
            13 => Self::GetReply,
            14 => Self::DeleteRequest,
            15 => Self::DeleteReply,
            16 => Self::EvictRequest,
            17 => Self::EvictReply,
            18 => Self::SubscribeRequest,
            19 => Self::HashRequest,
            20 => Self::HashReply,
            21 => Self::FetchRequest,
            22 => Self::WaitRequest,
            23 => Self::WaitReply,
            24 => Self::StatusRequest,
            25 => Self::StatusReply,
            26 => Self::TransferRequest,
            27 => Self::TransferReply,
            28 => Self::DebugStringRequest,
            29 => Self::DebugStringReply,
            _ => return None,
        })
    }
}

// ─── Wire status codes ──────────────────────────────────────────────────────

/// Store-reported error codes carried inside replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StoreError {
    Ok = 0,
    ObjectExists = 1,
    ObjectNonexistent = 2,
    OutOfMemory = 3,
    TransientOutOfMemory = 4,
    ObjectNotSealed = 5,
    ObjectInUse = 6,
    ObjectSealed = 7,
    UnexpectedError = 8,
}

impl StoreError {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::ObjectExists,
            2 => Self::ObjectNonexistent,
            3 => Self::OutOfMemory,
            4 => Self::TransientOutOfMemory,
            5 => Self::ObjectNotSealed,
            6 => Self::ObjectInUse,
            7 => Self::ObjectSealed,
            8 => Self::UnexpectedError,
            _ => return None,
        })
    }
}

/// Where an object is, as reported by Wait and Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectStatus {
    Nonexistent = 0,
    Local = 1,
    Remote = 2,
    /// Currently being transferred to this host, or scheduled to be.
    Transfer = 3,
}

impl ObjectStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Nonexistent,
            1 => Self::Local,
            2 => Self::Remote,
            3 => Self::Transfer,
            _ => return None,
        })
    }
}

/// Readiness condition for one Wait entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum QueryType {
    /// Satisfied only when the object is sealed in the local store.
    Local = 1,
    /// Satisfied when the object is sealed locally or known remotely.
    Anywhere = 2,
}

impl QueryType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Local,
            2 => Self::Anywhere,
            _ => return None,
        })
    }
}

/// One entry of a Wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRequest {
    pub object_id: ObjectID,
    pub query: QueryType,
}

// ─── Field helpers ──────────────────────────────────────────────────────────

fn need(buf: &Bytes, n: usize, what: &str) -> PlasmaResult<()> {
    if buf.remaining() < n {
        return Err(PlasmaError::protocol_error(format!(
            "truncated payload while reading {what}"
        )));
    }
    Ok(())
}

fn get_i32(buf: &mut Bytes, what: &str) -> PlasmaResult<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

fn get_i64(buf: &mut Bytes, what: &str) -> PlasmaResult<i64> {
    need(buf, 8, what)?;
    Ok(buf.get_i64_le())
}

fn get_u64(buf: &mut Bytes, what: &str) -> PlasmaResult<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_u8(buf: &mut Bytes, what: &str) -> PlasmaResult<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_object_id(buf: &mut Bytes) -> PlasmaResult<ObjectID> {
    need(buf, OBJECT_ID_SIZE, "object id")?;
    let mut bytes = [0u8; OBJECT_ID_SIZE];
    buf.copy_to_slice(&mut bytes);
    Ok(ObjectID::from_binary(&bytes))
}

fn get_digest(buf: &mut Bytes) -> PlasmaResult<[u8; DIGEST_SIZE]> {
    need(buf, DIGEST_SIZE, "digest")?;
    let mut digest = [0u8; DIGEST_SIZE];
    buf.copy_to_slice(&mut digest);
    Ok(digest)
}

fn get_store_error(buf: &mut Bytes) -> PlasmaResult<StoreError> {
    let raw = get_i32(buf, "error code")?;
    StoreError::from_i32(raw)
        .ok_or_else(|| PlasmaError::protocol_error(format!("unknown store error code {raw}")))
}

/// Guard element counts against absurd values before allocating.
fn check_count(buf: &Bytes, count: u64, min_element_size: usize, what: &str) -> PlasmaResult<usize> {
    let available = (buf.remaining() / min_element_size.max(1)) as u64;
    if count > available {
        return Err(PlasmaError::protocol_error(format!(
            "{what} count {count} exceeds payload size"
        )));
    }
    Ok(count as usize)
}

fn put_object(buf: &mut BytesMut, object: &PlasmaObject) {
    buf.put_i32_le(object.store_fd);
    buf.put_i64_le(object.map_size);
    buf.put_u64_le(object.data_offset);
    buf.put_i64_le(object.data_size);
    buf.put_u64_le(object.metadata_offset);
    buf.put_i64_le(object.metadata_size);
    buf.put_i32_le(object.device_num);
}

fn get_object(buf: &mut Bytes) -> PlasmaResult<PlasmaObject> {
    Ok(PlasmaObject {
        store_fd: get_i32(buf, "store fd")?,
        map_size: get_i64(buf, "map size")?,
        data_offset: get_u64(buf, "data offset")?,
        data_size: get_i64(buf, "data size")?,
        metadata_offset: get_u64(buf, "metadata offset")?,
        metadata_size: get_i64(buf, "metadata size")?,
        device_num: get_i32(buf, "device num")?,
    })
}

// ─── Connect ────────────────────────────────────────────────────────────────

pub fn encode_connect_reply(memory_capacity: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(memory_capacity);
    buf.freeze()
}

pub fn decode_connect_reply(buf: &mut Bytes) -> PlasmaResult<i64> {
    get_i64(buf, "memory capacity")
}

// ─── Create ─────────────────────────────────────────────────────────────────

pub fn encode_create_request(
    object_id: &ObjectID,
    data_size: i64,
    metadata_size: i64,
    device_num: i32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 20);
    buf.put_slice(object_id.as_bytes());
    buf.put_i64_le(data_size);
    buf.put_i64_le(metadata_size);
    buf.put_i32_le(device_num);
    buf.freeze()
}

pub fn decode_create_request(buf: &mut Bytes) -> PlasmaResult<(ObjectID, i64, i64, i32)> {
    let object_id = get_object_id(buf)?;
    let data_size = get_i64(buf, "data size")?;
    let metadata_size = get_i64(buf, "metadata size")?;
    let device_num = get_i32(buf, "device num")?;
    Ok((object_id, data_size, metadata_size, device_num))
}

pub fn encode_create_reply(object_id: &ObjectID, error: StoreError, object: &PlasmaObject) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 4 + 48);
    buf.put_slice(object_id.as_bytes());
    buf.put_i32_le(error as i32);
    put_object(&mut buf, object);
    buf.freeze()
}

pub fn decode_create_reply(buf: &mut Bytes) -> PlasmaResult<(ObjectID, StoreError, PlasmaObject)> {
    let object_id = get_object_id(buf)?;
    let error = get_store_error(buf)?;
    let object = get_object(buf)?;
    Ok((object_id, error, object))
}

// ─── Seal ───────────────────────────────────────────────────────────────────

pub fn encode_seal_request(object_id: &ObjectID, digest: &[u8; DIGEST_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + DIGEST_SIZE);
    buf.put_slice(object_id.as_bytes());
    buf.put_slice(digest);
    buf.freeze()
}

pub fn decode_seal_request(buf: &mut Bytes) -> PlasmaResult<(ObjectID, [u8; DIGEST_SIZE])> {
    let object_id = get_object_id(buf)?;
    let digest = get_digest(buf)?;
    Ok((object_id, digest))
}

// ─── Single-ID requests and {id, error} replies ─────────────────────────────
// Abort, Release, Delete, Contains, Hash and Status requests all carry just
// the object ID; Seal, Abort, Release, Delete and Transfer replies all carry
// {id, error}.

pub fn encode_id_request(object_id: &ObjectID) -> Bytes {
    Bytes::copy_from_slice(object_id.as_bytes())
}

pub fn decode_id_request(buf: &mut Bytes) -> PlasmaResult<ObjectID> {
    get_object_id(buf)
}

pub fn encode_object_reply(object_id: &ObjectID, error: StoreError) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 4);
    buf.put_slice(object_id.as_bytes());
    buf.put_i32_le(error as i32);
    buf.freeze()
}

pub fn decode_object_reply(buf: &mut Bytes) -> PlasmaResult<(ObjectID, StoreError)> {
    let object_id = get_object_id(buf)?;
    let error = get_store_error(buf)?;
    Ok((object_id, error))
}

// ─── Contains ───────────────────────────────────────────────────────────────

pub fn encode_contains_reply(object_id: &ObjectID, has_object: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 1);
    buf.put_slice(object_id.as_bytes());
    buf.put_u8(has_object as u8);
    buf.freeze()
}

pub fn decode_contains_reply(buf: &mut Bytes) -> PlasmaResult<(ObjectID, bool)> {
    let object_id = get_object_id(buf)?;
    let has_object = get_u8(buf, "contains flag")? != 0;
    Ok((object_id, has_object))
}

// ─── Get ────────────────────────────────────────────────────────────────────

pub fn encode_get_request(object_ids: &[ObjectID], timeout_ms: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + object_ids.len() * OBJECT_ID_SIZE);
    buf.put_i64_le(timeout_ms);
    buf.put_u64_le(object_ids.len() as u64);
    for id in object_ids {
        buf.put_slice(id.as_bytes());
    }
    buf.freeze()
}

pub fn decode_get_request(buf: &mut Bytes) -> PlasmaResult<(Vec<ObjectID>, i64)> {
    let timeout_ms = get_i64(buf, "timeout")?;
    let count = get_u64(buf, "object count")?;
    let count = check_count(buf, count, OBJECT_ID_SIZE, "get request object")?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(get_object_id(buf)?);
    }
    Ok((ids, timeout_ms))
}

/// Reply entries are in request order; slots the store could not satisfy in
/// time use [`PlasmaObject::absent`]. `mmap_fds` lists the distinct mapped
/// files referenced by the satisfied entries; one descriptor per element
/// follows the reply on the ancillary channel, in order.
pub fn encode_get_reply(objects: &[(ObjectID, PlasmaObject)], mmap_fds: &[(i32, i64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + objects.len() * (OBJECT_ID_SIZE + 48));
    buf.put_u64_le(objects.len() as u64);
    for (id, object) in objects {
        buf.put_slice(id.as_bytes());
        put_object(&mut buf, object);
    }
    buf.put_u64_le(mmap_fds.len() as u64);
    for (store_fd, mmap_size) in mmap_fds {
        buf.put_i32_le(*store_fd);
        buf.put_i64_le(*mmap_size);
    }
    buf.freeze()
}

#[allow(clippy::type_complexity)]
pub fn decode_get_reply(
    buf: &mut Bytes,
) -> PlasmaResult<(Vec<(ObjectID, PlasmaObject)>, Vec<(i32, i64)>)> {
    let count = get_u64(buf, "object count")?;
    let count = check_count(buf, count, OBJECT_ID_SIZE + 48, "get reply object")?;
    let mut objects = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_object_id(buf)?;
        let object = get_object(buf)?;
        objects.push((id, object));
    }
    let fd_count = get_u64(buf, "fd count")?;
    let fd_count = check_count(buf, fd_count, 12, "get reply fd")?;
    let mut mmap_fds = Vec::with_capacity(fd_count);
    for _ in 0..fd_count {
        let store_fd = get_i32(buf, "store fd")?;
        let mmap_size = get_i64(buf, "mmap size")?;
        mmap_fds.push((store_fd, mmap_size));
    }
    Ok((objects, mmap_fds))
}

// ─── Evict ──────────────────────────────────────────────────────────────────

pub fn encode_evict_request(num_bytes: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(num_bytes);
    buf.freeze()
}

pub fn decode_evict_request(buf: &mut Bytes) -> PlasmaResult<i64> {
    get_i64(buf, "evict bytes")
}

pub fn encode_evict_reply(num_bytes_evicted: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_le(num_bytes_evicted);
    buf.freeze()
}

pub fn decode_evict_reply(buf: &mut Bytes) -> PlasmaResult<i64> {
    get_i64(buf, "evicted bytes")
}

// ─── Hash ───────────────────────────────────────────────────────────────────

pub fn encode_hash_reply(
    object_id: &ObjectID,
    error: StoreError,
    digest: &[u8; DIGEST_SIZE],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 4 + DIGEST_SIZE);
    buf.put_slice(object_id.as_bytes());
    buf.put_i32_le(error as i32);
    buf.put_slice(digest);
    buf.freeze()
}

pub fn decode_hash_reply(
    buf: &mut Bytes,
) -> PlasmaResult<(ObjectID, StoreError, [u8; DIGEST_SIZE])> {
    let object_id = get_object_id(buf)?;
    let error = get_store_error(buf)?;
    let digest = get_digest(buf)?;
    Ok((object_id, error, digest))
}

// ─── Fetch ──────────────────────────────────────────────────────────────────

pub fn encode_fetch_request(object_ids: &[ObjectID]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + object_ids.len() * OBJECT_ID_SIZE);
    buf.put_u64_le(object_ids.len() as u64);
    for id in object_ids {
        buf.put_slice(id.as_bytes());
    }
    buf.freeze()
}

pub fn decode_fetch_request(buf: &mut Bytes) -> PlasmaResult<Vec<ObjectID>> {
    let count = get_u64(buf, "object count")?;
    let count = check_count(buf, count, OBJECT_ID_SIZE, "fetch request object")?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(get_object_id(buf)?);
    }
    Ok(ids)
}

// ─── Wait ───────────────────────────────────────────────────────────────────

pub fn encode_wait_request(requests: &[ObjectRequest], num_ready: i32, timeout_ms: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(20 + requests.len() * (OBJECT_ID_SIZE + 4));
    buf.put_u64_le(requests.len() as u64);
    for request in requests {
        buf.put_slice(request.object_id.as_bytes());
        buf.put_i32_le(request.query as i32);
    }
    buf.put_i32_le(num_ready);
    buf.put_i64_le(timeout_ms);
    buf.freeze()
}

pub fn decode_wait_request(buf: &mut Bytes) -> PlasmaResult<(Vec<ObjectRequest>, i32, i64)> {
    let count = get_u64(buf, "request count")?;
    let count = check_count(buf, count, OBJECT_ID_SIZE + 4, "wait request")?;
    let mut requests = Vec::with_capacity(count);
    for _ in 0..count {
        let object_id = get_object_id(buf)?;
        let raw = get_i32(buf, "query type")?;
        let query = QueryType::from_i32(raw)
            .ok_or_else(|| PlasmaError::protocol_error(format!("unknown query type {raw}")))?;
        requests.push(ObjectRequest { object_id, query });
    }
    let num_ready = get_i32(buf, "num ready")?;
    let timeout_ms = get_i64(buf, "timeout")?;
    Ok((requests, num_ready, timeout_ms))
}

pub fn encode_wait_reply(results: &[(ObjectID, ObjectStatus)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + results.len() * (OBJECT_ID_SIZE + 4));
    buf.put_u64_le(results.len() as u64);
    for (id, status) in results {
        buf.put_slice(id.as_bytes());
        buf.put_i32_le(*status as i32);
    }
    buf.freeze()
}

pub fn decode_wait_reply(buf: &mut Bytes) -> PlasmaResult<Vec<(ObjectID, ObjectStatus)>> {
    let count = get_u64(buf, "result count")?;
    let count = check_count(buf, count, OBJECT_ID_SIZE + 4, "wait reply entry")?;
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_object_id(buf)?;
        let raw = get_i32(buf, "object status")?;
        let status = ObjectStatus::from_i32(raw)
            .ok_or_else(|| PlasmaError::protocol_error(format!("unknown object status {raw}")))?;
        results.push((id, status));
    }
    Ok(results)
}

// ─── Status / Info ──────────────────────────────────────────────────────────

pub fn encode_status_reply(object_id: &ObjectID, status: ObjectStatus) -> Bytes {
    let mut buf = BytesMut::with_capacity(OBJECT_ID_SIZE + 4);
    buf.put_slice(object_id.as_bytes());
    buf.put_i32_le(status as i32);
    buf.freeze()
}

pub fn decode_status_reply(buf: &mut Bytes) -> PlasmaResult<(ObjectID, ObjectStatus)> {
    let object_id = get_object_id(buf)?;
    let raw = get_i32(buf, "object status")?;
    let status = ObjectStatus::from_i32(raw)
        .ok_or_else(|| PlasmaError::protocol_error(format!("unknown object status {raw}")))?;
    Ok((object_id, status))
}

// ─── Transfer ───────────────────────────────────────────────────────────────

pub fn encode_transfer_request(addr: &str, port: i32, object_id: &ObjectID) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + addr.len() + OBJECT_ID_SIZE);
    buf.put_u64_le(addr.len() as u64);
    buf.put_slice(addr.as_bytes());
    buf.put_i32_le(port);
    buf.put_slice(object_id.as_bytes());
    buf.freeze()
}

pub fn decode_transfer_request(buf: &mut Bytes) -> PlasmaResult<(String, i32, ObjectID)> {
    let addr_len = get_u64(buf, "address length")?;
    let addr_len = check_count(buf, addr_len, 1, "address byte")?;
    need(buf, addr_len, "address")?;
    let mut addr_bytes = vec![0u8; addr_len];
    buf.copy_to_slice(&mut addr_bytes);
    let addr = String::from_utf8(addr_bytes)
        .map_err(|_| PlasmaError::protocol_error("transfer address is not valid utf-8"))?;
    let port = get_i32(buf, "port")?;
    let object_id = get_object_id(buf)?;
    Ok((addr, port, object_id))
}

// ─── Debug string ───────────────────────────────────────────────────────────

pub fn encode_debug_string_reply(debug_string: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + debug_string.len());
    buf.put_u64_le(debug_string.len() as u64);
    buf.put_slice(debug_string.as_bytes());
    buf.freeze()
}

pub fn decode_debug_string_reply(buf: &mut Bytes) -> PlasmaResult<String> {
    let len = get_u64(buf, "string length")?;
    let len = check_count(buf, len, 1, "string byte")?;
    need(buf, len, "debug string")?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|_| PlasmaError::protocol_error("debug string is not valid utf-8"))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
