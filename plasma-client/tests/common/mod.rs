// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-process mock of the plasma store and manager daemons for integration
//! tests.
//!
//! Speaks the real wire protocol over real Unix sockets, backs objects with
//! real (anonymous) files, and passes their descriptors with SCM_RIGHTS, so
//! the client under test exercises its actual mmap and fd-handling paths.
//! One thread per accepted connection; shared state behind a mutex with a
//! condvar for the blocking Get path.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use plasma_client::buffer::PlasmaObject;
use plasma_client::conn::SocketConn;
use plasma_client::notification::{encode_notification, ObjectNotification};
use plasma_client::protocol::{self, MessageType, ObjectStatus, QueryType, StoreError};
use plasma_client::ObjectID;

struct StoredObject {
    /// Backing file; kept open so the descriptor can be re-sent to any
    /// client that gets the object.
    file: File,
    object: PlasmaObject,
    sealed: bool,
    /// Store-side reference count across all client connections.
    ref_count: i64,
    digest: [u8; 20],
}

struct Inner {
    objects: HashMap<ObjectID, StoredObject>,
    capacity: i64,
    bytes_allocated: i64,
    next_store_fd: i32,
    /// Notification write-ends received from subscribers.
    subscribers: Vec<UnixStream>,
    /// Objects known to exist on other hosts (manager-side knowledge).
    remote_objects: HashSet<ObjectID>,
    /// Objects the manager has been asked to fetch.
    fetched: HashSet<ObjectID>,
    /// Transfers the manager has been asked to perform.
    transfers: Vec<(String, i32, ObjectID)>,
}

type Shared = Arc<(Mutex<Inner>, Condvar)>;

/// A mock store daemon, optionally with a mock manager daemon, listening on
/// Unix sockets in a temporary directory.
pub struct MockPlasma {
    shared: Shared,
    store_path: String,
    manager_path: Option<String>,
    _dir: tempfile::TempDir,
}

impl MockPlasma {
    pub fn start(capacity: i64) -> Self {
        Self::start_inner(capacity, false)
    }

    pub fn start_with_manager(capacity: i64) -> Self {
        Self::start_inner(capacity, true)
    }

    fn start_inner(capacity: i64, with_manager: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let shared: Shared = Arc::new((
            Mutex::new(Inner {
                objects: HashMap::new(),
                capacity,
                bytes_allocated: 0,
                next_store_fd: 1,
                subscribers: Vec::new(),
                remote_objects: HashSet::new(),
                fetched: HashSet::new(),
                transfers: Vec::new(),
            }),
            Condvar::new(),
        ));

        let store_path = dir.path().join("store.sock").to_str().unwrap().to_string();
        spawn_acceptor(&store_path, shared.clone(), handle_store_connection);

        let manager_path = with_manager.then(|| {
            let path = dir.path().join("manager.sock").to_str().unwrap().to_string();
            spawn_acceptor(&path, shared.clone(), handle_manager_connection);
            path
        });

        Self {
            shared,
            store_path,
            manager_path,
            _dir: dir,
        }
    }

    pub fn store_socket(&self) -> &str {
        &self.store_path
    }

    pub fn manager_socket(&self) -> Option<&str> {
        self.manager_path.as_deref()
    }

    /// Mark an object as available on a remote host (manager knowledge).
    pub fn add_remote_object(&self, object_id: ObjectID) {
        self.shared.0.lock().remote_objects.insert(object_id);
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.shared.0.lock().objects.contains_key(object_id)
    }

    pub fn is_sealed(&self, object_id: &ObjectID) -> bool {
        self.shared
            .0
            .lock()
            .objects
            .get(object_id)
            .map(|o| o.sealed)
            .unwrap_or(false)
    }

    /// Store-side reference count, or None when the store dropped the
    /// object.
    pub fn ref_count(&self, object_id: &ObjectID) -> Option<i64> {
        self.shared
            .0
            .lock()
            .objects
            .get(object_id)
            .map(|o| o.ref_count)
    }

    pub fn bytes_allocated(&self) -> i64 {
        self.shared.0.lock().bytes_allocated
    }

    pub fn fetched(&self) -> HashSet<ObjectID> {
        self.shared.0.lock().fetched.clone()
    }

    pub fn transfers(&self) -> Vec<(String, i32, ObjectID)> {
        self.shared.0.lock().transfers.clone()
    }
}

fn spawn_acceptor(
    path: &str,
    shared: Shared,
    handler: fn(SocketConn, Shared),
) {
    let listener = UnixListener::bind(path).unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let shared = shared.clone();
            std::thread::spawn(move || handler(SocketConn::from_stream(stream), shared));
        }
    });
}

// ─── Store protocol ─────────────────────────────────────────────────────────

fn handle_store_connection(mut conn: SocketConn, shared: Shared) {
    loop {
        let Ok((message_type, mut payload)) = conn.recv() else {
            return;
        };
        let result = match message_type {
            MessageType::ConnectRequest => {
                let capacity = shared.0.lock().capacity;
                conn.send(
                    MessageType::ConnectReply,
                    &protocol::encode_connect_reply(capacity),
                )
            }
            MessageType::CreateRequest => handle_create(&mut conn, &shared, &mut payload),
            MessageType::SealRequest => handle_seal(&mut conn, &shared, &mut payload),
            MessageType::AbortRequest => handle_abort(&mut conn, &shared, &mut payload),
            MessageType::ReleaseRequest => handle_release(&mut conn, &shared, &mut payload),
            MessageType::ContainsRequest => handle_contains(&mut conn, &shared, &mut payload),
            MessageType::GetRequest => handle_get(&mut conn, &shared, &mut payload),
            MessageType::DeleteRequest => handle_delete(&mut conn, &shared, &mut payload),
            MessageType::EvictRequest => handle_evict(&mut conn, &shared, &mut payload),
            MessageType::SubscribeRequest => handle_subscribe(&mut conn, &shared),
            MessageType::HashRequest => handle_hash(&mut conn, &shared, &mut payload),
            MessageType::DebugStringRequest => {
                let inner = shared.0.lock();
                let debug = format!(
                    "mock store: {} objects, {} bytes",
                    inner.objects.len(),
                    inner.bytes_allocated
                );
                drop(inner);
                conn.send(
                    MessageType::DebugStringReply,
                    &protocol::encode_debug_string_reply(&debug),
                )
            }
            other => panic!("mock store received unexpected {other:?}"),
        };
        if result.is_err() {
            return;
        }
    }
}

fn handle_create(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let (object_id, data_size, metadata_size, device_num) =
        protocol::decode_create_request(payload).unwrap();
    assert_eq!(device_num, 0, "mock store is host-only");

    let (reply, fd) = {
        let mut inner = shared.0.lock();
        let total = data_size + metadata_size;
        if inner.objects.contains_key(&object_id) {
            (
                protocol::encode_create_reply(
                    &object_id,
                    StoreError::ObjectExists,
                    &PlasmaObject::absent(),
                ),
                None,
            )
        } else if total > inner.capacity {
            (
                protocol::encode_create_reply(
                    &object_id,
                    StoreError::OutOfMemory,
                    &PlasmaObject::absent(),
                ),
                None,
            )
        } else if inner.bytes_allocated + total > inner.capacity {
            (
                protocol::encode_create_reply(
                    &object_id,
                    StoreError::TransientOutOfMemory,
                    &PlasmaObject::absent(),
                ),
                None,
            )
        } else {
            let map_size = total.max(8);
            let file = tempfile::tempfile().unwrap();
            file.set_len(map_size as u64).unwrap();
            let store_fd = inner.next_store_fd;
            inner.next_store_fd += 1;

            let object = PlasmaObject {
                store_fd,
                map_size,
                data_offset: 0,
                data_size,
                metadata_offset: data_size as u64,
                metadata_size,
                device_num: 0,
            };
            let raw_fd = file.as_raw_fd();
            inner.bytes_allocated += total;
            inner.objects.insert(
                object_id,
                StoredObject {
                    file,
                    object,
                    sealed: false,
                    ref_count: 1,
                    digest: [0u8; 20],
                },
            );
            (
                protocol::encode_create_reply(&object_id, StoreError::Ok, &object),
                Some(raw_fd),
            )
        }
    };

    conn.send(MessageType::CreateReply, &reply)?;
    if let Some(fd) = fd {
        conn.send_fd(fd)?;
    }
    Ok(())
}

fn handle_seal(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let (object_id, digest) = protocol::decode_seal_request(payload).unwrap();
    let error = {
        let mut inner = shared.0.lock();
        match inner.objects.get_mut(&object_id) {
            None => StoreError::ObjectNonexistent,
            Some(stored) if stored.sealed => StoreError::ObjectSealed,
            Some(stored) => {
                stored.sealed = true;
                stored.digest = digest;
                let notification = ObjectNotification {
                    object_id,
                    data_size: stored.object.data_size,
                    metadata_size: stored.object.metadata_size,
                };
                notify_subscribers(&mut inner, &notification);
                StoreError::Ok
            }
        }
    };
    if error == StoreError::Ok {
        shared.1.notify_all();
    }
    conn.send(
        MessageType::SealReply,
        &protocol::encode_object_reply(&object_id, error),
    )
}

fn handle_abort(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let object_id = protocol::decode_id_request(payload).unwrap();
    let error = {
        let mut inner = shared.0.lock();
        match inner.objects.get(&object_id) {
            None => StoreError::ObjectNonexistent,
            Some(stored) if stored.sealed => StoreError::ObjectSealed,
            Some(_) => {
                let stored = inner.objects.remove(&object_id).unwrap();
                inner.bytes_allocated -= stored.object.total_size();
                StoreError::Ok
            }
        }
    };
    conn.send(
        MessageType::AbortReply,
        &protocol::encode_object_reply(&object_id, error),
    )
}

fn handle_release(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let object_id = protocol::decode_id_request(payload).unwrap();
    {
        let mut inner = shared.0.lock();
        if let Some(stored) = inner.objects.get_mut(&object_id) {
            stored.ref_count -= 1;
            assert!(stored.ref_count >= 0, "store ref count went negative");
        }
    }
    conn.send(
        MessageType::ReleaseReply,
        &protocol::encode_object_reply(&object_id, StoreError::Ok),
    )
}

fn handle_contains(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let object_id = protocol::decode_id_request(payload).unwrap();
    let has_object = {
        let inner = shared.0.lock();
        inner
            .objects
            .get(&object_id)
            .map(|o| o.sealed)
            .unwrap_or(false)
    };
    conn.send(
        MessageType::ContainsReply,
        &protocol::encode_contains_reply(&object_id, has_object),
    )
}

fn handle_get(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let (object_ids, timeout_ms) = protocol::decode_get_request(payload).unwrap();
    let deadline =
        (timeout_ms >= 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

    let (lock, condvar) = &**shared;
    let mut inner = lock.lock();
    loop {
        let all_ready = object_ids
            .iter()
            .all(|id| inner.objects.get(id).map(|o| o.sealed).unwrap_or(false));
        if all_ready {
            break;
        }
        match deadline {
            Some(deadline) => {
                if condvar.wait_until(&mut inner, deadline).timed_out() {
                    break;
                }
            }
            None => condvar.wait(&mut inner),
        }
    }

    // Build the reply in request order; collect the distinct mappings of
    // the satisfied entries.
    let mut objects = Vec::with_capacity(object_ids.len());
    let mut mmap_fds: Vec<(i32, i64)> = Vec::new();
    let mut raw_fds: Vec<i32> = Vec::new();
    for object_id in &object_ids {
        match inner.objects.get_mut(object_id) {
            Some(stored) if stored.sealed => {
                stored.ref_count += 1;
                objects.push((*object_id, stored.object));
                if !mmap_fds.iter().any(|(fd, _)| *fd == stored.object.store_fd) {
                    mmap_fds.push((stored.object.store_fd, stored.object.map_size));
                    raw_fds.push(stored.file.as_raw_fd());
                }
            }
            _ => objects.push((*object_id, PlasmaObject::absent())),
        }
    }
    drop(inner);

    conn.send(
        MessageType::GetReply,
        &protocol::encode_get_reply(&objects, &mmap_fds),
    )?;
    for fd in raw_fds {
        conn.send_fd(fd)?;
    }
    Ok(())
}

fn handle_delete(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let object_id = protocol::decode_id_request(payload).unwrap();
    let error = {
        let mut inner = shared.0.lock();
        match inner.objects.get(&object_id) {
            None => StoreError::ObjectNonexistent,
            Some(stored) if !stored.sealed => StoreError::ObjectNotSealed,
            Some(stored) if stored.ref_count > 0 => StoreError::ObjectInUse,
            Some(_) => {
                let stored = inner.objects.remove(&object_id).unwrap();
                inner.bytes_allocated -= stored.object.total_size();
                let notification = ObjectNotification {
                    object_id,
                    data_size: -1,
                    metadata_size: -1,
                };
                notify_subscribers(&mut inner, &notification);
                StoreError::Ok
            }
        }
    };
    conn.send(
        MessageType::DeleteReply,
        &protocol::encode_object_reply(&object_id, error),
    )
}

fn handle_evict(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let num_bytes = protocol::decode_evict_request(payload).unwrap();
    let freed = {
        let mut inner = shared.0.lock();
        let victims: Vec<ObjectID> = inner
            .objects
            .iter()
            .filter(|(_, stored)| stored.sealed && stored.ref_count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut freed = 0i64;
        for object_id in victims {
            if freed >= num_bytes {
                break;
            }
            let stored = inner.objects.remove(&object_id).unwrap();
            freed += stored.object.total_size();
            inner.bytes_allocated -= stored.object.total_size();
            let notification = ObjectNotification {
                object_id,
                data_size: -1,
                metadata_size: -1,
            };
            notify_subscribers(&mut inner, &notification);
        }
        freed
    };
    conn.send(MessageType::EvictReply, &protocol::encode_evict_reply(freed))
}

fn handle_subscribe(
    conn: &mut SocketConn,
    shared: &Shared,
) -> Result<(), plasma_client::PlasmaError> {
    let fd = conn.recv_fd()?;
    shared.0.lock().subscribers.push(UnixStream::from(fd));
    Ok(())
}

fn handle_hash(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let object_id = protocol::decode_id_request(payload).unwrap();
    let (error, digest) = {
        let inner = shared.0.lock();
        match inner.objects.get(&object_id) {
            Some(stored) if stored.sealed => (StoreError::Ok, stored.digest),
            Some(_) => (StoreError::ObjectNotSealed, [0u8; 20]),
            None => (StoreError::ObjectNonexistent, [0u8; 20]),
        }
    };
    conn.send(
        MessageType::HashReply,
        &protocol::encode_hash_reply(&object_id, error, &digest),
    )
}

fn notify_subscribers(inner: &mut Inner, notification: &ObjectNotification) {
    let frame = encode_notification(notification);
    // Dead or saturated subscribers are dropped silently.
    inner
        .subscribers
        .retain_mut(|stream| stream.write_all(&frame).is_ok());
}

// ─── Manager protocol ───────────────────────────────────────────────────────

fn handle_manager_connection(mut conn: SocketConn, shared: Shared) {
    loop {
        let Ok((message_type, mut payload)) = conn.recv() else {
            return;
        };
        let result = match message_type {
            MessageType::FetchRequest => {
                let ids = protocol::decode_fetch_request(&mut payload).unwrap();
                shared.0.lock().fetched.extend(ids);
                Ok(())
            }
            MessageType::WaitRequest => handle_wait(&mut conn, &shared, &mut payload),
            MessageType::StatusRequest => {
                let object_id = protocol::decode_id_request(&mut payload).unwrap();
                let status = object_status(&shared, &object_id);
                conn.send(
                    MessageType::StatusReply,
                    &protocol::encode_status_reply(&object_id, status),
                )
            }
            MessageType::TransferRequest => {
                let (addr, port, object_id) =
                    protocol::decode_transfer_request(&mut payload).unwrap();
                let error = {
                    let mut inner = shared.0.lock();
                    let local = inner
                        .objects
                        .get(&object_id)
                        .map(|o| o.sealed)
                        .unwrap_or(false);
                    if local {
                        inner.transfers.push((addr, port, object_id));
                        StoreError::Ok
                    } else {
                        StoreError::ObjectNonexistent
                    }
                };
                conn.send(
                    MessageType::TransferReply,
                    &protocol::encode_object_reply(&object_id, error),
                )
            }
            other => panic!("mock manager received unexpected {other:?}"),
        };
        if result.is_err() {
            return;
        }
    }
}

fn object_status(shared: &Shared, object_id: &ObjectID) -> ObjectStatus {
    let inner = shared.0.lock();
    if inner
        .objects
        .get(object_id)
        .map(|o| o.sealed)
        .unwrap_or(false)
    {
        ObjectStatus::Local
    } else if inner.remote_objects.contains(object_id) {
        ObjectStatus::Remote
    } else {
        ObjectStatus::Nonexistent
    }
}

fn handle_wait(
    conn: &mut SocketConn,
    shared: &Shared,
    payload: &mut bytes::Bytes,
) -> Result<(), plasma_client::PlasmaError> {
    let (requests, num_ready, timeout_ms) = protocol::decode_wait_request(payload).unwrap();
    let deadline =
        (timeout_ms >= 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

    let evaluate = |shared: &Shared| -> (Vec<(ObjectID, ObjectStatus)>, usize) {
        let mut results = Vec::with_capacity(requests.len());
        let mut ready = 0usize;
        for request in &requests {
            let status = object_status(shared, &request.object_id);
            let satisfied = match request.query {
                QueryType::Local => status == ObjectStatus::Local,
                QueryType::Anywhere => {
                    status == ObjectStatus::Local || status == ObjectStatus::Remote
                }
            };
            if satisfied {
                ready += 1;
                results.push((request.object_id, status));
            } else {
                results.push((request.object_id, ObjectStatus::Nonexistent));
            }
        }
        (results, ready)
    };

    let results = loop {
        let (results, ready) = evaluate(shared);
        if ready >= num_ready as usize {
            break results;
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => break results,
            _ => std::thread::sleep(Duration::from_millis(2)),
        }
    };

    conn.send(MessageType::WaitReply, &protocol::encode_wait_reply(&results))
}
