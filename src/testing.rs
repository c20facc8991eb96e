//! Deterministic in-memory test harness.
//!
//! [`StubNet`] plays the role of an entire cluster behind the [`Connector`] and
//! [`Transport`] seams: every "node" is a pair of byte buffers plus one shared
//! key space, served by the default binary codec. Requests written by the
//! scheduler are processed synchronously (unless responses are held back to
//! simulate latency), so tests run without sockets, sleeps or real time.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BytesMut};
use serde_json::json;

use crate::codec::{
    BinaryCodec, RequestFrame, OP_ADD, OP_ADMIN, OP_APPEND, OP_FETCH, OP_PREPEND, OP_QUERY,
    OP_QUERY_ROW, OP_REMOVE, OP_REPLACE, OP_TOUCH, OP_UPSERT,
};
use crate::command::AdminMethod;
use crate::error::ServerCode;
use crate::transport::{Connector, Transport};

/// One request as the stub server saw it, for wire-order assertions.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub address: String,
    pub opcode: u8,
    pub correlation_id: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Vec<u8>,
    format: u32,
    cas: u64,
    expiry: u32,
}

#[derive(Default)]
struct NodeBufs {
    /// Client-to-server bytes not yet processed.
    inbox: BytesMut,
    /// Server-to-client bytes not yet read by the scheduler.
    outbox: BytesMut,
    failed: bool,
}

struct StubState {
    codec: BinaryCodec,
    store: HashMap<Vec<u8>, StoredDoc>,
    cas_counter: u64,
    nodes: HashMap<String, NodeBufs>,
    refuse: HashSet<String>,
    hold: bool,
    log: Vec<RequestRecord>,
    query_rows: Vec<serde_json::Value>,
}

/// Shared handle to the simulated cluster.
#[derive(Clone)]
pub struct StubNet {
    inner: Arc<Mutex<StubState>>,
}

impl Default for StubNet {
    fn default() -> Self {
        Self::new()
    }
}

impl StubNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StubState {
                codec: BinaryCodec,
                store: HashMap::new(),
                cas_counter: 0,
                nodes: HashMap::new(),
                refuse: HashSet::new(),
                hold: false,
                log: Vec::new(),
                query_rows: Vec::new(),
            })),
        }
    }

    /// A connector handing out transports into this simulated cluster.
    pub fn connector(&self) -> Box<dyn Connector> {
        let inner = Arc::clone(&self.inner);
        Box::new(StubConnector { inner })
    }

    /// While `true`, requests pile up unanswered — latency injection for
    /// timeout tests. Turning it back off answers everything accumulated.
    pub fn hold_responses(&self, hold: bool) {
        let mut state = self.lock();
        state.hold = hold;
        if !hold {
            let addresses: Vec<String> = state.nodes.keys().cloned().collect();
            for address in addresses {
                process_inbox(&mut state, &address);
            }
        }
    }

    /// Make an established node's transport fail on the next read or write.
    pub fn fail_node(&self, address: &str) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(address) {
            node.failed = true;
        }
    }

    /// Make future connection attempts to this address fail.
    pub fn refuse_connections(&self, address: &str) {
        self.lock().refuse.insert(address.to_string());
    }

    /// Rows the stub streams back for every query, in order.
    pub fn set_query_rows(&self, rows: Vec<serde_json::Value>) {
        self.lock().query_rows = rows;
    }

    /// Requests processed so far, in arrival order.
    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.lock().log.clone()
    }

    /// Current value under `key`, if any.
    pub fn value_of(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().store.get(key).map(|d| d.value.clone())
    }

    /// Current expiry under `key`, if any.
    pub fn expiry_of(&self, key: &[u8]) -> Option<u32> {
        self.lock().store.get(key).map(|d| d.expiry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct StubConnector {
    inner: Arc<Mutex<StubState>>,
}

impl Connector for StubConnector {
    fn connect(&mut self, address: &str) -> io::Result<Box<dyn Transport>> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.refuse.contains(address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", address),
            ));
        }
        state.nodes.entry(address.to_string()).or_default();
        Ok(Box::new(StubTransport {
            inner: Arc::clone(&self.inner),
            address: address.to_string(),
        }))
    }
}

struct StubTransport {
    inner: Arc<Mutex<StubState>>,
    address: String,
}

impl Transport for StubTransport {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let node = state
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown node"))?;
        if node.failed {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "node failed"));
        }
        node.inbox.extend_from_slice(buf);
        if !state.hold {
            let address = self.address.clone();
            process_inbox(&mut state, &address);
        }
        Ok(buf.len())
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let node = state
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown node"))?;
        if node.failed {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "node failed"));
        }
        if node.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no responses"));
        }
        let n = buf.len().min(node.outbox.len());
        buf[..n].copy_from_slice(&node.outbox[..n]);
        node.outbox.advance(n);
        Ok(n)
    }
}

fn process_inbox(state: &mut StubState, address: &str) {
    let codec = state.codec;
    loop {
        let Some(node) = state.nodes.get_mut(address) else {
            return;
        };
        let Some(request) = codec.decode_request(&mut node.inbox) else {
            return;
        };
        state.log.push(RequestRecord {
            address: address.to_string(),
            opcode: request.opcode,
            correlation_id: request.correlation_id,
            key: request.key.to_vec(),
        });
        apply(state, address, &request);
    }
}

fn apply(state: &mut StubState, address: &str, request: &RequestFrame) {
    let codec = state.codec;
    let corr = request.correlation_id;
    let key = request.key.to_vec();

    // CAS discipline shared by the mutating operations: a non-zero token must
    // match the stored document.
    let cas_conflict = request.cas != 0
        && state
            .store
            .get(&key)
            .map_or(false, |doc| doc.cas != request.cas);

    let reply =
        |state: &mut StubState, status: u16, cas: u64, format: Option<u32>, payload: &[u8]| {
            if let Some(node) = state.nodes.get_mut(address) {
                codec.encode_response(corr, request.opcode, status, cas, format, payload, &mut node.outbox);
            }
        };

    match request.opcode {
        OP_FETCH => match state.store.get(&key).cloned() {
            Some(doc) => reply(state, 0, doc.cas, Some(doc.format), &doc.value),
            None => reply(state, ServerCode::KeyNotFound.to_wire(), 0, None, b""),
        },
        OP_UPSERT | OP_ADD | OP_REPLACE => {
            let exists = state.store.contains_key(&key);
            if request.opcode == OP_ADD && exists {
                return reply(state, ServerCode::KeyExists.to_wire(), 0, None, b"");
            }
            if request.opcode == OP_REPLACE && !exists {
                return reply(state, ServerCode::KeyNotFound.to_wire(), 0, None, b"");
            }
            if cas_conflict {
                return reply(state, ServerCode::CasMismatch.to_wire(), 0, None, b"");
            }
            if request.cas != 0 && !exists {
                return reply(state, ServerCode::KeyNotFound.to_wire(), 0, None, b"");
            }
            state.cas_counter += 1;
            let cas = state.cas_counter;
            state.store.insert(
                key,
                StoredDoc {
                    value: request.value.to_vec(),
                    format: request.format(),
                    cas,
                    expiry: request.expiry(),
                },
            );
            reply(state, 0, cas, None, b"");
        }
        OP_APPEND | OP_PREPEND => {
            if !state.store.contains_key(&key) {
                return reply(state, ServerCode::NotStored.to_wire(), 0, None, b"");
            }
            if cas_conflict {
                return reply(state, ServerCode::CasMismatch.to_wire(), 0, None, b"");
            }
            state.cas_counter += 1;
            let cas = state.cas_counter;
            if let Some(doc) = state.store.get_mut(&key) {
                if request.opcode == OP_APPEND {
                    doc.value.extend_from_slice(&request.value);
                } else {
                    let mut joined = request.value.to_vec();
                    joined.extend_from_slice(&doc.value);
                    doc.value = joined;
                }
                doc.cas = cas;
            }
            reply(state, 0, cas, None, b"");
        }
        OP_REMOVE => {
            if !state.store.contains_key(&key) {
                return reply(state, ServerCode::KeyNotFound.to_wire(), 0, None, b"");
            }
            if cas_conflict {
                return reply(state, ServerCode::CasMismatch.to_wire(), 0, None, b"");
            }
            state.store.remove(&key);
            reply(state, 0, 0, None, b"");
        }
        OP_TOUCH => {
            if !state.store.contains_key(&key) {
                return reply(state, ServerCode::KeyNotFound.to_wire(), 0, None, b"");
            }
            let mut cas = 0;
            if let Some(doc) = state.store.get_mut(&key) {
                doc.expiry = request.expiry();
                cas = doc.cas;
            }
            reply(state, 0, cas, None, b"");
        }
        OP_QUERY => {
            let rows = state.query_rows.clone();
            for row in &rows {
                let payload = row.to_string();
                if let Some(node) = state.nodes.get_mut(address) {
                    codec.encode_response(
                        corr,
                        OP_QUERY_ROW,
                        0,
                        0,
                        None,
                        payload.as_bytes(),
                        &mut node.outbox,
                    );
                }
            }
            let meta = json!({ "rowCount": rows.len() }).to_string();
            reply(state, 0, 0, None, meta.as_bytes());
        }
        OP_ADMIN => {
            let method = request.extras.first().copied().and_then(AdminMethod::from_wire);
            let body = json!({
                "ok": method.is_some(),
                "path": String::from_utf8_lossy(&key),
            })
            .to_string();
            reply(state, 0, 0, None, body.as_bytes());
        }
        _ => reply(state, ServerCode::Internal.to_wire(), 0, None, b""),
    }
}
