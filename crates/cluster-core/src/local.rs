//! LocalAdapter trait: the connection framework as seen by the cluster.
//!
//! Implementations:
//! - `MemoryNamespace` - in-process sockets and rooms, for tests and demos
//!
//! The cluster engine calls into this trait whenever a message has to reach
//! the connections of this node, whether the operation started locally or
//! arrived from a peer.

use crate::protocol::{BroadcastOptions, Packet, Room};
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Called once per node with the number of clients a broadcast reached.
pub type ClientCountCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Called once per client acknowledgement.
pub type AckCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Handler for events emitted between servers.
pub type ServerSideHandler = Arc<dyn Fn(Vec<Value>, Option<ServerSideReply>) + Send + Sync>;

/// Handshake key that never leaves the node.
pub const SESSION_STORE_KEY: &str = "sessionStore";

/// A connection as reported by `fetch_sockets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketDetails {
    pub id: String,
    pub handshake: Value,
    pub rooms: BTreeSet<Room>,
    pub data: Value,
}

impl SocketDetails {
    /// Drop the `sessionStore` handshake entry before sending to a peer.
    pub fn without_session_store(mut self) -> Self {
        self.handshake.remove(SESSION_STORE_KEY);
        self
    }
}

/// Reply handle for a server-side event that expects an answer.
///
/// Only the first call to [`reply`](Self::reply) is forwarded, whichever
/// clone makes it.
#[derive(Clone)]
pub struct ServerSideReply {
    called: Arc<AtomicBool>,
    send: Arc<dyn Fn(Value) + Send + Sync>,
}

impl ServerSideReply {
    pub fn new(send: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self {
            called: Arc::new(AtomicBool::new(false)),
            send: Arc::new(send),
        }
    }

    /// Send the answer. Returns `false` if an answer was already sent.
    pub fn reply(&self, value: Value) -> bool {
        if self.called.swap(true, Ordering::SeqCst) {
            return false;
        }
        (self.send)(value);
        true
    }
}

impl std::fmt::Debug for ServerSideReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSideReply")
            .field("called", &self.called.load(Ordering::SeqCst))
            .finish()
    }
}

/// Local side of a channel.
#[async_trait]
pub trait LocalAdapter: Send + Sync {
    /// Channel (namespace) name.
    fn name(&self) -> &str;

    /// Deliver a packet to the matching local connections.
    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions);

    /// Deliver a packet expecting acknowledgements. `on_client_count` is
    /// called once with the number of reached connections, then `on_ack` once
    /// per acknowledgement.
    fn broadcast_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
    );

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool);

    async fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails>;

    /// Run server-side event handlers. `reply` is set when the emitter waits
    /// for an answer.
    fn on_server_side_emit(&self, args: Vec<Value>, reply: Option<ServerSideReply>);
}

// ============================================================================
// In-memory namespace
// ============================================================================

struct MemorySocket {
    rooms: BTreeSet<Room>,
    handshake: Value,
    data: Value,
    inbox: Vec<Packet>,
    ack_reply: Option<Value>,
}

impl MemorySocket {
    fn details(&self, id: &str) -> SocketDetails {
        SocketDetails {
            id: id.to_string(),
            handshake: self.handshake.clone(),
            rooms: self.rooms.clone(),
            data: self.data.clone(),
        }
    }
}

#[derive(Default)]
struct NamespaceState {
    sockets: BTreeMap<String, MemorySocket>,
    handlers: Vec<ServerSideHandler>,
    disconnected: Vec<(String, bool)>,
}

/// In-process connections of one channel.
///
/// Sockets are identified by a uuid and always belong to the room named after
/// their id. Received packets accumulate in a per-socket inbox.
pub struct MemoryNamespace {
    name: String,
    state: RwLock<NamespaceState>,
}

impl MemoryNamespace {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: RwLock::new(NamespaceState::default()),
        })
    }

    /// Connect a socket with an empty handshake. Returns its id.
    pub fn connect(&self) -> String {
        self.connect_with(Value::Object(BTreeMap::new()), Value::Null)
    }

    pub fn connect_with(&self, handshake: Value, data: Value) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let socket = MemorySocket {
            rooms: BTreeSet::from([id.clone()]),
            handshake,
            data,
            inbox: Vec::new(),
            ack_reply: None,
        };
        self.write().sockets.insert(id.clone(), socket);
        id
    }

    pub fn join(&self, id: &str, room: impl Into<Room>) {
        if let Some(socket) = self.write().sockets.get_mut(id) {
            socket.rooms.insert(room.into());
        }
    }

    pub fn leave(&self, id: &str, room: &str) {
        if let Some(socket) = self.write().sockets.get_mut(id) {
            socket.rooms.remove(room);
        }
    }

    /// Make the socket acknowledge every packet that asks for it.
    pub fn set_ack_reply(&self, id: &str, reply: Value) {
        if let Some(socket) = self.write().sockets.get_mut(id) {
            socket.ack_reply = Some(reply);
        }
    }

    pub fn add_server_side_handler(
        &self,
        handler: impl Fn(Vec<Value>, Option<ServerSideReply>) + Send + Sync + 'static,
    ) {
        self.write().handlers.push(Arc::new(handler));
    }

    pub fn inbox(&self, id: &str) -> Vec<Packet> {
        self.read()
            .sockets
            .get(id)
            .map(|s| s.inbox.clone())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, id: &str) -> BTreeSet<Room> {
        self.read()
            .sockets
            .get(id)
            .map(|s| s.rooms.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.read().sockets.contains_key(id)
    }

    pub fn socket_ids(&self) -> Vec<String> {
        self.read().sockets.keys().cloned().collect()
    }

    /// Sockets removed by `disconnect_sockets`, with the close flag used.
    pub fn disconnected(&self) -> Vec<(String, bool)> {
        self.read().disconnected.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NamespaceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NamespaceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LocalAdapter for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) {
        let mut state = self.write();
        for socket in state.sockets.values_mut() {
            if opts.selects(&socket.rooms) {
                socket.inbox.push(packet.clone());
            }
        }
    }

    fn broadcast_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
    ) {
        let mut acks = Vec::new();
        let mut reached = 0u64;
        {
            let mut state = self.write();
            for socket in state.sockets.values_mut() {
                if opts.selects(&socket.rooms) {
                    reached += 1;
                    socket.inbox.push(packet.clone());
                    if let Some(reply) = &socket.ack_reply {
                        acks.push(reply.clone());
                    }
                }
            }
        }

        on_client_count(reached);
        for ack in acks {
            on_ack(ack);
        }
    }

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        let mut state = self.write();
        for socket in state.sockets.values_mut() {
            if opts.selects(&socket.rooms) {
                socket.rooms.extend(rooms.iter().cloned());
            }
        }
    }

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        let mut state = self.write();
        for socket in state.sockets.values_mut() {
            if opts.selects(&socket.rooms) {
                for room in rooms {
                    socket.rooms.remove(room);
                }
            }
        }
    }

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool) {
        let mut state = self.write();
        let ids: Vec<String> = state
            .sockets
            .iter()
            .filter(|(_, socket)| opts.selects(&socket.rooms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            state.sockets.remove(&id);
            state.disconnected.push((id, close));
        }
    }

    async fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails> {
        self.read()
            .sockets
            .iter()
            .filter(|(_, socket)| opts.selects(&socket.rooms))
            .map(|(id, socket)| socket.details(id))
            .collect()
    }

    fn on_server_side_emit(&self, args: Vec<Value>, reply: Option<ServerSideReply>) {
        let handlers: Vec<ServerSideHandler> = self.read().handlers.iter().cloned().collect();
        for handler in handlers {
            handler(args.clone(), reply.clone());
        }
    }
}
