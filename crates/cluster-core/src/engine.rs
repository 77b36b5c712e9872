//! Cluster protocol engine.
//!
//! One engine serves one channel on one node. Outbound operations decide
//! whether an action stays local, is fanned out, or is fanned out and
//! aggregated. Inbound messages (from whatever transport) go through
//! [`ClusterEngine::handle_message`], which updates membership, resolves
//! pending requests or forwards to the [`LocalAdapter`].
//!
//! Every outbound publish re-arms a heartbeat timer; after
//! `heartbeat_interval` of silence the engine publishes a `Heartbeat` so peers
//! keep counting this node as alive.

use crate::config::{ClusterConfig, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::correlator::{AckRegistry, PendingRequest, RequestCorrelator, RequestError, RequestId};
use crate::cursor::LogCursor;
use crate::events::{ClusterEvent, EventBus};
use crate::local::{AckCallback, ClientCountCallback, LocalAdapter, ServerSideReply, SocketDetails};
use crate::membership::MembershipTracker;
use crate::node_id::{NodeId, format_origin};
use crate::protocol::message::{
    AckPayload, BroadcastPayload, ClientCountPayload, DisconnectPayload, FetchSocketsPayload,
    FetchSocketsResponsePayload, RoomsPayload, ServerSideEmitPayload,
};
use crate::protocol::{BroadcastOptions, ClusterMessage, MessageBody, MessageKind, Packet, Room};
use crate::transport::{self, ClusterPublisher, TransportError};
use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A reply produced by a synchronous callback, published in order by a
/// background task.
struct Reply {
    requester: Option<NodeId>,
    body: MessageBody,
}

#[derive(Default)]
struct HeartbeatSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    uid: NodeId,
    nsp: String,
    config: ClusterConfig,
    local: Arc<dyn LocalAdapter>,
    publisher: Arc<dyn ClusterPublisher>,
    membership: MembershipTracker,
    fetches: RequestCorrelator<SocketDetails>,
    emits: RequestCorrelator<Value>,
    acks: Arc<AckRegistry>,
    heartbeat: Mutex<HeartbeatSlot>,
    replies: mpsc::UnboundedSender<Reply>,
    reply_task: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventBus>,
    closed: AtomicBool,
}

/// Cluster protocol engine for one channel. Cheap to clone.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct ClusterEngine {
    inner: Arc<Shared>,
}

impl ClusterEngine {
    pub fn new(
        local: Arc<dyn LocalAdapter>,
        publisher: Arc<dyn ClusterPublisher>,
        config: ClusterConfig,
    ) -> Self {
        Self::with_uid(NodeId::generate(), local, publisher, config)
    }

    pub fn with_uid(
        uid: NodeId,
        local: Arc<dyn LocalAdapter>,
        publisher: Arc<dyn ClusterPublisher>,
        config: ClusterConfig,
    ) -> Self {
        let (replies, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Shared {
            uid,
            nsp: local.name().to_string(),
            membership: MembershipTracker::new(uid, config.heartbeat_timeout()),
            config,
            local,
            publisher,
            fetches: RequestCorrelator::new(),
            emits: RequestCorrelator::new(),
            acks: AckRegistry::new(),
            heartbeat: Mutex::new(HeartbeatSlot::default()),
            replies,
            reply_task: Mutex::new(None),
            events: Arc::new(EventBus::new()),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(forward_replies(Arc::downgrade(&inner), rx));
        *inner.reply_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Self { inner }
    }

    pub fn uid(&self) -> NodeId {
        self.inner.uid
    }

    pub fn nsp(&self) -> &str {
        &self.inner.nsp
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn local(&self) -> &Arc<dyn LocalAdapter> {
        &self.inner.local
    }

    pub fn recovery_enabled(&self) -> bool {
        self.inner.config.recovery.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Announce this node. Peers answer with a heartbeat, which fills the
    /// membership view without waiting a full heartbeat interval.
    pub async fn init_heartbeat(&self) -> transport::Result<()> {
        self.publish(MessageBody::InitialHeartbeat).await.map(|_| ())
    }

    // ========================================================================
    // Outbound operations
    // ========================================================================

    /// Broadcast a packet to every node, then deliver it locally.
    ///
    /// With recovery enabled, the log cursor of the published entry is
    /// appended to recoverable packets before local delivery. A publish
    /// failure is returned after the local delivery still happened.
    pub async fn broadcast(&self, mut packet: Packet, opts: BroadcastOptions) -> transport::Result<()> {
        let mut result = Ok(());

        if !opts.flags.local {
            let body = MessageBody::Broadcast(BroadcastPayload {
                packet: packet.clone(),
                request_id: None,
                opts: opts.clone(),
            });
            match self.publish(body).await {
                Ok(Some(cursor)) => self.add_cursor_if_necessary(&mut packet, &opts, cursor),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to broadcast message: {}", e);
                    result = Err(e);
                }
            }
        }

        self.inner.local.broadcast(&packet, &opts);
        result
    }

    /// Broadcast a packet that expects client acknowledgements.
    ///
    /// Each node (this one included) reports its client count once, then each
    /// acknowledgement. Replies arriving after `flags.timeout` (default 5s)
    /// are dropped.
    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
    ) -> transport::Result<()> {
        let mut result = Ok(());

        if !opts.flags.local {
            let request_id = RequestId::generate();
            let ttl = Duration::from_millis(opts.flags.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS));
            self.inner.acks.register(
                request_id.clone(),
                Arc::clone(&on_client_count),
                Arc::clone(&on_ack),
                ttl,
            );

            let body = MessageBody::Broadcast(BroadcastPayload {
                packet: packet.clone(),
                request_id: Some(request_id.clone()),
                opts: opts.clone(),
            });
            if let Err(e) = self.publish(body).await {
                self.inner.acks.remove(&request_id);
                result = Err(e);
            }
        }

        self.inner
            .local
            .broadcast_with_ack(&packet, &opts, on_client_count, on_ack);
        result
    }

    /// Make the matching connections join `rooms`, on every node.
    pub async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> transport::Result<()> {
        self.inner.local.add_sockets(&opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.publish(MessageBody::SocketsJoin(RoomsPayload { opts, rooms }))
            .await
            .map(|_| ())
    }

    /// Make the matching connections leave `rooms`, on every node.
    pub async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> transport::Result<()> {
        self.inner.local.del_sockets(&opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.publish(MessageBody::SocketsLeave(RoomsPayload { opts, rooms }))
            .await
            .map(|_| ())
    }

    /// Disconnect the matching connections, on every node.
    pub async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) -> transport::Result<()> {
        self.inner.local.disconnect_sockets(&opts, close);
        if opts.flags.local {
            return Ok(());
        }
        self.publish(MessageBody::DisconnectSockets(DisconnectPayload { opts, close }))
            .await
            .map(|_| ())
    }

    /// Matching connections across the cluster, local ones first.
    pub async fn fetch_sockets(
        &self,
        opts: BroadcastOptions,
    ) -> Result<Vec<SocketDetails>, RequestError<SocketDetails>> {
        let local_sockets = self.inner.local.fetch_sockets(&opts).await;
        let expected = self.live_peer_count();

        if opts.flags.local || expected == 0 {
            return Ok(local_sockets);
        }

        let request_id = RequestId::generate();
        let timeout = Duration::from_millis(opts.flags.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS));
        let pending = self.inner.fetches.register(
            request_id.clone(),
            MessageKind::FetchSockets,
            expected,
            local_sockets,
        );

        self.publish(MessageBody::FetchSockets(FetchSocketsPayload { opts, request_id }))
            .await?;

        self.wait_for(MessageKind::FetchSockets, pending, timeout).await
    }

    /// Emit an event to the server-side handlers of every other node.
    pub async fn server_side_emit(&self, args: Vec<Value>) -> transport::Result<()> {
        self.publish(MessageBody::ServerSideEmit(ServerSideEmitPayload {
            request_id: None,
            packet: args,
        }))
        .await
        .map(|_| ())
    }

    /// Emit an event to every other node and collect one answer per node.
    pub async fn server_side_emit_with_ack(
        &self,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, RequestError<Value>> {
        let expected = self.live_peer_count();
        debug!(
            "waiting for {} responses to server-side emit request",
            expected
        );

        if expected == 0 {
            return Ok(Vec::new());
        }

        let request_id = RequestId::generate();
        let pending = self.inner.emits.register(
            request_id.clone(),
            MessageKind::ServerSideEmit,
            expected,
            Vec::new(),
        );

        self.publish(MessageBody::ServerSideEmit(ServerSideEmitPayload {
            request_id: Some(request_id),
            packet: args,
        }))
        .await?;

        self.wait_for(
            MessageKind::ServerSideEmit,
            pending,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        )
        .await
    }

    /// This node plus every peer heard from (membership view).
    pub fn server_count(&self) -> usize {
        1 + self.inner.membership.len()
    }

    /// Stop heartbeats and reject in-flight requests. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing cluster engine for {}", self.inner.nsp);

        {
            let mut slot = self.inner.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
            slot.generation += 1;
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        if let Some(task) = self
            .inner
            .reply_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        self.inner.fetches.close_all();
        self.inner.emits.close_all();
        self.inner.acks.close_all();
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Process a message from another node. `cursor` is the log position for
    /// messages delivered through the log.
    ///
    /// Never fails: problems are logged and the message is dropped.
    pub async fn handle_message(&self, message: ClusterMessage, cursor: Option<LogCursor>) {
        if self.is_closed() {
            return;
        }
        if message.uid == Some(self.inner.uid) {
            debug!("ignore message from self");
            return;
        }
        if message.nsp != self.inner.nsp {
            debug!(
                "ignore message for channel {} on {}",
                message.nsp, self.inner.nsp
            );
            return;
        }

        if let Some(origin) = message.uid
            && self.inner.membership.touch(origin)
        {
            self.inner.events.emit(ClusterEvent::NodeDiscovered {
                node_id: origin.to_string(),
            });
        }

        let kind = message.kind();
        let requester = message.uid;
        debug!("new event of type {} from {}", kind, format_origin(requester));
        self.inner.events.emit(ClusterEvent::MessageReceived {
            message_type: kind.to_string(),
            nsp: message.nsp.clone(),
            origin: format_origin(requester),
        });

        let local = &self.inner.local;
        match message.body {
            MessageBody::InitialHeartbeat => {
                if let Err(e) = self.publish(MessageBody::Heartbeat).await {
                    warn!("Failed to answer initial heartbeat: {}", e);
                }
            }

            MessageBody::Heartbeat => {}

            MessageBody::Broadcast(payload) => match payload.request_id {
                Some(request_id) => {
                    let (on_client_count, on_ack) = self.ack_forwarders(requester, request_id);
                    local.broadcast_with_ack(&payload.packet, &payload.opts, on_client_count, on_ack);
                }
                None => {
                    let mut packet = payload.packet;
                    if let Some(cursor) = cursor {
                        self.add_cursor_if_necessary(&mut packet, &payload.opts, cursor);
                    }
                    local.broadcast(&packet, &payload.opts);
                }
            },

            MessageBody::BroadcastClientCount(payload) => {
                self.inner
                    .acks
                    .client_count(&payload.request_id, payload.client_count);
            }

            MessageBody::BroadcastAck(payload) => {
                self.inner.acks.ack(&payload.request_id, payload.packet);
            }

            MessageBody::SocketsJoin(payload) => local.add_sockets(&payload.opts, &payload.rooms),

            MessageBody::SocketsLeave(payload) => local.del_sockets(&payload.opts, &payload.rooms),

            MessageBody::DisconnectSockets(payload) => {
                local.disconnect_sockets(&payload.opts, payload.close)
            }

            MessageBody::FetchSockets(payload) => {
                let sockets = local
                    .fetch_sockets(&payload.opts)
                    .await
                    .into_iter()
                    .map(SocketDetails::without_session_store)
                    .collect();
                let body = MessageBody::FetchSocketsResponse(FetchSocketsResponsePayload {
                    request_id: payload.request_id,
                    sockets,
                });
                let _ = self.publish_response(requester, body).await;
            }

            MessageBody::FetchSocketsResponse(payload) => {
                if !self.inner.fetches.record(&payload.request_id, payload.sockets) {
                    debug!("ignore response to unknown request {}", payload.request_id);
                }
            }

            MessageBody::ServerSideEmit(payload) => match payload.request_id {
                None => local.on_server_side_emit(payload.packet, None),
                Some(request_id) => {
                    let replies = self.inner.replies.clone();
                    let reply = ServerSideReply::new(move |value| {
                        debug!("calling acknowledgement with {:?}", value);
                        let _ = replies.send(Reply {
                            requester,
                            body: MessageBody::ServerSideEmitResponse(AckPayload {
                                request_id: request_id.clone(),
                                packet: value,
                            }),
                        });
                    });
                    local.on_server_side_emit(payload.packet, Some(reply));
                }
            },

            MessageBody::ServerSideEmitResponse(payload) => {
                if !self.inner.emits.record(&payload.request_id, [payload.packet]) {
                    debug!("ignore response to unknown request {}", payload.request_id);
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn add_cursor_if_necessary(&self, packet: &mut Packet, opts: &BroadcastOptions, cursor: LogCursor) {
        if self.recovery_enabled() && packet.is_recoverable(opts) {
            packet.push_cursor(cursor);
        }
    }

    /// Callbacks that send client counts and acknowledgements back to the
    /// node that broadcast with ack, preserving their order.
    fn ack_forwarders(
        &self,
        requester: Option<NodeId>,
        request_id: RequestId,
    ) -> (ClientCountCallback, AckCallback) {
        let replies = self.inner.replies.clone();
        let count_id = request_id.clone();
        let on_client_count: ClientCountCallback = Arc::new(move |client_count| {
            debug!("waiting for {} client acknowledgements", client_count);
            let _ = replies.send(Reply {
                requester,
                body: MessageBody::BroadcastClientCount(ClientCountPayload {
                    request_id: count_id.clone(),
                    client_count,
                }),
            });
        });

        let replies = self.inner.replies.clone();
        let on_ack: AckCallback = Arc::new(move |value| {
            debug!("received acknowledgement with value {:?}", value);
            let _ = replies.send(Reply {
                requester,
                body: MessageBody::BroadcastAck(AckPayload {
                    request_id: request_id.clone(),
                    packet: value,
                }),
            });
        });

        (on_client_count, on_ack)
    }

    /// Prune silent peers and count the remaining ones.
    fn live_peer_count(&self) -> usize {
        for node in self.inner.membership.prune() {
            self.inner.events.emit(ClusterEvent::NodeDown {
                node_id: node.to_string(),
            });
        }
        self.inner.membership.len()
    }

    async fn wait_for<T: Send + 'static>(
        &self,
        kind: MessageKind,
        pending: PendingRequest<'_, T>,
        timeout: Duration,
    ) -> Result<Vec<T>, RequestError<T>> {
        let result = pending.wait(timeout).await;
        if let Err(RequestError::Timeout {
            received, expected, ..
        }) = &result
        {
            warn!(
                "{} request timed out on {}: only {} responses received out of {}",
                kind, self.inner.nsp, received, expected
            );
            self.inner.events.emit(ClusterEvent::RequestTimedOut {
                message_type: kind.to_string(),
                received: *received,
                expected: *expected,
            });
        }
        result
    }

    fn message(&self, body: MessageBody) -> ClusterMessage {
        ClusterMessage::new(Some(self.inner.uid), self.inner.nsp.clone(), body)
    }

    async fn publish(&self, body: MessageBody) -> transport::Result<Option<LogCursor>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.schedule_heartbeat();

        let message = self.message(body);
        let cursor = self.inner.publisher.publish(&message).await?;
        self.inner.events.emit(ClusterEvent::MessagePublished {
            message_type: message.kind().to_string(),
            nsp: message.nsp,
        });
        Ok(cursor)
    }

    async fn publish_response(&self, requester: Option<NodeId>, body: MessageBody) -> transport::Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.schedule_heartbeat();

        let message = self.message(body);
        let result = match requester {
            Some(requester) => self.inner.publisher.publish_response(requester, &message).await,
            None => self.inner.publisher.publish(&message).await.map(|_| ()),
        };
        match &result {
            Ok(()) => self.inner.events.emit(ClusterEvent::MessagePublished {
                message_type: message.kind().to_string(),
                nsp: message.nsp.clone(),
            }),
            Err(e) => warn!("Failed to publish {} response: {}", message.kind(), e),
        }
        result
    }

    /// Replace the pending heartbeat with one due a full interval from now.
    fn schedule_heartbeat(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval();

        let mut slot = self.inner.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return;
        }
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut slot = inner.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
                if slot.generation != generation {
                    return;
                }
                // Detach our own handle so re-arming below does not abort us.
                slot.handle = None;
            }
            let engine = ClusterEngine { inner };
            if let Err(e) = engine.publish(MessageBody::Heartbeat).await {
                debug!("Failed to send heartbeat: {}", e);
            }
        }));
    }
}

async fn forward_replies(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Reply>) {
    while let Some(reply) = rx.recv().await {
        let Some(inner) = shared.upgrade() else {
            break;
        };
        let engine = ClusterEngine { inner };
        let _ = engine.publish_response(reply.requester, reply.body).await;
    }
}
