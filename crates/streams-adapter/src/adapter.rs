//! Log-backed cluster adapter.
//!
//! One [`StreamsAdapter`] per process talks to the substrate. Every channel
//! (namespace) attached to it gets a [`NamespaceAdapter`] wrapping a
//! [`ClusterEngine`]. Durable messages come back through one tailing loop per
//! partition, ephemeral ones through a pub/sub listener per channel.
//!
//! Tailing starts with the first attached channel and stops when the last one
//! is closed.

use crate::backend::{StreamBackend, StreamEntry, TopicReceiver};
use crate::config::StreamsConfig;
use crate::error::{AdapterError, RecoveryError, Result};
use crate::partition;
use crate::publisher::{StreamPublisher, private_topic, public_topic};
use crate::session::SessionStore;
use cluster_core::{
    AckCallback, BroadcastOptions, ClientCountCallback, ClusterConfig, ClusterEngine, Codec,
    LocalAdapter, LogCursor, NodeId, Packet, PersistedSession, RawMessage, RequestError,
    RestoredSession, Room, SocketDetails, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed tail read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

type Registry = Mutex<HashMap<String, ClusterEngine>>;

struct Polling {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct AdapterShared {
    backend: Arc<dyn StreamBackend>,
    /// Connection dedicated to subscriptions.
    sub: Arc<dyn StreamBackend>,
    config: Arc<StreamsConfig>,
    cluster: ClusterConfig,
    codec: Codec,
    engines: Arc<Registry>,
    polling: tokio::sync::Mutex<Option<Polling>>,
    closed: AtomicBool,
}

/// Entry point: connects channels to the substrate. Cheap to clone.
#[derive(Clone)]
pub struct StreamsAdapter {
    inner: Arc<AdapterShared>,
}

impl StreamsAdapter {
    pub async fn new(
        backend: Arc<dyn StreamBackend>,
        config: StreamsConfig,
        cluster: ClusterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let sub = backend.duplicate().await?;
        let codec = Codec::new(config.only_plaintext);

        Ok(Self {
            inner: Arc::new(AdapterShared {
                backend,
                sub,
                config: Arc::new(config),
                cluster,
                codec,
                engines: Arc::new(Mutex::new(HashMap::new())),
                polling: tokio::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Channels currently attached.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Connect a channel to the cluster.
    ///
    /// Subscribes to the channel's topics, makes sure the log is being tailed,
    /// then announces this node with an initial heartbeat.
    pub async fn attach(&self, local: Arc<dyn LocalAdapter>) -> Result<NamespaceAdapter> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }
        let inner = &self.inner;
        let nsp = local.name().to_string();

        let publisher = Arc::new(StreamPublisher::new(
            Arc::clone(&inner.backend),
            Arc::clone(&inner.config),
        ));
        let engine = ClusterEngine::new(local, publisher, inner.cluster.clone());

        let prefix = &inner.config.channel_prefix;
        let topics = vec![
            public_topic(prefix, &nsp),
            private_topic(prefix, &nsp, engine.uid()),
        ];
        let rx = match inner.sub.subscribe(inner.config.pubsub_mode(), &topics).await {
            Ok(rx) => rx,
            Err(e) => {
                engine.close();
                return Err(e.into());
            }
        };
        let listener = tokio::spawn(Self::listen(engine.clone(), inner.codec, rx));

        let previous = inner
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nsp.clone(), engine.clone());
        if let Some(previous) = previous {
            warn!("Namespace {} attached twice, replacing node {}", nsp, previous.uid());
            previous.close();
        }

        if let Err(e) = self.start_polling().await {
            engine.close();
            listener.abort();
            self.detach(&nsp, engine.uid()).await;
            return Err(e);
        }

        if let Err(e) = engine.init_heartbeat().await {
            warn!("Failed to announce node {} on {}: {}", engine.uid(), nsp, e);
        }
        info!("Attached namespace {} as node {}", nsp, engine.uid());

        let recovery = inner.cluster.recovery.clone().unwrap_or_default();
        let sessions = SessionStore::new(
            Arc::clone(&inner.backend),
            Arc::clone(&inner.config),
            recovery.max_disconnection_duration(),
        );

        Ok(NamespaceAdapter {
            engine,
            adapter: self.clone(),
            sessions,
            topics,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Stop tailing, close every attached channel and disconnect the
    /// dedicated connections. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let engines: Vec<ClusterEngine> = self
            .inner
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, engine)| engine)
            .collect();
        for engine in &engines {
            engine.close();
        }

        self.stop_polling().await;
        self.inner.sub.disconnect().await;
        info!("Closed streams adapter ({} namespaces)", engines.len());
    }

    async fn start_polling(&self) -> Result<()> {
        let mut polling = self.inner.polling.lock().await;
        if polling.is_some() {
            return Ok(());
        }

        let (stop, _) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for stream in partition::stream_names(&self.inner.config) {
            let started = async {
                let conn = self.inner.backend.duplicate().await?;
                let cursor = conn.latest_cursor(&stream).await?.unwrap_or(LogCursor::ZERO);
                Ok::<_, AdapterError>((conn, cursor))
            }
            .await;

            let (conn, cursor) = match started {
                Ok(started) => started,
                Err(e) => {
                    let _ = stop.send(true);
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };

            debug!("tailing {} from {}", stream, cursor);
            tasks.push(tokio::spawn(Self::poll_stream(
                conn,
                stream,
                cursor,
                Arc::clone(&self.inner.config),
                self.inner.codec,
                Arc::clone(&self.inner.engines),
                stop.subscribe(),
            )));
        }

        *polling = Some(Polling { stop, tasks });
        Ok(())
    }

    async fn stop_polling(&self) {
        let Some(polling) = self.inner.polling.lock().await.take() else {
            return;
        };
        Self::join_polling(polling).await;
    }

    async fn join_polling(polling: Polling) {
        let _ = polling.stop.send(true);
        for result in futures::future::join_all(polling.tasks).await {
            if let Err(e) = result {
                warn!("Stream tailing task failed: {}", e);
            }
        }
    }

    /// Detach `nsp` if it is still served by `uid`; stop tailing when no
    /// channel is left.
    async fn detach(&self, nsp: &str, uid: NodeId) {
        {
            let mut engines = self.inner.engines.lock().unwrap_or_else(|e| e.into_inner());
            if engines.get(nsp).is_some_and(|engine| engine.uid() == uid) {
                engines.remove(nsp);
            }
        }
        self.stop_polling_if_idle().await;
    }

    /// Stop tailing unless a channel is attached. Checked under the polling
    /// lock so a concurrent `attach` keeps the loops it relies on.
    async fn stop_polling_if_idle(&self) -> bool {
        let mut polling = self.inner.polling.lock().await;
        let idle = self
            .inner
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        if !idle {
            return false;
        }
        let Some(stopped) = polling.take() else {
            return false;
        };
        drop(polling);

        debug!("last namespace detached, stopping stream tailing");
        Self::join_polling(stopped).await;
        true
    }

    /// Tail one partition until stopped. Read errors are logged and retried
    /// from the same cursor.
    async fn poll_stream(
        conn: Arc<dyn StreamBackend>,
        stream: String,
        mut cursor: LogCursor,
        config: Arc<StreamsConfig>,
        codec: Codec,
        engines: Arc<Registry>,
        mut stop: watch::Receiver<bool>,
    ) {
        let block = config.block_time();

        while !*stop.borrow() {
            let read = tokio::select! {
                _ = stop.changed() => break,
                read = conn.read_tail(&stream, cursor, config.read_count, block) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        cursor = entry.cursor;
                        Self::dispatch_entry(&engines, &codec, entry).await;
                    }
                }
                Err(e) => {
                    error!("Failed to read stream {}: {}", stream, e);
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }
        }

        conn.disconnect().await;
        debug!("stopped tailing {} at {}", stream, cursor);
    }

    async fn dispatch_entry(engines: &Registry, codec: &Codec, entry: StreamEntry) {
        let raw = match RawMessage::from_fields(&entry.fields) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("ignore malformed entry {}: {}", entry.cursor, e);
                return;
            }
        };

        let engine = engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&raw.nsp)
            .cloned();
        let Some(engine) = engine else {
            return;
        };

        match codec.decode(&raw) {
            Ok(message) => engine.handle_message(message, Some(entry.cursor)).await,
            Err(e) => debug!("ignore invalid entry {}: {}", entry.cursor, e),
        }
    }

    /// Feed pub/sub messages of one channel into its engine, in arrival order.
    async fn listen(engine: ClusterEngine, codec: Codec, mut rx: TopicReceiver) {
        while let Some((topic, payload)) = rx.recv().await {
            match codec.decode_binary(&payload) {
                Ok(message) => engine.handle_message(message, None).await,
                Err(e) => debug!("ignore invalid message on {}: {}", topic, e),
            }
        }
        debug!("pub/sub listener for {} ended", engine.nsp());
    }
}

/// One channel connected to the cluster.
pub struct NamespaceAdapter {
    engine: ClusterEngine,
    adapter: StreamsAdapter,
    sessions: SessionStore,
    topics: Vec<String>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NamespaceAdapter {
    pub fn engine(&self) -> &ClusterEngine {
        &self.engine
    }

    pub fn uid(&self) -> NodeId {
        self.engine.uid()
    }

    pub fn nsp(&self) -> &str {
        self.engine.nsp()
    }

    pub async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<()> {
        Ok(self.engine.broadcast(packet, opts).await?)
    }

    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
    ) -> Result<()> {
        Ok(self
            .engine
            .broadcast_with_ack(packet, opts, on_client_count, on_ack)
            .await?)
    }

    pub async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        Ok(self.engine.add_sockets(opts, rooms).await?)
    }

    pub async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        Ok(self.engine.del_sockets(opts, rooms).await?)
    }

    pub async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) -> Result<()> {
        Ok(self.engine.disconnect_sockets(opts, close).await?)
    }

    pub async fn fetch_sockets(
        &self,
        opts: BroadcastOptions,
    ) -> std::result::Result<Vec<SocketDetails>, RequestError<SocketDetails>> {
        self.engine.fetch_sockets(opts).await
    }

    pub async fn server_side_emit(&self, args: Vec<Value>) -> Result<()> {
        Ok(self.engine.server_side_emit(args).await?)
    }

    pub async fn server_side_emit_with_ack(
        &self,
        args: Vec<Value>,
    ) -> std::result::Result<Vec<Value>, RequestError<Value>> {
        self.engine.server_side_emit_with_ack(args).await
    }

    /// Nodes serving this channel, counted as subscribers of its topic.
    ///
    /// Falls back to the heartbeat view when the substrate cannot answer.
    pub async fn server_count(&self) -> usize {
        let inner = &self.adapter.inner;
        let topic = public_topic(&inner.config.channel_prefix, self.nsp());
        match inner
            .backend
            .subscriber_count(inner.config.pubsub_mode(), &topic)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count subscribers of {}: {}", topic, e);
                self.engine.server_count()
            }
        }
    }

    pub async fn persist_session(&self, session: &PersistedSession) -> Result<()> {
        self.sessions.persist_session(session).await
    }

    pub async fn restore_session(
        &self,
        pid: &str,
        offset: &str,
    ) -> std::result::Result<RestoredSession, RecoveryError> {
        self.sessions
            .restore_session(self.nsp(), pid, offset)
            .await
    }

    /// Leave the cluster for this channel. In-flight requests fail with
    /// `Closed`.
    pub async fn close(&self) {
        self.engine.close();

        let inner = &self.adapter.inner;
        if !self.adapter.is_closed()
            && let Err(e) = inner
                .sub
                .unsubscribe(inner.config.pubsub_mode(), &self.topics)
                .await
        {
            warn!("Failed to unsubscribe {}: {}", self.nsp(), e);
        }

        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }

        self.adapter.detach(self.nsp(), self.uid()).await;
        info!("Detached namespace {} (node {})", self.nsp(), self.uid());
    }
}

impl Drop for NamespaceAdapter {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use cluster_core::MemoryNamespace;

    fn fast_config() -> StreamsConfig {
        StreamsConfig {
            block_time_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let backend = InMemoryBackend::new();
        let config = StreamsConfig {
            stream_count: 0,
            ..Default::default()
        };
        let result = StreamsAdapter::new(backend, config, ClusterConfig::default()).await;
        assert!(matches!(result, Err(AdapterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_attach_announces_node() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend.clone(), fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        let nsp = adapter.attach(MemoryNamespace::new("/")).await.unwrap();

        let entries = backend.entries("socket.io");
        assert_eq!(entries.len(), 1);
        let raw = RawMessage::from_fields(&entries[0].fields).unwrap();
        assert_eq!(raw.kind, "1");
        assert_eq!(raw.uid, nsp.uid().to_string());
        assert_eq!(adapter.namespaces(), vec!["/"]);

        adapter.close().await;
    }

    #[tokio::test]
    async fn test_last_detach_stops_tailing() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend.clone(), fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        let root = adapter.attach(MemoryNamespace::new("/")).await.unwrap();
        let custom = adapter.attach(MemoryNamespace::new("/custom")).await.unwrap();
        assert!(adapter.inner.polling.lock().await.is_some());

        root.close().await;
        assert!(adapter.inner.polling.lock().await.is_some());
        custom.close().await;
        assert!(adapter.inner.polling.lock().await.is_none());
        assert!(adapter.namespaces().is_empty());

        // Re-attaching restarts tailing.
        let again = adapter.attach(MemoryNamespace::new("/")).await.unwrap();
        assert!(adapter.inner.polling.lock().await.is_some());
        again.close().await;
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_tailing_kept_while_a_namespace_is_attached() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend, fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        let root = adapter.attach(MemoryNamespace::new("/")).await.unwrap();

        assert!(!adapter.stop_polling_if_idle().await);
        assert!(adapter.inner.polling.lock().await.is_some());

        root.close().await;
        assert!(!adapter.stop_polling_if_idle().await);
        assert!(adapter.inner.polling.lock().await.is_none());
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_attach_racing_last_detach_keeps_tailing() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend, fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        let root = adapter.attach(MemoryNamespace::new("/")).await.unwrap();

        let guard = adapter.inner.polling.lock().await;
        let closing = tokio::spawn(async move { root.close().await });
        while !adapter.namespaces().is_empty() {
            tokio::task::yield_now().await;
        }
        let attaching = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.attach(MemoryNamespace::new("/custom")).await })
        };
        while adapter.namespaces().is_empty() {
            tokio::task::yield_now().await;
        }
        drop(guard);

        closing.await.unwrap();
        let custom = attaching.await.unwrap().unwrap();
        assert_eq!(adapter.namespaces(), vec!["/custom"]);
        assert!(adapter.inner.polling.lock().await.is_some());

        custom.close().await;
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_attach_after_close_fails() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend, fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        adapter.close().await;
        let result = adapter.attach(MemoryNamespace::new("/")).await;
        assert!(matches!(result, Err(AdapterError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_namespace_rejects_operations() {
        let backend = InMemoryBackend::new();
        let adapter = StreamsAdapter::new(backend, fast_config(), ClusterConfig::default())
            .await
            .unwrap();
        let nsp = adapter.attach(MemoryNamespace::new("/")).await.unwrap();
        nsp.close().await;

        let result = nsp
            .add_sockets(BroadcastOptions::new(), vec!["room".into()])
            .await;
        assert!(matches!(result, Err(AdapterError::Transport(_))));
        adapter.close().await;
    }
}
