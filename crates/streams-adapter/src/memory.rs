//! In-process implementation of [`StreamBackend`].
//!
//! All connections created with [`StreamBackend::duplicate`] share one store,
//! so several adapters in one process behave like nodes of a cluster talking
//! to the same substrate. Blocking reads wake up on append through a
//! `Notify`. Keys expire on the Tokio clock, so paused-time tests can move
//! past a TTL.

use crate::backend::{
    BackendError, PubSubMode, Result, StreamBackend, StreamEntry, TopicReceiver,
};
use async_trait::async_trait;
use cluster_core::LogCursor;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

type TopicSender = mpsc::UnboundedSender<(String, Vec<u8>)>;

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<StreamEntry>,
    last: Option<LogCursor>,
}

impl StreamLog {
    fn next_cursor(&self) -> LogCursor {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        match self.last {
            Some(last) if last.millis >= now => last.next(),
            _ => LogCursor::new(now, 0),
        }
    }

    fn range(&self, start: LogCursor, end: Option<LogCursor>, count: Option<usize>) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|e| e.cursor >= start && end.is_none_or(|end| e.cursor <= end))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct Faults {
    reads: usize,
    appends: usize,
}

#[derive(Default)]
struct Store {
    streams: Mutex<HashMap<String, StreamLog>>,
    keys: Mutex<HashMap<String, (String, Instant)>>,
    topics: Mutex<HashMap<(PubSubMode, String), Vec<(u64, TopicSender)>>>,
    faults: Mutex<Faults>,
    changed: Notify,
    next_connection: AtomicU64,
}

/// One connection to an in-process substrate.
pub struct InMemoryBackend {
    store: Arc<Store>,
    id: u64,
    connected: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::connect(Arc::new(Store::default()))
    }

    fn connect(store: Arc<Store>) -> Arc<Self> {
        let id = store.next_connection.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            store,
            id,
            connected: AtomicBool::new(true),
        })
    }

    /// Make the next `n` tail/range reads fail, on any connection.
    pub fn fail_next_reads(&self, n: usize) {
        self.store.faults.lock().unwrap_or_else(|e| e.into_inner()).reads += n;
    }

    /// Make the next `n` appends fail, on any connection.
    pub fn fail_next_appends(&self, n: usize) {
        self.store.faults.lock().unwrap_or_else(|e| e.into_inner()).appends += n;
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .map_or(0, |log| log.entries.len())
    }

    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the streams that received at least one entry.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drop the oldest entries until at most `keep` remain.
    pub fn trim(&self, stream: &str, keep: usize) {
        if let Some(log) = self
            .store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(stream)
        {
            while log.entries.len() > keep {
                log.entries.pop_front();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BackendError::Disconnected)
        }
    }

    fn take_read_fault(&self) -> Result<()> {
        let mut faults = self.store.faults.lock().unwrap_or_else(|e| e.into_inner());
        if faults.reads > 0 {
            faults.reads -= 1;
            return Err(BackendError::Command("injected read failure".into()));
        }
        Ok(())
    }

    fn take_append_fault(&self) -> Result<()> {
        let mut faults = self.store.faults.lock().unwrap_or_else(|e| e.into_inner());
        if faults.appends > 0 {
            faults.appends -= 1;
            return Err(BackendError::Command("injected append failure".into()));
        }
        Ok(())
    }

    fn range(
        &self,
        stream: &str,
        start: LogCursor,
        end: Option<LogCursor>,
        count: Option<usize>,
    ) -> Vec<StreamEntry> {
        self.store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .map(|log| log.range(start, end, count))
            .unwrap_or_default()
    }

    fn remove_subscriptions(&self, mode: Option<PubSubMode>, topics: Option<&[String]>) {
        let mut subscriptions = self.store.topics.lock().unwrap_or_else(|e| e.into_inner());
        for ((topic_mode, topic), senders) in subscriptions.iter_mut() {
            let mode_matches = mode.is_none_or(|m| m == *topic_mode);
            let topic_matches = topics.is_none_or(|t| t.contains(topic));
            if mode_matches && topic_matches {
                senders.retain(|(id, _)| *id != self.id);
            }
        }
        subscriptions.retain(|_, senders| !senders.is_empty());
    }
}

#[async_trait]
impl StreamBackend for InMemoryBackend {
    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
        max_len: usize,
    ) -> Result<LogCursor> {
        self.check_connected()?;
        self.take_append_fault()?;

        let cursor = {
            let mut streams = self.store.streams.lock().unwrap_or_else(|e| e.into_inner());
            let log = streams.entry(stream.to_string()).or_default();
            let cursor = log.next_cursor();
            log.entries.push_back(StreamEntry { cursor, fields });
            log.last = Some(cursor);

            // Approximate trimming: only trim once the stream overshoots by
            // a tenth, then cut back to `max_len`.
            let slack = max_len / 10;
            if log.entries.len() > max_len + slack {
                let excess = log.entries.len() - max_len;
                log.entries.drain(..excess);
            }
            cursor
        };

        self.store.changed.notify_waiters();
        Ok(cursor)
    }

    async fn latest_cursor(&self, stream: &str) -> Result<Option<LogCursor>> {
        self.check_connected()?;
        Ok(self
            .store
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .and_then(|log| log.last))
    }

    async fn read_tail(
        &self,
        stream: &str,
        after: LogCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.check_connected()?;
        self.take_read_fault()?;
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking, so an append in between
            // still wakes us up.
            let notified = self.store.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_connected()?;
            let entries = self.range(stream, after.next(), None, Some(count));
            if !entries.is_empty() {
                return Ok(entries);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn read_range(
        &self,
        stream: &str,
        start: LogCursor,
        end: Option<LogCursor>,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        self.check_connected()?;
        self.take_read_fault()?;
        Ok(self.range(stream, start, end, count))
    }

    async fn publish(&self, mode: PubSubMode, topic: &str, payload: Vec<u8>) -> Result<usize> {
        self.check_connected()?;
        let mut subscriptions = self.store.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = subscriptions.get_mut(&(mode, topic.to_string())) else {
            return Ok(0);
        };
        senders.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (_, tx) in senders.iter() {
            if tx.send((topic.to_string(), payload.clone())).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, mode: PubSubMode, topics: &[String]) -> Result<TopicReceiver> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = self.store.topics.lock().unwrap_or_else(|e| e.into_inner());
        for topic in topics {
            debug!("connection {} subscribing to {}", self.id, topic);
            subscriptions
                .entry((mode, topic.clone()))
                .or_default()
                .push((self.id, tx.clone()));
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, mode: PubSubMode, topics: &[String]) -> Result<()> {
        self.check_connected()?;
        self.remove_subscriptions(Some(mode), Some(topics));
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check_connected()?;
        self.store
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>> {
        self.check_connected()?;
        let entry = self
            .store
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(entry
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value))
    }

    async fn subscriber_count(&self, mode: PubSubMode, topic: &str) -> Result<usize> {
        self.check_connected()?;
        let subscriptions = self.store.topics.lock().unwrap_or_else(|e| e.into_inner());
        let connections: HashSet<u64> = subscriptions
            .get(&(mode, topic.to_string()))
            .map(|senders| {
                senders
                    .iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        Ok(connections.len())
    }

    async fn duplicate(&self) -> Result<Arc<dyn StreamBackend>> {
        self.check_connected()?;
        Ok(Self::connect(Arc::clone(&self.store)))
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("connection {} disconnected", self.id);
            self.remove_subscriptions(None, None);
            self.store.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: usize) -> Vec<(String, String)> {
        vec![("n".to_string(), n.to_string())]
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_cursors() {
        let backend = InMemoryBackend::new();
        let mut previous = LogCursor::ZERO;
        for n in 0..50 {
            let cursor = backend.append("s", fields(n), 1000).await.unwrap();
            assert!(cursor > previous);
            previous = cursor;
        }
        assert_eq!(backend.latest_cursor("s").await.unwrap(), Some(previous));
        assert_eq!(backend.latest_cursor("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_approximate_trimming() {
        let backend = InMemoryBackend::new();
        for n in 0..10 {
            backend.append("s", fields(n), 20).await.unwrap();
        }
        // Below max_len + slack nothing is trimmed.
        for n in 10..22 {
            backend.append("s", fields(n), 20).await.unwrap();
        }
        assert_eq!(backend.stream_len("s"), 22);

        backend.append("s", fields(22), 20).await.unwrap();
        assert_eq!(backend.stream_len("s"), 20);
        assert_eq!(backend.entries("s")[0].fields, fields(3));
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_bounded() {
        let backend = InMemoryBackend::new();
        let mut cursors = Vec::new();
        for n in 0..5 {
            cursors.push(backend.append("s", fields(n), 100).await.unwrap());
        }

        let point = backend
            .read_range("s", cursors[2], Some(cursors[2]), None)
            .await
            .unwrap();
        assert_eq!(point.len(), 1);
        assert_eq!(point[0].cursor, cursors[2]);

        let tail = backend
            .read_range("s", cursors[1].next(), None, Some(2))
            .await
            .unwrap();
        assert_eq!(
            tail.iter().map(|e| e.cursor).collect::<Vec<_>>(),
            vec![cursors[2], cursors[3]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_tail_blocks_until_append() {
        let backend = InMemoryBackend::new();
        let reader = backend.duplicate().await.unwrap();

        let task = tokio::spawn(async move {
            reader
                .read_tail("s", LogCursor::ZERO, 10, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.append("s", fields(1), 100).await.unwrap();

        let entries = task.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_tail_times_out_empty() {
        let backend = InMemoryBackend::new();
        let entries = backend
            .read_tail("s", LogCursor::ZERO, 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_blocking_read() {
        let backend = InMemoryBackend::new();
        let reader = backend.duplicate().await.unwrap();
        let reader_clone = Arc::clone(&reader);

        let task = tokio::spawn(async move {
            reader_clone
                .read_tail("s", LogCursor::ZERO, 10, Duration::from_secs(60))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.disconnect().await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BackendError::Disconnected)));
    }

    #[tokio::test]
    async fn test_pubsub_modes_are_separate() {
        let backend = InMemoryBackend::new();
        let sub = backend.duplicate().await.unwrap();
        let mut rx = sub
            .subscribe(PubSubMode::Classic, &["t".to_string()])
            .await
            .unwrap();

        assert_eq!(backend.publish(PubSubMode::Sharded, "t", vec![1]).await.unwrap(), 0);
        assert_eq!(backend.publish(PubSubMode::Classic, "t", vec![2]).await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(("t".to_string(), vec![2])));

        assert_eq!(backend.subscriber_count(PubSubMode::Classic, "t").await.unwrap(), 1);
        assert_eq!(backend.subscriber_count(PubSubMode::Sharded, "t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_count_counts_connections() {
        let backend = InMemoryBackend::new();
        let sub = backend.duplicate().await.unwrap();
        let _rx1 = sub.subscribe(PubSubMode::Classic, &["t".to_string()]).await.unwrap();
        let _rx2 = sub.subscribe(PubSubMode::Classic, &["t".to_string()]).await.unwrap();
        let other = backend.duplicate().await.unwrap();
        let _rx3 = other.subscribe(PubSubMode::Classic, &["t".to_string()]).await.unwrap();

        assert_eq!(backend.subscriber_count(PubSubMode::Classic, "t").await.unwrap(), 2);

        sub.unsubscribe(PubSubMode::Classic, &["t".to_string()]).await.unwrap();
        assert_eq!(backend.subscriber_count(PubSubMode::Classic, "t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_receiver() {
        let backend = InMemoryBackend::new();
        let topics = vec!["a".to_string(), "b".to_string()];
        let mut rx = backend.subscribe(PubSubMode::Classic, &topics).await.unwrap();
        backend.unsubscribe(PubSubMode::Classic, &topics).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire_and_get_and_delete() {
        let backend = InMemoryBackend::new();
        backend
            .set_with_expiry("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(backend.get_and_delete("k").await.unwrap(), Some("v".into()));
        assert_eq!(backend.get_and_delete("k").await.unwrap(), None);

        backend
            .set_with_expiry("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get_and_delete("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = InMemoryBackend::new();
        backend.fail_next_appends(1);
        assert!(backend.append("s", fields(0), 10).await.is_err());
        assert!(backend.append("s", fields(0), 10).await.is_ok());

        backend.fail_next_reads(1);
        assert!(backend.read_range("s", LogCursor::ZERO, None, None).await.is_err());
        assert_eq!(
            backend.read_range("s", LogCursor::ZERO, None, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnected_connection_rejects_commands() {
        let backend = InMemoryBackend::new();
        let other = backend.duplicate().await.unwrap();
        other.disconnect().await;
        assert!(matches!(
            other.append("s", fields(0), 10).await,
            Err(BackendError::Disconnected)
        ));
        assert!(backend.append("s", fields(0), 10).await.is_ok());
    }
}
