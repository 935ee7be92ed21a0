/// Change feed for olap-delta.
///
/// The feed is the ordered, resumable record of every mutation to the
/// source collections. Cubes consume it two ways:
///
/// - **Pull**: [`ChangeFeed::read_since`] returns everything at or after a
///   watermark, optionally bounded
/// - **Push**: [`ChangeFeed::subscribe`] replays the backlog from a
///   watermark and then keeps streaming newly appended events until the
///   stream is dropped
///
/// [`MemoryChangeLog`] is the in-process implementation. Its clock hands
/// out `(seconds, counter)` watermarks that never repeat and never go
/// backwards, even when the wall clock does.
///
/// # Example
///
/// ```ignore
/// let log = Arc::new(MemoryChangeLog::new());
/// let mut events = log.subscribe(Watermark::ZERO, vec!["c1".into()]).await?;
///
/// while let Some(event) = events.next().await {
///     println!("{:?}", event?);
/// }
/// ```
use crate::error::{OlapError, OlapResult};
use crate::types::{ChangeRecord, Watermark};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, broadcast};

/// Default number of live events a subscriber may fall behind by.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Change-feed collaborator.
///
/// An empty namespace list means every namespace.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Watermark of the newest event, or [`Watermark::ZERO`] if none.
    async fn head(&self) -> OlapResult<Watermark>;

    /// Events at or after `since`, ascending, at most `limit` of them.
    async fn read_since(
        &self,
        since: Watermark,
        namespaces: &[String],
        limit: Option<usize>,
    ) -> OlapResult<Vec<ChangeRecord>>;

    /// Live subscription starting at `since` (inclusive).
    ///
    /// The stream yields a `FeedSubscription` error and ends if the
    /// subscriber falls too far behind or the feed closes.
    async fn subscribe(
        &self,
        since: Watermark,
        namespaces: Vec<String>,
    ) -> OlapResult<BoxStream<'static, OlapResult<ChangeRecord>>>;

    /// Drop events older than `before`, returning how many went.
    ///
    /// Feeds that manage their own retention keep everything.
    async fn truncate_before(&self, _before: Watermark) -> OlapResult<usize> {
        Ok(0)
    }
}

fn in_namespaces(namespaces: &[String], record: &ChangeRecord) -> bool {
    namespaces.is_empty() || namespaces.iter().any(|ns| *ns == record.namespace)
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<ChangeRecord>,
    last: Watermark,
}

/// In-memory, append-only change log.
#[derive(Debug)]
pub struct MemoryChangeLog {
    state: RwLock<LogState>,
    sender: broadcast::Sender<ChangeRecord>,
}

impl MemoryChangeLog {
    /// Create an empty change log.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty change log whose live subscribers may lag by at
    /// most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(LogState::default()),
            sender,
        }
    }

    /// Rebuild a change log from persisted records.
    pub fn from_records(mut records: Vec<ChangeRecord>) -> Self {
        records.sort_by_key(|r| r.watermark);
        let last = records.last().map(|r| r.watermark).unwrap_or_default();
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(LogState { records, last }),
            sender,
        }
    }

    /// Append an event, stamping it with the next watermark.
    pub async fn append(
        &self,
        namespace: &str,
        op: crate::types::ChangeOp,
        document: Option<JsonValue>,
        target: Option<JsonValue>,
    ) -> Watermark {
        let mut state = self.state.write().await;

        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let watermark = if now > state.last.seconds {
            Watermark::new(now, 1)
        } else {
            Watermark::new(state.last.seconds, state.last.counter.saturating_add(1))
        };
        state.last = watermark;

        let record = ChangeRecord {
            namespace: namespace.to_string(),
            watermark,
            op,
            document,
            target,
        };
        state.records.push(record.clone());
        // No live subscribers is fine.
        let _ = self.sender.send(record);

        tracing::trace!(namespace, %watermark, "change appended");
        watermark
    }

    /// All records, oldest first.
    pub async fn records(&self) -> Vec<ChangeRecord> {
        self.state.read().await.records.clone()
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeLog {
    async fn head(&self) -> OlapResult<Watermark> {
        Ok(self.state.read().await.last)
    }

    async fn read_since(
        &self,
        since: Watermark,
        namespaces: &[String],
        limit: Option<usize>,
    ) -> OlapResult<Vec<ChangeRecord>> {
        let state = self.state.read().await;
        let start = state.records.partition_point(|r| r.watermark < since);
        Ok(state.records[start..]
            .iter()
            .filter(|r| in_namespaces(namespaces, r))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn truncate_before(&self, before: Watermark) -> OlapResult<usize> {
        let mut state = self.state.write().await;
        let cut = state.records.partition_point(|r| r.watermark < before);
        state.records.drain(..cut);
        Ok(cut)
    }

    async fn subscribe(
        &self,
        since: Watermark,
        namespaces: Vec<String>,
    ) -> OlapResult<BoxStream<'static, OlapResult<ChangeRecord>>> {
        // Receiver and backlog are taken under the same lock, so nothing
        // appended in between is lost or seen twice.
        let (receiver, backlog, last) = {
            let state = self.state.read().await;
            let receiver = self.sender.subscribe();
            let start = state.records.partition_point(|r| r.watermark < since);
            let backlog: Vec<ChangeRecord> = state.records[start..]
                .iter()
                .filter(|r| in_namespaces(&namespaces, r))
                .cloned()
                .collect();
            (receiver, backlog, state.last)
        };

        let live = stream::unfold(Some((receiver, namespaces, last)), |state| async move {
            let (mut receiver, namespaces, last) = state?;
            loop {
                match receiver.recv().await {
                    Ok(record) if record.watermark > last && in_namespaces(&namespaces, &record) => {
                        let seen = record.watermark;
                        return Some((Ok(record), Some((receiver, namespaces, seen))));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Some((
                            Err(OlapError::FeedSubscription(format!(
                                "subscriber fell behind by {} events",
                                missed
                            ))),
                            None,
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Some((
                            Err(OlapError::FeedSubscription("change log closed".to_string())),
                            None,
                        ));
                    }
                }
            }
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeOp;
    use serde_json::json;
    use std::time::Duration;

    async fn append_insert(log: &MemoryChangeLog, ns: &str, id: &str) -> Watermark {
        log.append(ns, ChangeOp::Insert, Some(json!({"_id": id})), None)
            .await
    }

    #[tokio::test]
    async fn test_watermarks_strictly_increase() {
        let log = MemoryChangeLog::new();
        let mut previous = Watermark::ZERO;
        for i in 0..50 {
            let wm = append_insert(&log, "c1", &i.to_string()).await;
            assert!(wm > previous);
            previous = wm;
        }
        assert_eq!(log.head().await.unwrap(), previous);
    }

    #[tokio::test]
    async fn test_read_since_is_inclusive_and_filtered() {
        let log = MemoryChangeLog::new();
        append_insert(&log, "c1", "a").await;
        let second = append_insert(&log, "c2", "b").await;
        append_insert(&log, "c1", "c").await;

        let all = log.read_since(second, &[], None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].watermark, second);

        let only_c1 = log.read_since(Watermark::ZERO, &["c1".to_string()], None).await.unwrap();
        assert_eq!(only_c1.len(), 2);

        let limited = log.read_since(Watermark::ZERO, &[], Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams() {
        let log = MemoryChangeLog::new();
        append_insert(&log, "c1", "a").await;
        append_insert(&log, "c2", "skip").await;

        let mut events = log.subscribe(Watermark::ZERO, vec!["c1".into()]).await.unwrap();
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.entity_id().as_deref(), Some("a"));

        append_insert(&log, "c2", "skip").await;
        append_insert(&log, "c1", "b").await;

        let second = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.entity_id().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_error() {
        let log = MemoryChangeLog::with_capacity(2);
        let mut events = log.subscribe(Watermark::ZERO, vec![]).await.unwrap();

        for i in 0..10 {
            append_insert(&log, "c1", &i.to_string()).await;
        }

        let result = events.next().await.unwrap();
        assert!(matches!(result, Err(OlapError::FeedSubscription(_))));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_from_records_keeps_clock() {
        let log = MemoryChangeLog::new();
        append_insert(&log, "c1", "a").await;
        let last = append_insert(&log, "c1", "b").await;

        let restored = MemoryChangeLog::from_records(log.records().await);
        assert_eq!(restored.head().await.unwrap(), last);
        assert!(append_insert(&restored, "c1", "c").await > last);
    }

    #[tokio::test]
    async fn test_truncate_keeps_boundary_and_clock() {
        let log = MemoryChangeLog::new();
        append_insert(&log, "c1", "a").await;
        let boundary = append_insert(&log, "c1", "b").await;
        let last = append_insert(&log, "c2", "c").await;

        assert_eq!(log.truncate_before(boundary).await.unwrap(), 1);
        assert_eq!(log.truncate_before(boundary).await.unwrap(), 0);
        let kept = log.read_since(Watermark::ZERO, &[], None).await.unwrap();
        assert_eq!(kept.first().map(|r| r.watermark), Some(boundary));
        assert_eq!(kept.len(), 2);

        let restored = MemoryChangeLog::from_records(log.records().await);
        assert_eq!(restored.head().await.unwrap(), last);
    }
}
