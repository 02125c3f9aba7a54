//! Incremental feed poller.
//!
//! Each cycle fetches the feed's newest-first window, keeps eligible items,
//! and delivers everything newer than the stored cursor, oldest first. The
//! cursor then moves to the newest item delivery was attempted for, even if
//! some sends failed: a lost post beats a re-delivery storm. A cycle that
//! fails before delivery starts (fetch, parse, sink lookup) leaves the cursor
//! alone so the next tick retries it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult, RemoteResult};
use crate::remote::{bounded, MessageSink, DEFAULT_REMOTE_TIMEOUT};
use crate::store::{read_record, write_record, KvStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn feed_id(&self) -> &str;
    /// Current window, newest first.
    async fn fetch_window(&self) -> RemoteResult<Vec<FeedItem>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub feed_id: String,
    pub last_seen_item_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn cursor_key(feed_id: &str) -> String {
    format!("feed_cursor.{feed_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    /// Delivers without touching the cursor.
    Preview,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub sink_id: String,
    /// Item kinds worth posting. Empty means every kind.
    pub eligible_kinds: Vec<String>,
    pub interval: Duration,
    /// Upper bound on items delivered by one cycle.
    pub max_backlog: usize,
    /// `{title}`, `{url}` and `{kind}` are substituted.
    pub template: String,
    pub remote_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            sink_id: String::new(),
            eligible_kinds: vec!["video".to_string()],
            interval: Duration::from_secs(30 * 60),
            max_backlog: 10,
            template: "📺 **{title}**\n{url}".to_string(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

impl FeedConfig {
    pub fn is_eligible(&self, item: &FeedItem) -> bool {
        self.eligible_kinds.is_empty()
            || self
                .eligible_kinds
                .iter()
                .any(|kind| kind.eq_ignore_ascii_case(&item.kind))
    }

    pub fn render(&self, item: &FeedItem) -> String {
        self.template
            .replace("{title}", &item.title)
            .replace("{url}", &item.url)
            .replace("{kind}", &item.kind)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub mode: RunMode,
    pub feed_id: String,
    pub fetched: usize,
    pub eligible: usize,
    /// Ids delivered successfully, in delivery order.
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
    /// First live run: cursor set to the newest item, nothing posted.
    pub baseline_only: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct DeliveryPlan<'a> {
    /// Oldest first.
    deliver: Vec<&'a FeedItem>,
    next_cursor: Option<String>,
    baseline_only: bool,
}

/// `eligible` is newest first.
fn plan_delivery<'a>(
    eligible: &[&'a FeedItem],
    cursor: Option<&str>,
    mode: RunMode,
    max_backlog: usize,
) -> DeliveryPlan<'a> {
    let Some(newest) = eligible.first() else {
        return DeliveryPlan {
            deliver: Vec::new(),
            next_cursor: cursor.map(String::from),
            baseline_only: false,
        };
    };

    let Some(cursor) = cursor else {
        return match mode {
            RunMode::Live => DeliveryPlan {
                deliver: Vec::new(),
                next_cursor: Some(newest.id.clone()),
                baseline_only: true,
            },
            RunMode::Preview => DeliveryPlan {
                deliver: vec![*newest],
                next_cursor: None,
                baseline_only: false,
            },
        };
    };

    let cap = max_backlog.max(1);
    let mut delta: Vec<&FeedItem> = eligible
        .iter()
        .take_while(|item| item.id != cursor)
        .copied()
        .collect();
    let cursor_in_window = delta.len() < eligible.len();
    delta.reverse();
    if cursor_in_window {
        // Oldest first; whatever is left over waits for the next cycle.
        delta.truncate(cap);
    } else if delta.len() > cap {
        delta.drain(..delta.len() - cap);
    }

    match mode {
        RunMode::Live => {
            let next_cursor = delta
                .last()
                .map(|item| item.id.clone())
                .or_else(|| Some(cursor.to_string()));
            DeliveryPlan {
                deliver: delta,
                next_cursor,
                baseline_only: false,
            }
        }
        RunMode::Preview => DeliveryPlan {
            deliver: if delta.is_empty() {
                vec![*newest]
            } else {
                delta
            },
            next_cursor: Some(cursor.to_string()),
            baseline_only: false,
        },
    }
}

pub struct FeedPoller {
    config: FeedConfig,
    source: Arc<dyn FeedSource>,
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn KvStore>,
    live_gate: Mutex<()>,
}

impl FeedPoller {
    pub fn new(
        config: FeedConfig,
        source: Arc<dyn FeedSource>,
        sink: Arc<dyn MessageSink>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            store,
            live_gate: Mutex::new(()),
        }
    }

    pub fn feed_id(&self) -> &str {
        self.source.feed_id()
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub async fn cursor(&self) -> CoreResult<Option<CursorRecord>> {
        let key = cursor_key(self.feed_id());
        let record: Option<CursorRecord> = read_record(self.store.as_ref(), &key).await?;
        Ok(record.filter(|r| r.feed_id == self.feed_id()))
    }

    /// Live cycles queue behind one another; Preview never waits.
    pub async fn run_cycle(&self, mode: RunMode) -> CoreResult<CycleReport> {
        match mode {
            RunMode::Live => {
                let _gate = self.live_gate.lock().await;
                self.cycle(mode).await
            }
            RunMode::Preview => self.cycle(mode).await,
        }
    }

    /// `None` when a live cycle is already in flight.
    pub async fn try_run_live(&self) -> Option<CoreResult<CycleReport>> {
        let _gate = self.live_gate.try_lock().ok()?;
        Some(self.cycle(RunMode::Live).await)
    }

    async fn cycle(&self, mode: RunMode) -> CoreResult<CycleReport> {
        let feed_id = self.feed_id().to_string();
        let timeout = self.config.remote_timeout;

        let sink_ok = bounded(timeout, self.sink.sink_exists(&self.config.sink_id))
            .await
            .map_err(|err| CoreError::remote("resolve_sink", err))?;
        if !sink_ok {
            return Err(CoreError::RemoteFatal {
                op: "resolve_sink",
                detail: format!("sink {} not found", self.config.sink_id),
            });
        }

        let window = bounded(timeout, self.source.fetch_window())
            .await
            .map_err(|err| CoreError::remote("fetch_feed", err))?;
        let eligible: Vec<&FeedItem> = window
            .iter()
            .filter(|item| self.config.is_eligible(item))
            .collect();

        let cursor_before = self.cursor().await?.map(|r| r.last_seen_item_id);
        let plan = plan_delivery(
            &eligible,
            cursor_before.as_deref(),
            mode,
            self.config.max_backlog,
        );

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for item in &plan.deliver {
            let content = self.config.render(item);
            match bounded(timeout, self.sink.send_item(&self.config.sink_id, &content)).await {
                Ok(()) => {
                    debug!(feed_id = %feed_id, item_id = %item.id, "feed item delivered");
                    delivered.push(item.id.clone());
                }
                Err(err) => {
                    warn!(
                        feed_id = %feed_id,
                        item_id = %item.id,
                        sink_id = %self.config.sink_id,
                        "feed item delivery failed: {err}"
                    );
                    failed.push(item.id.clone());
                }
            }
        }

        let cursor_after = match mode {
            RunMode::Preview => cursor_before.clone(),
            RunMode::Live => {
                if plan.next_cursor != cursor_before {
                    if let Some(next) = &plan.next_cursor {
                        let record = CursorRecord {
                            feed_id: feed_id.clone(),
                            last_seen_item_id: next.clone(),
                            updated_at: Some(Utc::now()),
                        };
                        write_record(self.store.as_ref(), &cursor_key(&feed_id), &record).await?;
                    }
                }
                plan.next_cursor.clone()
            }
        };

        Ok(CycleReport {
            mode,
            feed_id,
            fetched: window.len(),
            eligible: eligible.len(),
            delivered,
            failed,
            cursor_before,
            cursor_after,
            baseline_only: plan.baseline_only,
        })
    }
}

/// Runs a live cycle every `interval` until `cancel` fires. The first cycle
/// runs immediately. A tick that lands while a cycle is still running is
/// skipped, not queued.
pub fn spawn_feed_loop(poller: Arc<FeedPoller>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poller.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(feed_id = poller.feed_id(), "feed loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match poller.try_run_live().await {
                        None => debug!(feed_id = poller.feed_id(), "previous cycle still running, tick skipped"),
                        Some(Ok(report)) => info!(
                            feed_id = %report.feed_id,
                            delivered = report.delivered.len(),
                            failed = report.failed.len(),
                            cursor = report.cursor_after.as_deref().unwrap_or(""),
                            baseline_only = report.baseline_only,
                            "feed cycle finished"
                        ),
                        Some(Err(err)) => warn!(
                            feed_id = poller.feed_id(),
                            code = err.code(),
                            "feed cycle failed, cursor unchanged: {err}"
                        ),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::store::memory::MemoryStore;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::Ordering;

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            kind: "video".to_string(),
            title: format!("title {id}"),
            url: format!("https://feed.example/{id}"),
            published_at: None,
        }
    }

    fn short(id: &str) -> FeedItem {
        FeedItem {
            kind: "short".to_string(),
            ..item(id)
        }
    }

    #[derive(Default)]
    struct FakeFeed {
        window: SyncMutex<Vec<FeedItem>>,
        error: SyncMutex<Option<RemoteError>>,
    }

    impl FakeFeed {
        fn set(&self, ids: &[&str]) {
            *self.window.lock() = ids.iter().map(|id| item(id)).collect();
        }
    }

    #[async_trait]
    impl FeedSource for FakeFeed {
        fn feed_id(&self) -> &str {
            "channel-feed"
        }

        async fn fetch_window(&self) -> RemoteResult<Vec<FeedItem>> {
            if let Some(err) = self.error.lock().clone() {
                return Err(err);
            }
            Ok(self.window.lock().clone())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        sent: SyncMutex<Vec<String>>,
        fail_containing: Option<String>,
        missing: bool,
    }

    impl FakeSink {
        fn sent_urls(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|c| c.lines().last().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        async fn sink_exists(&self, _sink_id: &str) -> RemoteResult<bool> {
            Ok(!self.missing)
        }

        async fn send_item(&self, _sink_id: &str, content: &str) -> RemoteResult<()> {
            if let Some(needle) = &self.fail_containing {
                if content.contains(needle.as_str()) {
                    return Err(RemoteError::Transient("503".into()));
                }
            }
            self.sent.lock().push(content.to_string());
            Ok(())
        }
    }

    fn poller(feed: Arc<FakeFeed>, sink: Arc<FakeSink>, store: Arc<MemoryStore>) -> FeedPoller {
        FeedPoller::new(
            FeedConfig {
                sink_id: "news".to_string(),
                ..FeedConfig::default()
            },
            feed,
            sink,
            store,
        )
    }

    async fn seed_cursor(store: &MemoryStore, id: &str) {
        let record = CursorRecord {
            feed_id: "channel-feed".into(),
            last_seen_item_id: id.into(),
            updated_at: None,
        };
        write_record(store, &cursor_key("channel-feed"), &record)
            .await
            .unwrap();
    }

    fn url(id: &str) -> String {
        format!("https://feed.example/{id}")
    }

    #[tokio::test]
    async fn delivers_delta_oldest_first_and_advances() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i10", "i9", "i8", "i7"]);
        seed_cursor(&store, "i8").await;
        let poller = poller(feed, sink.clone(), store);

        let report = poller.run_cycle(RunMode::Live).await.unwrap();

        assert_eq!(report.delivered, vec!["i9", "i10"]);
        assert_eq!(sink.sent_urls(), vec![url("i9"), url("i10")]);
        assert_eq!(report.cursor_after.as_deref(), Some("i10"));
        let cursor = poller.cursor().await.unwrap().unwrap();
        assert_eq!(cursor.last_seen_item_id, "i10");
    }

    #[tokio::test]
    async fn first_live_run_sets_baseline_without_backlog() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i5", "i4", "i3"]);
        let poller = poller(feed.clone(), sink.clone(), store);

        let first = poller.run_cycle(RunMode::Live).await.unwrap();
        assert!(first.baseline_only);
        assert!(first.delivered.is_empty());
        assert!(sink.sent.lock().is_empty());
        assert_eq!(first.cursor_after.as_deref(), Some("i5"));

        feed.set(&["i6", "i5", "i4"]);
        let second = poller.run_cycle(RunMode::Live).await.unwrap();
        assert_eq!(second.delivered, vec!["i6"]);
        assert_eq!(second.cursor_after.as_deref(), Some("i6"));
    }

    #[tokio::test]
    async fn preview_without_cursor_sends_newest_and_keeps_cursor_unset() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i5", "i4", "i3"]);
        let poller = poller(feed, sink.clone(), store.clone());

        let report = poller.run_cycle(RunMode::Preview).await.unwrap();

        assert_eq!(report.delivered, vec!["i5"]);
        assert!(poller.cursor().await.unwrap().is_none());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preview_with_cursor_never_moves_it() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i7", "i6", "i5"]);
        seed_cursor(&store, "i5").await;
        let poller = poller(feed, sink.clone(), store);

        let report = poller.run_cycle(RunMode::Preview).await.unwrap();
        assert_eq!(report.delivered, vec!["i6", "i7"]);
        assert_eq!(
            poller.cursor().await.unwrap().unwrap().last_seen_item_id,
            "i5"
        );

        // the live stream still sees both items afterwards
        let live = poller.run_cycle(RunMode::Live).await.unwrap();
        assert_eq!(live.delivered, vec!["i6", "i7"]);
    }

    #[tokio::test]
    async fn repeated_live_cycle_delivers_nothing_new() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i3", "i2", "i1"]);
        seed_cursor(&store, "i1").await;
        let poller = poller(feed, sink.clone(), store);

        let first = poller.run_cycle(RunMode::Live).await.unwrap();
        let second = poller.run_cycle(RunMode::Live).await.unwrap();

        assert_eq!(first.delivered.len(), 2);
        assert!(second.delivered.is_empty());
        assert_eq!(sink.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_item_send_still_advances_cursor() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink {
            fail_containing: Some(url("i9")),
            ..FakeSink::default()
        });
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i10", "i9", "i8"]);
        seed_cursor(&store, "i8").await;
        let poller = poller(feed, sink.clone(), store);

        let report = poller.run_cycle(RunMode::Live).await.unwrap();

        assert_eq!(report.failed, vec!["i9"]);
        assert_eq!(report.delivered, vec!["i10"]);
        assert_eq!(report.cursor_after.as_deref(), Some("i10"));
    }

    #[tokio::test]
    async fn fetch_failure_leaves_cursor_untouched() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i10", "i9"]);
        seed_cursor(&store, "i9").await;
        *feed.error.lock() = Some(RemoteError::Fatal("malformed feed payload".into()));
        let poller = poller(feed.clone(), sink.clone(), store.clone());

        let err = poller.run_cycle(RunMode::Live).await.unwrap_err();

        assert!(matches!(err, CoreError::RemoteFatal { op: "fetch_feed", .. }));
        assert_eq!(
            poller.cursor().await.unwrap().unwrap().last_seen_item_id,
            "i9"
        );
        assert!(sink.sent.lock().is_empty());

        *feed.error.lock() = None;
        let retry = poller.run_cycle(RunMode::Live).await.unwrap();
        assert_eq!(retry.delivered, vec!["i10"]);
    }

    #[tokio::test]
    async fn missing_sink_aborts_before_fetch() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink {
            missing: true,
            ..FakeSink::default()
        });
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i2", "i1"]);
        let poller = poller(feed, sink, store.clone());

        let err = poller.run_cycle(RunMode::Live).await.unwrap_err();

        assert!(matches!(err, CoreError::RemoteFatal { op: "resolve_sink", .. }));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ineligible_items_are_skipped_and_never_become_baseline() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        *feed.window.lock() = vec![short("s3"), item("i2"), short("s1")];
        let poller = poller(feed.clone(), sink.clone(), store);

        let baseline = poller.run_cycle(RunMode::Live).await.unwrap();
        assert_eq!(baseline.cursor_after.as_deref(), Some("i2"));

        *feed.window.lock() = vec![item("i4"), short("s4"), short("s3"), item("i2")];
        let next = poller.run_cycle(RunMode::Live).await.unwrap();
        assert_eq!(next.delivered, vec!["i4"]);
        assert_eq!(next.eligible, 2);
    }

    #[tokio::test]
    async fn empty_window_keeps_cursor_and_writes_nothing() {
        let feed = Arc::new(FakeFeed::default());
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::default());
        let poller = poller(feed, sink, store.clone());

        let report = poller.run_cycle(RunMode::Live).await.unwrap();

        assert!(report.cursor_after.is_none());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_cursor_delivers_capped_window() {
        let items: Vec<FeedItem> = (1..=20).rev().map(|n| item(&format!("i{n}"))).collect();
        let refs: Vec<&FeedItem> = items.iter().collect();

        let plan = plan_delivery(&refs, Some("gone"), RunMode::Live, 10);

        assert_eq!(plan.deliver.len(), 10);
        assert_eq!(plan.deliver.first().unwrap().id, "i11");
        assert_eq!(plan.next_cursor.as_deref(), Some("i20"));
    }

    #[test]
    fn known_cursor_with_long_delta_delivers_oldest_first_and_resumes() {
        let items: Vec<FeedItem> = (1..=15).rev().map(|n| item(&format!("i{n}"))).collect();
        let refs: Vec<&FeedItem> = items.iter().collect();

        let plan = plan_delivery(&refs, Some("i1"), RunMode::Live, 10);

        let ids: Vec<&str> = plan.deliver.iter().map(|i| i.id.as_str()).collect();
        let expected: Vec<String> = (2..=11).map(|n| format!("i{n}")).collect();
        assert_eq!(ids, expected);
        assert_eq!(plan.next_cursor.as_deref(), Some("i11"));

        let plan = plan_delivery(&refs, Some("i11"), RunMode::Live, 10);
        let ids: Vec<&str> = plan.deliver.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i12", "i13", "i14", "i15"]);
        assert_eq!(plan.next_cursor.as_deref(), Some("i15"));
    }

    #[tokio::test]
    async fn try_run_live_skips_while_cycle_in_flight() {
        let poller = poller(
            Arc::new(FakeFeed::default()),
            Arc::new(FakeSink::default()),
            Arc::new(MemoryStore::default()),
        );
        let _held = poller.live_gate.lock().await;

        assert!(poller.try_run_live().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn feed_loop_runs_immediately_and_stops_on_cancel() {
        let feed = Arc::new(FakeFeed::default());
        let store = Arc::new(MemoryStore::default());
        feed.set(&["i1"]);
        let poller = Arc::new(poller(feed, Arc::new(FakeSink::default()), store));
        let cancel = CancellationToken::new();

        let handle = spawn_feed_loop(poller.clone(), cancel.clone());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            poller.cursor().await.unwrap().unwrap().last_seen_item_id,
            "i1"
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn render_substitutes_placeholders() {
        let config = FeedConfig {
            template: "[{kind}] {title} -> {url}".into(),
            ..FeedConfig::default()
        };
        assert_eq!(
            config.render(&item("i1")),
            "[video] title i1 -> https://feed.example/i1"
        );
    }
}
