//! crates/session_reliability_core/src/queue.rs
//!
//! The durable offline operation queue.
//!
//! Operations that cannot complete right now, because the device is offline or
//! the provider keeps failing transiently, are appended here and replayed later
//! in insertion order. The whole list is written to local storage after every
//! mutation, so a restart never loses queued work. Items leave the queue on
//! success, after `max_retry_count` failed passes, or once older than `item_expiry`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::domain::{QueueItem, QueuedOperation};
use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::ports::{LocalStorage, NotificationLevel, Notifier, PortError};
use crate::retry::RetryPolicy;

/// Local storage key holding the JSON array of queue items.
pub const QUEUE_STORAGE_KEY: &str = "offline_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retry_count: u32,
    pub item_expiry: chrono::Duration,
    pub sweep_interval: Duration,
    pub process_interval: Duration,
    /// Policy for each replay attempt within one processing pass.
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retry_count: 5,
            item_expiry: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(60 * 60),
            process_interval: Duration::from_secs(30),
            retry_policy: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
        }
    }
}

/// Executes replayed operations. Implemented by the component that owns the
/// session, quota and provider services, so the queue never owns them.
#[async_trait]
pub trait QueueDispatcher: Send + Sync {
    async fn dispatch(&self, operation: &QueuedOperation) -> SessionResult<()>;
}

/// What one processing pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub succeeded: usize,
    pub retained: usize,
    pub dropped: usize,
}

/// Parses the stored queue. Items that do not match the schema are skipped.
fn parse_stored(raw: &str) -> Vec<QueueItem> {
    let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, "stored offline queue is unreadable, starting empty");
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<QueueItem>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "dropping malformed offline queue item");
                None
            }
        })
        .collect()
}

/// Resets the processing flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    storage: Arc<dyn LocalStorage>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    config: QueueConfig,
    items: Mutex<Vec<QueueItem>>,
    processing: AtomicBool,
}

impl OfflineQueue {
    /// Restores the queue from local storage.
    pub async fn load(
        storage: Arc<dyn LocalStorage>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: QueueConfig,
    ) -> SessionResult<Self> {
        let mut items = match storage.read(QUEUE_STORAGE_KEY).await? {
            Some(raw) => parse_stored(&raw),
            None => Vec::new(),
        };
        if items.len() > config.max_size {
            let excess = items.len() - config.max_size;
            items.drain(..excess);
        }
        info!(pending = items.len(), "offline queue loaded");

        Ok(Self {
            storage,
            connectivity,
            clock,
            notifier,
            config,
            items: Mutex::new(items),
            processing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn items(&self) -> Vec<QueueItem> {
        self.items.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    async fn persist(&self, items: &[QueueItem]) -> SessionResult<()> {
        let json = serde_json::to_string(items)
            .map_err(|e| PortError::Unexpected(format!("could not serialize offline queue: {e}")))?;
        self.storage.write(QUEUE_STORAGE_KEY, &json).await?;
        Ok(())
    }

    fn is_expired(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        now - item.timestamp > self.config.item_expiry
    }

    /// Appends an operation, evicting the oldest item when the queue is full.
    pub async fn enqueue(&self, operation: QueuedOperation) -> SessionResult<Uuid> {
        let item = QueueItem {
            id: Uuid::new_v4(),
            operation,
            timestamp: self.clock.now(),
            retry_count: 0,
            last_error: None,
        };
        let id = item.id;

        let mut items = self.items.lock().await;
        while items.len() >= self.config.max_size.max(1) {
            let evicted = items.remove(0);
            warn!(queue_id = %evicted.id, operation = evicted.operation.name(), "offline queue full, evicting oldest item");
        }
        info!(queue_id = %id, operation = item.operation.name(), "operation queued");
        items.push(item);
        self.persist(&items).await?;
        Ok(id)
    }

    /// Removes items older than `item_expiry`, whether or not we are online.
    pub async fn sweep_expired(&self) -> SessionResult<usize> {
        let now = self.clock.now();
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|item| !self.is_expired(item, now));
        let removed = before - items.len();
        if removed > 0 {
            info!(removed, "purged expired offline queue items");
            self.persist(&items).await?;
        }
        Ok(removed)
    }

    async fn remove(&self, id: Uuid) -> SessionResult<()> {
        let mut items = self.items.lock().await;
        items.retain(|item| item.id != id);
        self.persist(&items).await
    }

    async fn record_failure(&self, id: Uuid, retry_count: u32, err: &SessionError) -> SessionResult<()> {
        let mut items = self.items.lock().await;
        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
            item.retry_count = retry_count;
            item.last_error = Some(err.to_string());
        }
        self.persist(&items).await
    }

    /// Replays every queued item once, oldest first. Does nothing while offline,
    /// when the queue is empty, or while another pass is running.
    pub async fn process_queue(&self, dispatcher: &dyn QueueDispatcher) -> SessionResult<ProcessReport> {
        let mut report = ProcessReport::default();
        if !self.connectivity.is_online() {
            debug!("offline, skipping queue processing");
            return Ok(report);
        }
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!("queue processing already in progress");
            return Ok(report);
        }
        let _guard = PassGuard(&self.processing);

        let snapshot = self.items.lock().await.clone();
        if snapshot.is_empty() {
            return Ok(report);
        }
        info!(pending = snapshot.len(), "processing offline queue");

        for item in snapshot {
            if !self.connectivity.is_online() {
                info!("connectivity lost, pausing queue processing");
                break;
            }

            let name = item.operation.name();
            if self.is_expired(&item, self.clock.now()) {
                warn!(queue_id = %item.id, operation = name, "queued operation expired before replay");
                self.remove(item.id).await?;
                report.dropped += 1;
                continue;
            }

            let outcome = self
                .config
                .retry_policy
                .execute(|| dispatcher.dispatch(&item.operation))
                .await;

            match outcome {
                Ok(()) => {
                    info!(queue_id = %item.id, operation = name, "queued operation replayed");
                    self.remove(item.id).await?;
                    report.succeeded += 1;
                }
                Err(err) => {
                    let retry_count = item.retry_count + 1;
                    let too_old = self.is_expired(&item, self.clock.now());
                    // Another pass on the same day would hit the same limit.
                    let over_limit = err.root().kind() == ErrorKind::Limit;
                    if retry_count >= self.config.max_retry_count || too_old || over_limit {
                        error!(
                            queue_id = %item.id,
                            operation = name,
                            retry_count,
                            error = %err,
                            "giving up on queued operation"
                        );
                        self.remove(item.id).await?;
                        self.notifier.notify(
                            NotificationLevel::Error,
                            &format!("A saved action could not be completed and was discarded: {}", err.root()),
                        );
                        report.dropped += 1;
                    } else {
                        warn!(queue_id = %item.id, operation = name, retry_count, error = %err, "queued operation failed, keeping it");
                        self.record_failure(item.id, retry_count, &err).await?;
                        report.retained += 1;
                    }
                }
            }
        }

        if report.succeeded > 0 {
            self.notifier.notify(
                NotificationLevel::Success,
                &format!("{} saved action(s) completed", report.succeeded),
            );
        }
        Ok(report)
    }

    /// Runs `operation` online with retries. When offline, or when it ultimately
    /// fails with a transient error, `fallback` is queued and `Ok(None)` is returned
    /// so the caller can treat the work as deferred rather than failed.
    pub async fn execute_with_offline_fallback<T, F, Fut>(
        &self,
        operation: F,
        fallback: QueuedOperation,
    ) -> SessionResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        if !self.connectivity.is_online() {
            self.defer(fallback, "You are offline").await?;
            return Ok(None);
        }

        match self.config.retry_policy.execute(operation).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.should_defer() => {
                warn!(operation = fallback.name(), error = %err, "deferring operation to the offline queue");
                self.defer(fallback, "The service is not responding").await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn defer(&self, operation: QueuedOperation, reason: &str) -> SessionResult<()> {
        self.enqueue(operation).await?;
        self.notifier.notify(
            NotificationLevel::Info,
            &format!("{reason}. Your action was queued for retry."),
        );
        Ok(())
    }

    /// Starts the background task: an hourly sweep, periodic processing, and a
    /// processing pass whenever connectivity comes back. Stops when `token` is cancelled.
    pub fn spawn_background(
        self: Arc<Self>,
        dispatcher: Arc<dyn QueueDispatcher>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(self.config.sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut process = tokio::time::interval(self.config.process_interval);
            process.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut online = self.connectivity.subscribe();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep_expired().await {
                            warn!(error = %e, "offline queue sweep failed");
                        }
                    }
                    _ = process.tick() => self.run_pass(dispatcher.as_ref()).await,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            info!("connectivity restored, replaying offline queue");
                            self.run_pass(dispatcher.as_ref()).await;
                        }
                    }
                }
            }
            debug!("offline queue background task stopped");
        })
    }

    async fn run_pass(&self, dispatcher: &dyn QueueDispatcher) {
        match self.process_queue(dispatcher).await {
            Ok(report) if report != ProcessReport::default() => {
                info!(
                    succeeded = report.succeeded,
                    retained = report.retained,
                    dropped = report.dropped,
                    "offline queue pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "offline queue pass failed"),
        }
    }
}
