//! Durable per-host message queue.
//!
//! Serves three purposes: deliver commands to agents that may be offline,
//! absorb inbound bursts for later processing, and act as the serialization
//! boundary between the service layer and the WebSocket layer. Ordering is
//! strict priority then FIFO within one host's queue; there is no global
//! preemption across hosts.
//!
//! Retry policy: transport failures are retryable with exponential backoff
//! (base 5 s, cap 5 min, ±30 % of base jitter); validation failures,
//! permission denials, and stale-delete responses are terminal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{PgConnection, PgPool};
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

use sysmanage_db::models::{QueueDirection, QueueEntry, QueuePriority};
use sysmanage_db::queue as queue_repo;
use sysmanage_db::queue::NewQueueEntry;

use crate::error::QueueError;

/// Default delivery attempts before an entry is terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Batch size used by session drainers.
pub const DRAIN_BATCH: i64 = 16;

const BACKOFF_BASE_SECS: f64 = 5.0;
const BACKOFF_CAP_SECS: f64 = 300.0;

/// Parameters for a new queue entry.
#[derive(Debug, Clone)]
pub struct EnqueueParams {
    pub message_type: String,
    pub payload: serde_json::Value,
    pub direction: QueueDirection,
    pub host_id: Option<Uuid>,
    pub priority: QueuePriority,
    pub expires_in: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl EnqueueParams {
    /// An outbound command for a host at NORMAL priority.
    #[must_use]
    pub fn outbound(host_id: Uuid, message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_owned(),
            payload,
            direction: QueueDirection::Outbound,
            host_id: Some(host_id),
            priority: QueuePriority::Normal,
            expires_in: None,
            correlation_id: None,
        }
    }

    /// Override the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the originating command's message id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }
}

/// Wakes per-host drainers when work arrives, so they never busy-poll.
/// Stale subscribers are harmless — a spurious wakeup dequeues nothing.
#[derive(Debug, Default)]
pub struct QueueNotifier {
    inner: RwLock<HashMap<Uuid, Arc<Notify>>>,
}

impl QueueNotifier {
    /// Handle for a host's wakeup signal, creating it on first use.
    pub async fn subscribe(&self, host_id: Uuid) -> Arc<Notify> {
        if let Some(notify) = self.inner.read().await.get(&host_id) {
            return Arc::clone(notify);
        }
        let mut map = self.inner.write().await;
        Arc::clone(map.entry(host_id).or_default())
    }

    /// Wake the drainer for a host, if one is listening.
    pub async fn notify(&self, host_id: Uuid) {
        if let Some(notify) = self.inner.read().await.get(&host_id) {
            notify.notify_one();
        }
    }

    /// Drop the signal for a departed host.
    pub async fn forget(&self, host_id: Uuid) {
        self.inner.write().await.remove(&host_id);
    }
}

/// The durable message queue over the relational store.
pub struct MessageQueue {
    pool: PgPool,
    notifier: Arc<QueueNotifier>,
}

impl MessageQueue {
    /// Create a queue bound to the given pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notifier: Arc::new(QueueNotifier::default()),
        }
    }

    /// The notifier shared with session drainers.
    #[must_use]
    pub fn notifier(&self) -> Arc<QueueNotifier> {
        Arc::clone(&self.notifier)
    }

    /// Persist a new entry inside the caller's transaction.
    ///
    /// The caller is responsible for waking the host's drainer after commit
    /// ([`QueueNotifier::notify`]) — notifying before commit would wake the
    /// drainer into a queue that does not yet contain the entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] if the insert fails.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        params: EnqueueParams,
    ) -> Result<QueueEntry, QueueError> {
        let now = Utc::now();
        let new = NewQueueEntry {
            message_type: params.message_type,
            payload: params.payload,
            direction: params.direction,
            host_id: params.host_id,
            priority: params.priority,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            expires_at: params.expires_in.map(|ttl| now + ttl),
            correlation_id: params.correlation_id,
        };
        let entry = queue_repo::insert_entry(conn, &new, now).await?;

        debug!(
            entry_id = %entry.id,
            message_type = %entry.message_type,
            host_id = ?entry.host_id,
            "queue entry enqueued"
        );

        Ok(entry)
    }

    /// Persist a new entry in its own transaction and wake the drainer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] if the insert fails.
    pub async fn enqueue(&self, params: EnqueueParams) -> Result<QueueEntry, QueueError> {
        let host_id = params.host_id;
        let mut conn = self.pool.acquire().await.map_err(sysmanage_db::DbError::from)?;
        let entry = self.enqueue_in(&mut *conn, params).await?;
        drop(conn);

        if let Some(host_id) = host_id {
            self.notifier.notify(host_id).await;
        }
        Ok(entry)
    }

    /// Atomically claim up to `max` due outbound entries for a host, in
    /// strict priority-then-FIFO order. Claimed entries are `in_flight`
    /// before this returns, so concurrent dequeuers never share an entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn dequeue_outbound(
        &self,
        host_id: Uuid,
        max: i64,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(sysmanage_db::DbError::from)?;
        let entries = queue_repo::lock_pending_outbound(&mut *tx, host_id, max, Utc::now()).await?;
        tx.commit().await.map_err(sysmanage_db::DbError::from)?;
        Ok(entries)
    }

    /// Claim up to `limit` due inbound entries regardless of host.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn fetch_inbound(&self, limit: i64) -> Result<Vec<QueueEntry>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(sysmanage_db::DbError::from)?;
        let entries = queue_repo::lock_pending_inbound(&mut *tx, limit, Utc::now()).await?;
        tx.commit().await.map_err(sysmanage_db::DbError::from)?;
        Ok(entries)
    }

    /// Transition `in_flight -> delivered`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn ack_delivered(&self, entry_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(sysmanage_db::DbError::from)?;
        queue_repo::mark_delivered(&mut *conn, entry_id).await?;
        Ok(())
    }

    /// Record a delivery failure. Retryable failures below the attempt cap
    /// reschedule with backoff; everything else is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if the entry does not exist,
    /// [`QueueError::Db`] on storage failure.
    pub async fn ack_failed(
        &self,
        entry_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(sysmanage_db::DbError::from)?;

        let entry = queue_repo::get_entry_for_update(&mut *tx, entry_id)
            .await
            .map_err(|e| match e {
                sysmanage_db::DbError::NotFound { .. } => QueueError::NotFound { id: entry_id },
                other => QueueError::Db(other),
            })?;

        if entry.status.is_terminal() {
            // Already settled; nothing to do.
            tx.commit().await.map_err(sysmanage_db::DbError::from)?;
            return Ok(());
        }

        if retryable && entry.attempts + 1 < entry.max_attempts {
            let delay = backoff_delay(entry.attempts);
            let next = Utc::now() + delay;
            queue_repo::reschedule_entry(&mut *tx, entry_id, next, error).await?;
            debug!(
                entry_id = %entry_id,
                attempt = entry.attempts + 1,
                retry_in_secs = delay.num_seconds(),
                "queue entry rescheduled"
            );
        } else {
            queue_repo::mark_failed(&mut *tx, entry_id, error).await?;
            debug!(entry_id = %entry_id, error, "queue entry failed terminally");
        }

        tx.commit().await.map_err(sysmanage_db::DbError::from)?;
        Ok(())
    }

    /// Expire every non-terminal entry whose deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(sysmanage_db::DbError::from)?;
        let expired = queue_repo::expire_stale(&mut *conn, now).await?;
        Ok(expired)
    }

    /// Delete terminal entries older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - retention;
        let mut conn = self.pool.acquire().await.map_err(sysmanage_db::DbError::from)?;
        let deleted = queue_repo::cleanup_terminal(&mut *conn, cutoff).await?;
        Ok(deleted)
    }

    /// Revert a host's undelivered `in_flight` entries to `pending`. Run at
    /// connection end so closing a session never loses commands.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Db`] on storage failure.
    pub async fn recover_in_flight(&self, host_id: Uuid) -> Result<u64, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(sysmanage_db::DbError::from)?;
        let reverted = queue_repo::revert_in_flight(&mut *conn, host_id).await?;
        if reverted > 0 {
            debug!(host_id = %host_id, reverted, "in-flight entries recovered to pending");
        }
        Ok(reverted)
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue").finish_non_exhaustive()
    }
}

/// Retry delay for the n-th failure: `min(5 * 2^n, 300)` seconds, jittered
/// by ±30 % of the base so reconnect storms decorrelate.
#[must_use]
pub fn backoff_delay(attempts: i32) -> Duration {
    let exp = (BACKOFF_BASE_SECS * 2f64.powi(attempts.max(0))).min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(-0.3..=0.3) * BACKOFF_BASE_SECS;
    let secs = (exp + jitter).max(0.0);
    #[allow(clippy::cast_possible_truncation)]
    Duration::milliseconds((secs * 1000.0) as i64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        // Jitter is ±1.5 s around the deterministic schedule.
        let schedule = [5.0, 10.0, 20.0, 40.0, 80.0, 160.0, 300.0, 300.0];
        for (attempt, expected) in schedule.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let delay = backoff_delay(attempt as i32).num_milliseconds() as f64 / 1000.0;
            assert!(
                (delay - expected).abs() <= 1.5 + f64::EPSILON,
                "attempt {attempt}: got {delay}, expected {expected} ± 1.5"
            );
        }
    }

    #[test]
    fn backoff_is_never_negative() {
        for attempt in 0..10 {
            assert!(backoff_delay(attempt) >= Duration::zero());
        }
    }

    #[test]
    fn enqueue_params_builder() {
        let host = Uuid::new_v4();
        let params = EnqueueParams::outbound(host, "command", serde_json::json!({"a": 1}))
            .with_priority(QueuePriority::Urgent)
            .with_correlation("msg-123");
        assert_eq!(params.host_id, Some(host));
        assert_eq!(params.priority, QueuePriority::Urgent);
        assert_eq!(params.correlation_id.as_deref(), Some("msg-123"));
        assert_eq!(params.direction, QueueDirection::Outbound);
    }

    #[test]
    fn priority_ordering_is_strict() {
        assert!(QueuePriority::Urgent > QueuePriority::High);
        assert!(QueuePriority::High > QueuePriority::Normal);
        assert!(QueuePriority::Normal > QueuePriority::Low);
    }

    #[tokio::test]
    async fn notifier_wakes_subscriber() {
        let notifier = QueueNotifier::default();
        let host = Uuid::new_v4();
        let handle = notifier.subscribe(host).await;
        notifier.notify(host).await;
        // notified() completes immediately thanks to the stored permit.
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notify_without_subscriber_is_harmless() {
        let notifier = QueueNotifier::default();
        notifier.notify(Uuid::new_v4()).await;
    }
}
