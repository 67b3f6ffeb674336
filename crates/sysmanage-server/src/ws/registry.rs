//! Live session registry.
//!
//! One agent session per host: when a second connection authenticates for an
//! already-connected host, the older session is told to close and the newer
//! one takes the slot. Reconnections are thereby serialized — two sessions
//! for the same host never interleave writes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SessionSlot {
    connection_id: String,
    close: Arc<Notify>,
}

/// Tracks which connection currently owns each host.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: RwLock<HashMap<Uuid, SessionSlot>>,
}

impl ConnectionRegistry {
    /// Claim the session slot for a host. Any previous session is signalled
    /// to close. Returns the close signal the new session must honor.
    pub async fn attach(&self, host_id: Uuid, connection_id: &str) -> Arc<Notify> {
        let close = Arc::new(Notify::new());
        let slot = SessionSlot {
            connection_id: connection_id.to_owned(),
            close: Arc::clone(&close),
        };

        if let Some(previous) = self.slots.write().await.insert(host_id, slot) {
            info!(
                host_id = %host_id,
                superseded = %previous.connection_id,
                "newer agent session supersedes existing connection"
            );
            previous.close.notify_one();
        }

        close
    }

    /// Release the slot, but only if this connection still owns it — a
    /// superseded session must not evict its successor.
    pub async fn detach(&self, host_id: Uuid, connection_id: &str) {
        let mut slots = self.slots.write().await;
        if slots
            .get(&host_id)
            .is_some_and(|slot| slot.connection_id == connection_id)
        {
            slots.remove(&host_id);
        }
    }

    /// Whether a host currently has a live session.
    pub async fn is_connected(&self, host_id: Uuid) -> bool {
        self.slots.read().await.contains_key(&host_id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_session_supersedes_older() {
        let registry = ConnectionRegistry::default();
        let host = Uuid::new_v4();

        let close_a = registry.attach(host, "conn-a").await;
        let _close_b = registry.attach(host, "conn-b").await;

        // The older session got a close signal.
        tokio::time::timeout(std::time::Duration::from_secs(1), close_a.notified())
            .await
            .unwrap();
        assert!(registry.is_connected(host).await);
    }

    #[tokio::test]
    async fn superseded_session_cannot_evict_successor() {
        let registry = ConnectionRegistry::default();
        let host = Uuid::new_v4();

        let _a = registry.attach(host, "conn-a").await;
        let _b = registry.attach(host, "conn-b").await;

        // The old session detaches late; the new session keeps the slot.
        registry.detach(host, "conn-a").await;
        assert!(registry.is_connected(host).await);

        registry.detach(host, "conn-b").await;
        assert!(!registry.is_connected(host).await);
    }
}
