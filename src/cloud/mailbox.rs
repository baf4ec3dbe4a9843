//! Durable store-and-forward queue for agents that are offline.
//!
//! Entries carry an absolute `expires_at` fixed at enqueue time. Draining
//! claims every live entry for the agent in creation order and marks it
//! delivered; expired entries are never returned and are removed by the
//! periodic purge without being reported as failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::protocol::{Envelope, EnvelopeType};

/// A persisted message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueEntry {
    pub id: Uuid,
    pub agent_id: String,
    pub message_type: EnvelopeType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OfflineQueueEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Rebuild the envelope for delivery. The entry id becomes the
    /// envelope id so the agent sees the same id on every attempt.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::from_parts(
            self.id.to_string(),
            self.message_type,
            self.payload.clone(),
            self.created_at.timestamp_millis(),
        )
    }
}

/// Offline mailbox over a [`Database`].
#[derive(Clone)]
pub struct OfflineMailbox {
    db: Arc<dyn Database>,
    default_ttl: Duration,
}

impl OfflineMailbox {
    pub fn new(db: Arc<dyn Database>, default_ttl: Duration) -> Self {
        Self { db, default_ttl }
    }

    /// Store a message for later delivery.
    pub async fn enqueue(
        &self,
        agent_id: &str,
        message_type: EnvelopeType,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<OfflineQueueEntry, DatabaseError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DatabaseError::Corrupt(format!("ttl out of range: {}", e)))?;
        let entry = OfflineQueueEntry {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            message_type,
            payload,
            created_at: now,
            expires_at: now + ttl,
            delivered: false,
            delivered_at: None,
        };
        self.db.enqueue_message(&entry).await?;
        tracing::info!(
            agent_id = %agent_id,
            kind = %message_type,
            expires_at = %entry.expires_at,
            "Queued message for offline agent"
        );
        Ok(entry)
    }

    /// Store an envelope with the default TTL.
    pub async fn enqueue_envelope(
        &self,
        agent_id: &str,
        envelope: &Envelope,
    ) -> Result<OfflineQueueEntry, DatabaseError> {
        self.enqueue(
            agent_id,
            envelope.kind(),
            envelope.payload().clone(),
            self.default_ttl,
        )
        .await
    }

    /// Claim every undelivered, unexpired entry for the agent, oldest first.
    pub async fn drain(&self, agent_id: &str) -> Result<Vec<OfflineQueueEntry>, DatabaseError> {
        self.db.claim_pending_messages(agent_id, Utc::now()).await
    }

    /// Return a claimed entry to the queue after a failed delivery. Its
    /// position and expiry are unchanged.
    pub async fn requeue(&self, entry: &OfflineQueueEntry) -> Result<(), DatabaseError> {
        self.db.release_message(entry.id).await
    }

    pub async fn pending_count(&self, agent_id: &str) -> Result<usize, DatabaseError> {
        self.db.pending_message_count(agent_id, Utc::now()).await
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let removed = self.db.purge_expired_messages(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged expired offline messages");
        }
        Ok(removed)
    }

    /// Run [`purge_expired`](Self::purge_expired) on an interval until cancelled.
    pub fn spawn_purge_task(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let mailbox = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = mailbox.purge_expired().await {
                            tracing::error!("Offline mailbox purge failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryStore;
    use serde_json::json;

    fn mailbox() -> OfflineMailbox {
        OfflineMailbox::new(Arc::new(InMemoryStore::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_drain_returns_creation_order_once() {
        let mailbox = mailbox();
        for n in 0..3 {
            mailbox
                .enqueue(
                    "agent-a",
                    EnvelopeType::TaskCancel,
                    json!({"taskId": format!("t{}", n)}),
                    Duration::from_secs(86_400),
                )
                .await
                .unwrap();
        }
        mailbox
            .enqueue("agent-b", EnvelopeType::TaskCancel, json!({}), Duration::from_secs(60))
            .await
            .unwrap();

        let drained = mailbox.drain("agent-a").await.unwrap();
        let ids: Vec<_> = drained
            .iter()
            .map(|e| e.payload["taskId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);
        assert!(drained.iter().all(|e| e.delivered && e.delivered_at.is_some()));

        assert!(mailbox.drain("agent-a").await.unwrap().is_empty());
        assert_eq!(mailbox.pending_count("agent-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_never_drained_and_purged() {
        let mailbox = mailbox();
        mailbox
            .enqueue("agent-a", EnvelopeType::TaskCancel, json!({}), Duration::ZERO)
            .await
            .unwrap();
        assert!(mailbox.drain("agent-a").await.unwrap().is_empty());
        assert_eq!(mailbox.purge_expired().await.unwrap(), 1);
        assert_eq!(mailbox.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_keeps_position() {
        let mailbox = mailbox();
        let first = mailbox
            .enqueue("agent-a", EnvelopeType::TaskCancel, json!({"n": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        mailbox
            .enqueue("agent-a", EnvelopeType::TaskCancel, json!({"n": 2}), Duration::from_secs(60))
            .await
            .unwrap();

        let drained = mailbox.drain("agent-a").await.unwrap();
        for entry in &drained {
            mailbox.requeue(entry).await.unwrap();
        }

        let again = mailbox.drain("agent-a").await.unwrap();
        assert_eq!(again[0].id, first.id);
        assert_eq!(again[0].expires_at, first.expires_at);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_entry_to_envelope_reuses_id() {
        let entry = OfflineQueueEntry {
            id: Uuid::new_v4(),
            agent_id: "agent-a".to_string(),
            message_type: EnvelopeType::SystemRestart,
            payload: json!({}),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            delivered: false,
            delivered_at: None,
        };
        let envelope = entry.to_envelope();
        assert_eq!(envelope.id(), entry.id.to_string());
        assert_eq!(envelope.kind(), EnvelopeType::SystemRestart);
    }
}
