//! User-initiated speedtest request queue.
//!
//! Per agent: a FIFO of pending items with a TTL, at most one in flight.
//! Mutating operations for a given agent run inside a per-agent critical
//! section so `next_for` transitions are serializable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use netwatch_protocol::{QueueStatus, SpeedtestQueueItem};

use crate::error::Error;
use crate::store::IdentityStore;

pub struct SpeedtestQueue {
    store: Arc<dyn IdentityStore>,
    pending_max: usize,
    ttl: Duration,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SpeedtestQueue {
    pub fn new(store: Arc<dyn IdentityStore>, pending_max: usize, ttl_secs: u64) -> Self {
        Self {
            store,
            pending_max,
            ttl: Duration::seconds(ttl_secs as i64),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn agent_lock(&self, agent_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(agent_id).or_default().clone()
    }

    /// Append a pending request for `agent_id`. Rejects with `TooManyPending`
    /// once the per-agent pending limit is reached.
    pub async fn enqueue(
        &self,
        agent_id: i64,
        requester_user_id: i64,
    ) -> Result<SpeedtestQueueItem, Error> {
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let pending = self
            .store
            .queue_items_for_agent(agent_id)
            .await?
            .into_iter()
            .filter(|i| i.status == QueueStatus::Pending && i.expires_at > now)
            .count();
        if pending >= self.pending_max {
            return Err(Error::TooManyPending);
        }

        let item = self
            .store
            .queue_insert(SpeedtestQueueItem {
                id: 0,
                agent_id,
                requester_user_id,
                status: QueueStatus::Pending,
                created_at: now,
                expires_at: now + self.ttl,
                result_ref: None,
            })
            .await?;
        tracing::info!(agent_id, item_id = item.id, requester_user_id, "Speedtest queued");
        Ok(item)
    }

    /// Atomically select the oldest live pending item and mark it in flight.
    /// Returns `None` while another item is already in flight for the agent.
    pub async fn next_for(&self, agent_id: i64) -> Result<Option<SpeedtestQueueItem>, Error> {
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let items = self.store.queue_items_for_agent(agent_id).await?;

        if items
            .iter()
            .any(|i| i.status == QueueStatus::InFlight && i.expires_at > now)
        {
            return Ok(None);
        }

        let Some(next) = items
            .into_iter()
            .find(|i| i.status == QueueStatus::Pending && i.expires_at > now)
        else {
            return Ok(None);
        };

        self.store
            .queue_update_status(next.id, QueueStatus::InFlight, None)
            .await?;
        Ok(Some(SpeedtestQueueItem {
            status: QueueStatus::InFlight,
            ..next
        }))
    }

    /// Mark an in-flight item completed, recording the sample reference.
    pub async fn complete(&self, item_id: i64, sample_ref: &str) -> Result<(), Error> {
        let item = self
            .store
            .queue_item(item_id)
            .await?
            .ok_or(Error::NotFound("speedtest request"))?;
        let lock = self.agent_lock(item.agent_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock; the sweep may have expired it meanwhile
        let item = self
            .store
            .queue_item(item_id)
            .await?
            .ok_or(Error::NotFound("speedtest request"))?;
        if item.status != QueueStatus::InFlight {
            return Err(Error::Conflict(format!(
                "speedtest request is not in flight (status {:?})",
                item.status
            )));
        }
        self.store
            .queue_update_status(item_id, QueueStatus::Completed, Some(sample_ref.to_string()))
            .await?;
        tracing::info!(item_id, agent_id = item.agent_id, "Speedtest completed");
        Ok(())
    }

    /// Background sweep: transition pending/in-flight items past their expiry
    /// to expired. Returns the affected items so the caller can hand the next
    /// pending request to a connected agent.
    pub async fn expire(&self) -> Result<Vec<SpeedtestQueueItem>, Error> {
        let expired = self.store.queue_expire_due(Utc::now()).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired stale speedtest requests");
        }
        Ok(expired)
    }
}
