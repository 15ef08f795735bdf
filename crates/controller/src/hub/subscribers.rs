//! Broadcast Hub: fan-out of ingested samples to live subscribers.
//!
//! Subscribers declare a `(workspace_id, probe_id)` filter at registration
//! (`probe_id == 0` = all probes in the workspace) and are authorized once at
//! that point; share-token subscribers are additionally constrained to the
//! link scope on every event and periodically re-checked against the store so
//! revocation takes effect within the revalidation window.
//!
//! Fan-out is best-effort real time. A slow subscriber never blocks the
//! others: its bounded queue overflows and the connection is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, RwLock};

use netwatch_protocol::{BroadcastEvent, PanelFrame};

use crate::hub::{CloseReason, ConnectionKick};
use crate::store::IdentityStore;

/// Event filter declared at subscription time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub workspace_id: i64,
    /// 0 means every probe in the workspace.
    pub probe_id: i64,
}

impl Filter {
    fn matches(&self, event: &BroadcastEvent) -> bool {
        self.workspace_id == event.workspace_id
            && (self.probe_id == 0 || self.probe_id == event.probe_id)
    }
}

/// How the subscriber was authorized.
#[derive(Debug, Clone)]
pub enum SubscriberScope {
    /// Workspace member; role checked at registration.
    User,
    /// Share-token session, constrained to the link's scope.
    Share {
        link_id: i64,
        agent_id: Option<i64>,
        probe_id: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl SubscriberScope {
    fn admits(&self, event: &BroadcastEvent) -> bool {
        match self {
            SubscriberScope::User => true,
            SubscriberScope::Share {
                agent_id, probe_id, ..
            } => {
                if let Some(scoped_agent) = agent_id
                    && *scoped_agent != event.agent_id
                {
                    return false;
                }
                if let Some(scoped_probe) = probe_id
                    && *scoped_probe != event.probe_id
                {
                    return false;
                }
                true
            }
        }
    }
}

struct Subscriber {
    filter: Filter,
    scope: SubscriberScope,
    tx: mpsc::Sender<PanelFrame>,
    kick: Arc<ConnectionKick>,
    last_check: Arc<StdMutex<DateTime<Utc>>>,
}

pub struct BroadcastHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    identity: Arc<dyn IdentityStore>,
    revalidate: Duration,
}

impl BroadcastHub {
    pub fn new(identity: Arc<dyn IdentityStore>, revalidate_secs: u64) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            identity,
            revalidate: Duration::seconds(revalidate_secs as i64),
        }
    }

    /// Register an already-authorized subscriber. `tx` is the connection's
    /// bounded send queue, drained only by its writer task; `kick` is the
    /// connection's close signal.
    pub async fn subscribe(
        &self,
        filter: Filter,
        scope: SubscriberScope,
        tx: mpsc::Sender<PanelFrame>,
        kick: Arc<ConnectionKick>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                filter,
                scope,
                tx,
                kick,
                last_check: Arc::new(StdMutex::new(Utc::now())),
            },
        );
        tracing::debug!(subscriber_id = id, workspace_id = filter.workspace_id, probe_id = filter.probe_id, "Subscriber registered");
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Route one event to every admitted subscriber.
    pub async fn publish(&self, event: &BroadcastEvent) {
        struct Candidate {
            id: u64,
            tx: mpsc::Sender<PanelFrame>,
            kick: Arc<ConnectionKick>,
            recheck_link: Option<i64>,
        }

        let now = Utc::now();
        let mut candidates = Vec::new();
        let mut dead = Vec::new();

        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if !sub.filter.matches(event) || !sub.scope.admits(event) {
                    continue;
                }

                let mut recheck_link = None;
                if let SubscriberScope::Share {
                    link_id,
                    expires_at,
                    ..
                } = &sub.scope
                {
                    if expires_at.is_some_and(|e| e <= now) {
                        sub.kick.fire(CloseReason::UNAUTHORIZED);
                        dead.push(*id);
                        continue;
                    }
                    let due = {
                        let mut last = sub.last_check.lock().unwrap_or_else(|e| e.into_inner());
                        let near_expiry = expires_at.is_some_and(|e| e - now <= self.revalidate);
                        if near_expiry || now - *last >= self.revalidate {
                            *last = now;
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        recheck_link = Some(*link_id);
                    }
                }

                candidates.push(Candidate {
                    id: *id,
                    tx: sub.tx.clone(),
                    kick: Arc::clone(&sub.kick),
                    recheck_link,
                });
            }
        }

        for candidate in candidates {
            if let Some(link_id) = candidate.recheck_link {
                match self.identity.share_link_by_id(link_id).await {
                    Ok(Some(link)) if !link.is_expired(now) => {}
                    Ok(_) => {
                        tracing::info!(subscriber_id = candidate.id, link_id, "Share link revoked, dropping subscriber");
                        candidate.kick.fire(CloseReason::UNAUTHORIZED);
                        dead.push(candidate.id);
                        continue;
                    }
                    Err(e) => {
                        // Transient store failure: keep delivering, retry on
                        // the next due event.
                        tracing::warn!(link_id, "Share link recheck failed: {e}");
                    }
                }
            }

            match candidate
                .tx
                .try_send(PanelFrame::ProbeData(event.clone()))
            {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber_id = candidate.id, "Subscriber queue saturated, dropping");
                    candidate.kick.fire(CloseReason::BACKPRESSURE);
                    dead.push(candidate.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(candidate.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}
