//! Agent Session Hub: the registry of live agent connections.
//!
//! At most one connection per agent id. A new connection supersedes the old
//! one (close code 4409); a full send queue drops the connection (4408). The
//! registry slot is only cleared by the connection that owns it, compared by
//! connection id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use netwatch_protocol::{ControllerFrame, CLOSE_BACKPRESSURE, CLOSE_SUPERSEDED};

use crate::error::Error;
use crate::hub::{CloseReason, ConnectionKick};

struct AgentHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<ControllerFrame>,
    kick: Arc<ConnectionKick>,
}

/// Receiver side handed to a freshly registered connection.
pub struct AgentConnection {
    pub agent_id: i64,
    pub conn_id: Uuid,
    pub rx: mpsc::Receiver<ControllerFrame>,
    pub kick: Arc<ConnectionKick>,
}

pub struct AgentHub {
    connections: RwLock<HashMap<i64, AgentHandle>>,
    queue_depth: usize,
}

impl AgentHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_depth,
        }
    }

    /// Register a new connection for `agent_id`, superseding any existing one.
    pub async fn register(&self, agent_id: i64) -> AgentConnection {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let kick = Arc::new(ConnectionKick::new());
        let conn_id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(
            agent_id,
            AgentHandle {
                conn_id,
                tx,
                kick: Arc::clone(&kick),
            },
        ) {
            tracing::info!(agent_id, old_conn = %previous.conn_id, new_conn = %conn_id, "Agent connection superseded");
            previous.kick.fire(CloseReason::SUPERSEDED);
        }

        AgentConnection {
            agent_id,
            conn_id,
            rx,
            kick,
        }
    }

    /// Clear the registry slot, but only if `conn_id` still owns it. A
    /// superseded connection unwinding late must not evict its successor.
    pub async fn deregister(&self, agent_id: i64, conn_id: Uuid) {
        let mut connections = self.connections.write().await;
        if connections
            .get(&agent_id)
            .is_some_and(|h| h.conn_id == conn_id)
        {
            connections.remove(&agent_id);
        }
    }

    /// Queue a frame for the agent's writer. Never blocks: a full queue kicks
    /// the connection with `Backpressure`; a connection already closing
    /// refuses the frame with its close reason.
    pub async fn send(&self, agent_id: i64, frame: ControllerFrame) -> Result<(), Error> {
        let connections = self.connections.read().await;
        let handle = connections
            .get(&agent_id)
            .ok_or(Error::NotFound("agent connection"))?;

        if let Some(reason) = handle.kick.reason() {
            return Err(match reason.code {
                CLOSE_SUPERSEDED => Error::Superseded,
                CLOSE_BACKPRESSURE => Error::Backpressure,
                _ => Error::Cancelled,
            });
        }

        match handle.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(agent_id, conn_id = %handle.conn_id, "Agent send queue saturated, dropping connection");
                handle.kick.fire(CloseReason::BACKPRESSURE);
                Err(Error::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Cancelled),
        }
    }

    pub async fn is_connected(&self, agent_id: i64) -> bool {
        self.connections.read().await.contains_key(&agent_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ask every connected agent to close gracefully. Used at shutdown.
    pub async fn shutdown_all(&self) {
        let connections = self.connections.read().await;
        for (agent_id, handle) in connections.iter() {
            if handle.tx.try_send(ControllerFrame::Shutdown).is_err() {
                tracing::debug!(agent_id, "Could not queue shutdown frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_connection_supersedes_first() {
        let hub = AgentHub::new(4);
        let first = hub.register(42).await;
        assert!(hub.is_connected(42).await);

        let second = hub.register(42).await;
        assert_eq!(first.kick.fired().await, CloseReason::SUPERSEDED);
        assert!(second.kick.reason().is_none());
        assert_eq!(hub.connected_count().await, 1);
    }

    #[tokio::test]
    async fn stale_deregister_does_not_evict_successor() {
        let hub = AgentHub::new(4);
        let first = hub.register(42).await;
        let _second = hub.register(42).await;

        // The superseded connection unwinds after the replacement registered
        hub.deregister(42, first.conn_id).await;
        assert!(hub.is_connected(42).await);
    }

    #[tokio::test]
    async fn own_deregister_clears_slot() {
        let hub = AgentHub::new(4);
        let conn = hub.register(7).await;
        hub.deregister(7, conn.conn_id).await;
        assert!(!hub.is_connected(7).await);
    }

    #[tokio::test]
    async fn send_reaches_the_writer_queue() {
        let hub = AgentHub::new(4);
        let mut conn = hub.register(7).await;
        hub.send(7, ControllerFrame::Ping).await.unwrap();
        assert!(matches!(conn.rx.recv().await, Some(ControllerFrame::Ping)));
    }

    #[tokio::test]
    async fn send_to_unknown_agent_is_not_found() {
        let hub = AgentHub::new(4);
        assert!(matches!(
            hub.send(99, ControllerFrame::Ping).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn overflow_kicks_with_backpressure() {
        let hub = AgentHub::new(2);
        let conn = hub.register(7).await;

        hub.send(7, ControllerFrame::Ping).await.unwrap();
        hub.send(7, ControllerFrame::Ping).await.unwrap();
        // Queue depth 2 exhausted and nothing draining
        let err = hub.send(7, ControllerFrame::Ping).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure));
        assert_eq!(conn.kick.fired().await, CloseReason::BACKPRESSURE);

        // The connection is now closing; further sends are refused
        let err = hub.send(7, ControllerFrame::Ping).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure));
    }

    #[tokio::test]
    async fn registry_routes_to_replacement_after_supersede() {
        let hub = AgentHub::new(4);
        let first = hub.register(7).await;
        let _second = hub.register(7).await;

        // The registry now points at the second connection; a send reaches it
        hub.send(7, ControllerFrame::Ping).await.unwrap();
        assert_eq!(first.kick.fired().await, CloseReason::SUPERSEDED);
    }
}
