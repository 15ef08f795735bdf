//! Live-connection registries: the Agent Session Hub and the Broadcast Hub.
//!
//! Both enforce the one-writer-per-connection discipline: frames are only
//! ever written by the connection's writer task, which drains a bounded send
//! queue. Overflow drops the connection.

pub mod agents;
pub mod subscribers;

use std::sync::OnceLock;

use tokio::sync::Notify;

/// Why a connection is being closed, carried to the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub text: &'static str,
}

impl CloseReason {
    pub const UNAUTHORIZED: Self = Self {
        code: netwatch_protocol::CLOSE_UNAUTHORIZED,
        text: "unauthorized",
    };
    pub const BACKPRESSURE: Self = Self {
        code: netwatch_protocol::CLOSE_BACKPRESSURE,
        text: "backpressure",
    };
    pub const SUPERSEDED: Self = Self {
        code: netwatch_protocol::CLOSE_SUPERSEDED,
        text: "superseded",
    };
}

/// One-shot kick signal attached to every live connection. Firing it tells
/// the connection's tasks to close with the given reason; the first reason
/// wins.
#[derive(Debug, Default)]
pub struct ConnectionKick {
    reason: OnceLock<CloseReason>,
    notify: Notify,
}

impl ConnectionKick {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.notify.notify_waiters();
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolves once the kick has been fired. Safe to poll repeatedly.
    pub async fn fired(&self) -> CloseReason {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            if let Some(reason) = self.reason.get() {
                return *reason;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}
