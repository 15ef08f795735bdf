use serde::{Deserialize, Serialize};

use crate::model::{Probe, ProbeType, SampleEnvelope};
use chrono::{DateTime, Utc};

/// WebSocket close code sent when the opening handshake fails authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// WebSocket close code sent when a connection's send queue overflows.
pub const CLOSE_BACKPRESSURE: u16 = 4408;
/// WebSocket close code sent when a newer connection replaces this one.
pub const CLOSE_SUPERSEDED: u16 = 4409;

/// Frames an agent sends to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Opens the session; carries agent version, hostname, OS.
    Hello {
        version: String,
        hostname: String,
        os: String,
    },
    /// Request the resolved probe list.
    ProbeGet,
    /// Submit a probe sample.
    ProbePost(SampleEnvelope),
    /// Reports completion of a pushed speedtest job.
    SpeedtestDone {
        request_id: i64,
        sample_ref: String,
    },
    Ping,
    Pong,
}

/// Frames the controller sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ControllerFrame {
    /// Reply to `probe_get` with resolved probes plus per-probe warnings for
    /// probes skipped during resolution.
    ProbeList {
        probes: Vec<Probe>,
        warnings: Vec<ResolutionWarning>,
    },
    ProbePostOk {
        probe_id: i64,
    },
    /// Store write failed; the agent should retry from its local queue.
    ProbePostNack {
        probe_id: i64,
        code: String,
        message: String,
    },
    /// Envelope rejected; the agent must not retry.
    ProbePostReject {
        probe_id: i64,
        code: String,
        message: String,
    },
    /// Push a one-shot speedtest job.
    SpeedtestRequest {
        id: i64,
        options: serde_json::Value,
    },
    Ping,
    Pong,
    /// Controller requests graceful close.
    Shutdown,
}

/// Frames a panel/share subscriber sends to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SubscriberFrame {
    /// Declare the subscription filter. `probe_id == 0` means all probes in
    /// the workspace.
    Subscribe {
        workspace_id: i64,
        #[serde(default)]
        probe_id: i64,
    },
    Ping,
    Pong,
}

/// Frames the controller sends to a panel/share subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PanelFrame {
    Subscribed {
        workspace_id: i64,
        probe_id: i64,
    },
    ProbeData(BroadcastEvent),
    Error {
        code: String,
        message: String,
    },
    Ping,
    Pong,
}

/// A probe skipped during resolution, reported alongside the resolved list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionWarning {
    pub probe_id: i64,
    pub message: String,
}

/// A single sample lifted into the subscriber fan-out plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub workspace_id: i64,
    pub probe_id: i64,
    /// Emitting agent.
    pub agent_id: i64,
    /// Owner of the probe definition, when it differs from the emitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_agent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<i64>,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered: Option<bool>,
}
