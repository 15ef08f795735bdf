use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-workspace membership role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Viewer,
    User,
    Admin,
    Owner,
}

/// Site-wide role attached to a user account.
/// `SiteAdmin` bypasses workspace-level authorization checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteRole {
    Viewer,
    User,
    SiteAdmin,
}

/// Measurement kinds an agent can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeType {
    Ping,
    Mtr,
    Speedtest,
    SpeedtestServers,
    Netinfo,
    Sysinfo,
    Trafficsim,
}

impl ProbeType {
    /// Types whose client side pairs against a server-side probe on a peer
    /// agent, and therefore resolve to the server's bind `host:port`.
    pub fn pairs_with_server(self) -> bool {
        matches!(self, ProbeType::Trafficsim)
    }
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeType::Ping => "PING",
            ProbeType::Mtr => "MTR",
            ProbeType::Speedtest => "SPEEDTEST",
            ProbeType::SpeedtestServers => "SPEEDTEST_SERVERS",
            ProbeType::Netinfo => "NETINFO",
            ProbeType::Sysinfo => "SYSINFO",
            ProbeType::Trafficsim => "TRAFFICSIM",
        };
        f.write_str(s)
    }
}

/// A probe destination: either a literal `host[:port]` string or a reference
/// to a peer agent whose public IP is substituted at fetch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target has both a literal destination and an agent reference")]
    Ambiguous,
    #[error("bind target {0:?} is not a valid host:port")]
    BadBindAddress(String),
}

impl ProbeTarget {
    pub fn literal(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            agent_id: None,
            group_id: None,
        }
    }

    pub fn agent(agent_id: i64) -> Self {
        Self {
            target: None,
            agent_id: Some(agent_id),
            group_id: None,
        }
    }

    /// True when neither a literal target nor an agent reference is set.
    /// Such targets (group-only included) are skipped at resolution time.
    pub fn is_empty(&self) -> bool {
        self.target.as_deref().is_none_or(str::is_empty) && self.agent_id.is_none()
    }

    /// Write-time validation: a target may carry a literal destination or an
    /// agent reference, never both.
    pub fn validate(&self) -> Result<(), TargetError> {
        let has_literal = self.target.as_deref().is_some_and(|t| !t.is_empty());
        if has_literal && self.agent_id.is_some() {
            return Err(TargetError::Ambiguous);
        }
        Ok(())
    }
}

/// A standing measurement definition owned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub id: i64,
    pub workspace_id: i64,
    pub agent_id: i64,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    pub interval_sec: u32,
    pub count: u32,
    pub duration: u32,
    pub server: bool,
    pub enabled: bool,
    pub targets: Vec<ProbeTarget>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<DateTime<Utc>>,
}

/// A remote daemon executing probes and reporting samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    /// Argon2 digest of the agent's PSK. Never serialized.
    #[serde(skip)]
    pub psk_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One-shot bootstrap PIN for an unclaimed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPin {
    pub agent_id: i64,
    /// Peppered SHA-256 digest of the PIN.
    #[serde(skip)]
    pub pin_hash: String,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub role: SiteRole,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub owner_user_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub workspace_id: i64,
    pub user_id: i64,
    pub role: Role,
}

/// Envelope an agent submits with `probe_post`. The controller fills in the
/// workspace and emitter from the authenticated session, never from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEnvelope {
    pub probe_id: i64,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<i64>,
    #[serde(default)]
    pub triggered: bool,
    pub payload: serde_json::Value,
}

/// A persisted probe execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    pub workspace_id: i64,
    pub probe_id: i64,
    /// Emitting agent.
    pub agent_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub triggered: bool,
    pub payload: serde_json::Value,
}

/// An authenticated bearer session (user, agent, or share-scoped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// User id or agent id, depending on `is_agent`. Zero for share sessions.
    pub item_id: i64,
    pub is_agent: bool,
    /// Set when the session was minted from a share link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_link_id: Option<i64>,
    pub created: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_connection_id: Option<String>,
    pub ip: String,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// A URL-safe token granting read-only (optionally speedtest-triggering)
/// access to a scoped subset of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: i64,
    pub token: String,
    pub workspace_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_id: Option<i64>,
    #[serde(skip)]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub allow_speedtest: bool,
    pub created_at: DateTime<Utc>,
}

impl ShareLink {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }

    /// Whether the link's scope admits a sample for `(agent_id, probe_id)`.
    pub fn admits(&self, agent_id: i64, probe_id: i64) -> bool {
        if let Some(scoped_agent) = self.agent_id
            && scoped_agent != agent_id
        {
            return false;
        }
        if let Some(scoped_probe) = self.probe_id
            && scoped_probe != probe_id
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Completed,
    Expired,
}

/// A user-initiated, one-shot speedtest request against a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedtestQueueItem {
    pub id: i64,
    pub agent_id: i64,
    pub requester_user_id: i64,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::Viewer < Role::User);
        assert!(Role::User < Role::Admin);
        assert!(Role::Admin < Role::Owner);
    }

    #[test]
    fn probe_type_wire_names_are_screaming_snake() {
        let json = serde_json::to_string(&ProbeType::Trafficsim).unwrap();
        assert_eq!(json, r#""TRAFFICSIM""#);
        let json = serde_json::to_string(&ProbeType::SpeedtestServers).unwrap();
        assert_eq!(json, r#""SPEEDTEST_SERVERS""#);
        let parsed: ProbeType = serde_json::from_str(r#""MTR""#).unwrap();
        assert_eq!(parsed, ProbeType::Mtr);
    }

    #[test]
    fn target_validate_rejects_ambiguous() {
        let t = ProbeTarget {
            target: Some("203.0.113.9".into()),
            agent_id: Some(4),
            group_id: None,
        };
        assert_eq!(t.validate(), Err(TargetError::Ambiguous));
    }

    #[test]
    fn target_validate_accepts_either_side() {
        assert!(ProbeTarget::literal("1.1.1.1").validate().is_ok());
        assert!(ProbeTarget::agent(9).validate().is_ok());
        // Group-only targets are legal at write time and ignored at resolution
        let group_only = ProbeTarget {
            target: None,
            agent_id: None,
            group_id: Some(7),
        };
        assert!(group_only.validate().is_ok());
        assert!(group_only.is_empty());
    }

    #[test]
    fn agent_target_serializes_without_empty_fields() {
        let json = serde_json::to_string(&ProbeTarget::agent(12)).unwrap();
        assert_eq!(json, r#"{"agent_id":12}"#);
    }

    #[test]
    fn share_link_scope_admission() {
        let link = ShareLink {
            id: 1,
            token: "t".into(),
            workspace_id: 3,
            agent_id: Some(5),
            probe_id: None,
            password_hash: None,
            expires_at: None,
            allow_speedtest: false,
            created_at: Utc::now(),
        };
        assert!(link.admits(5, 100));
        assert!(link.admits(5, 200));
        assert!(!link.admits(6, 100));
        assert!(!link.is_expired(Utc::now()));
    }

    #[test]
    fn share_link_probe_scope_restricts() {
        let link = ShareLink {
            id: 1,
            token: "t".into(),
            workspace_id: 3,
            agent_id: Some(5),
            probe_id: Some(42),
            password_hash: None,
            expires_at: None,
            allow_speedtest: false,
            created_at: Utc::now(),
        };
        assert!(link.admits(5, 42));
        assert!(!link.admits(5, 43));
    }

    #[test]
    fn session_expiry() {
        let now = Utc::now();
        let live = Session {
            id: 1,
            item_id: 2,
            is_agent: false,
            share_link_id: None,
            created: now,
            expiry: now + chrono::Duration::hours(1),
            ws_connection_id: None,
            ip: "127.0.0.1".into(),
        };
        assert!(!live.is_expired(now));
        assert!(live.is_expired(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn psk_hash_never_serialized() {
        let agent = Agent {
            id: 1,
            workspace_id: 1,
            name: "edge-1".into(),
            psk_hash: Some("$argon2id$...".into()),
            public_ip_override: None,
            last_seen_at: None,
            version: None,
        };
        let json = serde_json::to_string(&agent).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("psk_hash"));
    }
}
