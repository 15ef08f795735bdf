//! Persistence seams: the relational Identity Store and the append-only
//! Time-Series Store.
//!
//! Both are plain read/write adapters with no business logic. The in-memory
//! implementation backs tests and DSN-less deployments; the Postgres
//! implementation is selected when `DATABASE_URL` is configured.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use netwatch_protocol::{
    Agent, AgentPin, Probe, ProbeSample, ProbeType, QueueStatus, Role, Session, ShareLink,
    SpeedtestQueueItem, User, Workspace, WorkspaceMember,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Relational store for users, workspaces, agents, probes, sessions, share
/// links, and the speedtest queue.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    // Users and workspaces
    async fn insert_user(&self, user: User) -> StoreResult<User>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn user_by_id(&self, id: i64) -> StoreResult<Option<User>>;
    async fn insert_workspace(&self, workspace: Workspace) -> StoreResult<Workspace>;
    async fn insert_member(&self, member: WorkspaceMember) -> StoreResult<()>;
    async fn workspace_role(&self, workspace_id: i64, user_id: i64) -> StoreResult<Option<Role>>;

    // Agents and bootstrap PINs
    async fn insert_agent(&self, agent: Agent) -> StoreResult<Agent>;
    async fn agent_by_id(&self, id: i64) -> StoreResult<Option<Agent>>;
    async fn agents_in_workspace(&self, workspace_id: i64) -> StoreResult<Vec<Agent>>;
    async fn set_agent_psk_hash(&self, agent_id: i64, hash: &str) -> StoreResult<()>;
    async fn set_agent_version(&self, agent_id: i64, version: &str) -> StoreResult<()>;
    /// `last_seen_at` is monotonically non-decreasing; earlier timestamps are
    /// ignored.
    async fn touch_agent(&self, agent_id: i64, seen_at: DateTime<Utc>) -> StoreResult<()>;
    /// Deleting an agent cascades to its probes and their samples.
    async fn delete_agent(&self, agent_id: i64) -> StoreResult<()>;
    async fn insert_pin(&self, pin: AgentPin) -> StoreResult<()>;
    async fn pin_for_agent(&self, agent_id: i64) -> StoreResult<Option<AgentPin>>;
    async fn consume_pin(&self, agent_id: i64) -> StoreResult<()>;

    // Probes
    async fn insert_probe(&self, probe: Probe) -> StoreResult<Probe>;
    async fn probe_by_id(&self, id: i64) -> StoreResult<Option<Probe>>;
    async fn probes_for_agent(&self, agent_id: i64) -> StoreResult<Vec<Probe>>;
    /// Server-side probes of `kind` owned by `agent_id`, ordered by creation
    /// time then ascending id.
    async fn server_probes_for_agent(
        &self,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>>;
    /// Non-server probes of `kind` in the workspace whose first target
    /// references `server_agent_id`, ordered by creation time then id.
    async fn client_probes_of_server(
        &self,
        workspace_id: i64,
        server_agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>>;

    // Sessions
    async fn insert_session(&self, session: Session) -> StoreResult<Session>;
    async fn session_by_id(&self, id: i64) -> StoreResult<Option<Session>>;
    async fn extend_session(&self, id: i64, expiry: DateTime<Utc>) -> StoreResult<()>;
    async fn set_session_connection(&self, id: i64, conn_id: Option<&str>) -> StoreResult<()>;
    async fn delete_session(&self, id: i64) -> StoreResult<()>;
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // Share links
    async fn insert_share_link(&self, link: ShareLink) -> StoreResult<ShareLink>;
    async fn share_link_by_token(&self, token: &str) -> StoreResult<Option<ShareLink>>;
    async fn share_link_by_id(&self, id: i64) -> StoreResult<Option<ShareLink>>;
    async fn delete_share_link(&self, id: i64) -> StoreResult<()>;

    // Speedtest queue
    async fn queue_insert(&self, item: SpeedtestQueueItem) -> StoreResult<SpeedtestQueueItem>;
    async fn queue_item(&self, id: i64) -> StoreResult<Option<SpeedtestQueueItem>>;
    /// All items for an agent in insertion order.
    async fn queue_items_for_agent(&self, agent_id: i64) -> StoreResult<Vec<SpeedtestQueueItem>>;
    async fn queue_update_status(
        &self,
        id: i64,
        status: QueueStatus,
        result_ref: Option<String>,
    ) -> StoreResult<()>;
    /// Transition every `pending`/`in_flight` item past its expiry to
    /// `expired`, returning the affected items.
    async fn queue_expire_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<SpeedtestQueueItem>>;
}

/// Append-only sink for probe samples with workspace/probe/agent indexing.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn append(&self, sample: &ProbeSample) -> StoreResult<()>;
    /// Most recent sample of `kind` emitted by `agent_id`.
    async fn latest_for_agent(
        &self,
        workspace_id: i64,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Option<ProbeSample>>;
    async fn range(
        &self,
        workspace_id: i64,
        probe_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ProbeSample>>;
}
