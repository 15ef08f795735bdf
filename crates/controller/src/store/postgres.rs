//! Postgres-backed store implementations (sqlx).
//!
//! Schema bootstrap runs at startup; per-dialect index tuning beyond the
//! day-keyed probe_data indexes is handled by operations tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use netwatch_protocol::{
    Agent, AgentPin, Probe, ProbeSample, ProbeTarget, ProbeType, QueueStatus, Role, Session,
    ShareLink, SpeedtestQueueItem, User, SiteRole, Workspace, WorkspaceMember,
};

use super::{IdentityStore, StoreError, StoreResult, TimeSeriesStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS users_email_key ON users ((lower(email)))",
    "CREATE TABLE IF NOT EXISTS workspaces (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        owner_user_id BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workspace_members (
        workspace_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        role TEXT NOT NULL,
        PRIMARY KEY (workspace_id, user_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS workspace_members_single_owner
        ON workspace_members (workspace_id) WHERE role = 'OWNER'",
    "CREATE TABLE IF NOT EXISTS agents (
        id BIGSERIAL PRIMARY KEY,
        workspace_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        psk_hash TEXT,
        public_ip_override TEXT,
        last_seen_at TIMESTAMPTZ,
        version TEXT
    )",
    "CREATE TABLE IF NOT EXISTS agent_pins (
        agent_id BIGINT PRIMARY KEY,
        pin_hash TEXT NOT NULL,
        consumed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS probes (
        id BIGSERIAL PRIMARY KEY,
        workspace_id BIGINT NOT NULL,
        agent_id BIGINT NOT NULL,
        kind TEXT NOT NULL,
        interval_sec INT NOT NULL,
        count INT NOT NULL,
        duration INT NOT NULL,
        server BOOLEAN NOT NULL,
        enabled BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        pending TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS probes_agent_idx ON probes (agent_id)",
    "CREATE TABLE IF NOT EXISTS probe_targets (
        probe_id BIGINT NOT NULL REFERENCES probes (id) ON DELETE CASCADE,
        position INT NOT NULL,
        target TEXT,
        agent_id BIGINT,
        group_id BIGINT,
        PRIMARY KEY (probe_id, position)
    )",
    "CREATE INDEX IF NOT EXISTS probe_targets_agent_idx ON probe_targets (agent_id)",
    "CREATE TABLE IF NOT EXISTS sessions (
        id BIGSERIAL PRIMARY KEY,
        item_id BIGINT NOT NULL,
        is_agent BOOLEAN NOT NULL,
        share_link_id BIGINT,
        created TIMESTAMPTZ NOT NULL,
        expiry TIMESTAMPTZ NOT NULL,
        ws_connection_id TEXT,
        ip TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sessions_expiry_idx ON sessions (expiry)",
    "CREATE TABLE IF NOT EXISTS share_links (
        id BIGSERIAL PRIMARY KEY,
        token TEXT NOT NULL UNIQUE,
        workspace_id BIGINT NOT NULL,
        agent_id BIGINT,
        probe_id BIGINT,
        password_hash TEXT,
        expires_at TIMESTAMPTZ,
        allow_speedtest BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS speedtest_queue (
        id BIGSERIAL PRIMARY KEY,
        agent_id BIGINT NOT NULL,
        requester_user_id BIGINT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        result_ref TEXT
    )",
    "CREATE INDEX IF NOT EXISTS speedtest_queue_agent_idx ON speedtest_queue (agent_id, status)",
    "CREATE TABLE IF NOT EXISTS probe_data (
        workspace_id BIGINT NOT NULL,
        probe_id BIGINT NOT NULL,
        agent_id BIGINT NOT NULL,
        target_agent_id BIGINT,
        kind TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        target TEXT,
        triggered BOOLEAN NOT NULL DEFAULT FALSE,
        payload JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS probe_data_probe_idx
        ON probe_data (workspace_id, probe_id, created_at)",
    "CREATE INDEX IF NOT EXISTS probe_data_agent_kind_idx
        ON probe_data (workspace_id, agent_id, kind, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS probe_data_day_idx ON probe_data ((created_at::date))",
];

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Viewer => "VIEWER",
        Role::User => "USER",
        Role::Admin => "ADMIN",
        Role::Owner => "OWNER",
    }
}

fn parse_role(s: &str) -> StoreResult<Role> {
    match s {
        "VIEWER" => Ok(Role::Viewer),
        "USER" => Ok(Role::User),
        "ADMIN" => Ok(Role::Admin),
        "OWNER" => Ok(Role::Owner),
        other => Err(StoreError::Unavailable(format!("unknown role {other:?}"))),
    }
}

fn site_role_str(role: SiteRole) -> &'static str {
    match role {
        SiteRole::Viewer => "VIEWER",
        SiteRole::User => "USER",
        SiteRole::SiteAdmin => "SITE_ADMIN",
    }
}

fn parse_site_role(s: &str) -> StoreResult<SiteRole> {
    match s {
        "VIEWER" => Ok(SiteRole::Viewer),
        "USER" => Ok(SiteRole::User),
        "SITE_ADMIN" => Ok(SiteRole::SiteAdmin),
        other => Err(StoreError::Unavailable(format!(
            "unknown site role {other:?}"
        ))),
    }
}

fn probe_type_str(kind: ProbeType) -> &'static str {
    match kind {
        ProbeType::Ping => "PING",
        ProbeType::Mtr => "MTR",
        ProbeType::Speedtest => "SPEEDTEST",
        ProbeType::SpeedtestServers => "SPEEDTEST_SERVERS",
        ProbeType::Netinfo => "NETINFO",
        ProbeType::Sysinfo => "SYSINFO",
        ProbeType::Trafficsim => "TRAFFICSIM",
    }
}

fn parse_probe_type(s: &str) -> StoreResult<ProbeType> {
    match s {
        "PING" => Ok(ProbeType::Ping),
        "MTR" => Ok(ProbeType::Mtr),
        "SPEEDTEST" => Ok(ProbeType::Speedtest),
        "SPEEDTEST_SERVERS" => Ok(ProbeType::SpeedtestServers),
        "NETINFO" => Ok(ProbeType::Netinfo),
        "SYSINFO" => Ok(ProbeType::Sysinfo),
        "TRAFFICSIM" => Ok(ProbeType::Trafficsim),
        other => Err(StoreError::Unavailable(format!(
            "unknown probe type {other:?}"
        ))),
    }
}

fn queue_status_str(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Pending => "pending",
        QueueStatus::InFlight => "in_flight",
        QueueStatus::Completed => "completed",
        QueueStatus::Expired => "expired",
    }
}

fn parse_queue_status(s: &str) -> StoreResult<QueueStatus> {
    match s {
        "pending" => Ok(QueueStatus::Pending),
        "in_flight" => Ok(QueueStatus::InFlight),
        "completed" => Ok(QueueStatus::Completed),
        "expired" => Ok(QueueStatus::Expired),
        other => Err(StoreError::Unavailable(format!(
            "unknown queue status {other:?}"
        ))),
    }
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: parse_site_role(row.try_get::<String, _>("role")?.as_str())?,
        verified: row.try_get("verified")?,
        created_at: row.try_get("created_at")?,
    })
}

fn agent_from_row(row: &PgRow) -> StoreResult<Agent> {
    Ok(Agent {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        psk_hash: row.try_get("psk_hash")?,
        public_ip_override: row.try_get("public_ip_override")?,
        last_seen_at: row.try_get("last_seen_at")?,
        version: row.try_get("version")?,
    })
}

fn probe_from_row(row: &PgRow) -> StoreResult<Probe> {
    Ok(Probe {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        agent_id: row.try_get("agent_id")?,
        kind: parse_probe_type(row.try_get::<String, _>("kind")?.as_str())?,
        interval_sec: row.try_get::<i32, _>("interval_sec")? as u32,
        count: row.try_get::<i32, _>("count")? as u32,
        duration: row.try_get::<i32, _>("duration")? as u32,
        server: row.try_get("server")?,
        enabled: row.try_get("enabled")?,
        targets: Vec::new(),
        created_at: row.try_get("created_at")?,
        pending: row.try_get("pending")?,
    })
}

fn session_from_row(row: &PgRow) -> StoreResult<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        is_agent: row.try_get("is_agent")?,
        share_link_id: row.try_get("share_link_id")?,
        created: row.try_get("created")?,
        expiry: row.try_get("expiry")?,
        ws_connection_id: row.try_get("ws_connection_id")?,
        ip: row.try_get("ip")?,
    })
}

fn share_link_from_row(row: &PgRow) -> StoreResult<ShareLink> {
    Ok(ShareLink {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        workspace_id: row.try_get("workspace_id")?,
        agent_id: row.try_get("agent_id")?,
        probe_id: row.try_get("probe_id")?,
        password_hash: row.try_get("password_hash")?,
        expires_at: row.try_get("expires_at")?,
        allow_speedtest: row.try_get("allow_speedtest")?,
        created_at: row.try_get("created_at")?,
    })
}

fn queue_item_from_row(row: &PgRow) -> StoreResult<SpeedtestQueueItem> {
    Ok(SpeedtestQueueItem {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        requester_user_id: row.try_get("requester_user_id")?,
        status: parse_queue_status(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        result_ref: row.try_get("result_ref")?,
    })
}

fn sample_from_row(row: &PgRow) -> StoreResult<ProbeSample> {
    Ok(ProbeSample {
        workspace_id: row.try_get("workspace_id")?,
        probe_id: row.try_get("probe_id")?,
        agent_id: row.try_get("agent_id")?,
        target_agent_id: row.try_get("target_agent_id")?,
        kind: parse_probe_type(row.try_get::<String, _>("kind")?.as_str())?,
        created_at: row.try_get("created_at")?,
        target: row.try_get("target")?,
        triggered: row.try_get("triggered")?,
        payload: row.try_get("payload")?,
    })
}

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run schema bootstrap. Statements are idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn load_targets(&self, probe_id: i64) -> StoreResult<Vec<ProbeTarget>> {
        let rows = sqlx::query(
            "SELECT target, agent_id, group_id FROM probe_targets
             WHERE probe_id = $1 ORDER BY position",
        )
        .bind(probe_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ProbeTarget {
                    target: row.try_get("target")?,
                    agent_id: row.try_get("agent_id")?,
                    group_id: row.try_get("group_id")?,
                })
            })
            .collect()
    }

    async fn hydrate_probes(&self, rows: Vec<PgRow>) -> StoreResult<Vec<Probe>> {
        let mut probes = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut probe = probe_from_row(row)?;
            probe.targets = self.load_targets(probe.id).await?;
            probes.push(probe);
        }
        Ok(probes)
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn insert_user(&self, user: User) -> StoreResult<User> {
        let row = sqlx::query(
            "INSERT INTO users (email, password_hash, role, verified, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, email, password_hash, role, verified, created_at",
        )
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(site_role_str(user.role))
        .bind(user.verified)
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, role, verified, created_at
             FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, role, verified, created_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_workspace(&self, workspace: Workspace) -> StoreResult<Workspace> {
        let row = sqlx::query(
            "INSERT INTO workspaces (name, owner_user_id) VALUES ($1, $2)
             RETURNING id, name, owner_user_id",
        )
        .bind(&workspace.name)
        .bind(workspace.owner_user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Workspace {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_user_id: row.try_get("owner_user_id")?,
        })
    }

    async fn insert_member(&self, member: WorkspaceMember) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workspace_members (workspace_id, user_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(member.workspace_id)
        .bind(member.user_id)
        .bind(role_str(member.role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn workspace_role(&self, workspace_id: i64, user_id: i64) -> StoreResult<Option<Role>> {
        let row = sqlx::query(
            "SELECT role FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_role(r.try_get::<String, _>("role")?.as_str()))
            .transpose()
    }

    async fn insert_agent(&self, agent: Agent) -> StoreResult<Agent> {
        let row = sqlx::query(
            "INSERT INTO agents (workspace_id, name, psk_hash, public_ip_override, version)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, workspace_id, name, psk_hash, public_ip_override, last_seen_at, version",
        )
        .bind(agent.workspace_id)
        .bind(&agent.name)
        .bind(&agent.psk_hash)
        .bind(&agent.public_ip_override)
        .bind(&agent.version)
        .fetch_one(&self.pool)
        .await?;
        agent_from_row(&row)
    }

    async fn agent_by_id(&self, id: i64) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, psk_hash, public_ip_override, last_seen_at, version
             FROM agents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn agents_in_workspace(&self, workspace_id: i64) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, name, psk_hash, public_ip_override, last_seen_at, version
             FROM agents WHERE workspace_id = $1 ORDER BY id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn set_agent_psk_hash(&self, agent_id: i64, hash: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET psk_hash = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("no such agent".into()));
        }
        Ok(())
    }

    async fn set_agent_version(&self, agent_id: i64, version: &str) -> StoreResult<()> {
        sqlx::query("UPDATE agents SET version = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_agent(&self, agent_id: i64, seen_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE agents
             SET last_seen_at = GREATEST(COALESCE(last_seen_at, 'epoch'::timestamptz), $2)
             WHERE id = $1",
        )
        .bind(agent_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM probe_data WHERE probe_id IN (SELECT id FROM probes WHERE agent_id = $1)",
        )
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM probes WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agent_pins WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_pin(&self, pin: AgentPin) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_pins (agent_id, pin_hash, consumed, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (agent_id) DO UPDATE
             SET pin_hash = EXCLUDED.pin_hash, consumed = EXCLUDED.consumed",
        )
        .bind(pin.agent_id)
        .bind(&pin.pin_hash)
        .bind(pin.consumed)
        .bind(pin.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pin_for_agent(&self, agent_id: i64) -> StoreResult<Option<AgentPin>> {
        let row = sqlx::query(
            "SELECT agent_id, pin_hash, consumed, created_at FROM agent_pins WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(AgentPin {
                agent_id: r.try_get("agent_id")?,
                pin_hash: r.try_get("pin_hash")?,
                consumed: r.try_get("consumed")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn consume_pin(&self, agent_id: i64) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE agent_pins SET consumed = TRUE WHERE agent_id = $1 AND NOT consumed")
                .bind(agent_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("pin already consumed".into()));
        }
        Ok(())
    }

    async fn insert_probe(&self, probe: Probe) -> StoreResult<Probe> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO probes
                 (workspace_id, agent_id, kind, interval_sec, count, duration,
                  server, enabled, created_at, pending)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id, workspace_id, agent_id, kind, interval_sec, count, duration,
                       server, enabled, created_at, pending",
        )
        .bind(probe.workspace_id)
        .bind(probe.agent_id)
        .bind(probe_type_str(probe.kind))
        .bind(probe.interval_sec as i32)
        .bind(probe.count as i32)
        .bind(probe.duration as i32)
        .bind(probe.server)
        .bind(probe.enabled)
        .bind(probe.created_at)
        .bind(probe.pending)
        .fetch_one(&mut *tx)
        .await?;
        let mut inserted = probe_from_row(&row)?;
        for (position, target) in probe.targets.iter().enumerate() {
            sqlx::query(
                "INSERT INTO probe_targets (probe_id, position, target, agent_id, group_id)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(inserted.id)
            .bind(position as i32)
            .bind(&target.target)
            .bind(target.agent_id)
            .bind(target.group_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        inserted.targets = probe.targets;
        Ok(inserted)
    }

    async fn probe_by_id(&self, id: i64) -> StoreResult<Option<Probe>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, agent_id, kind, interval_sec, count, duration,
                    server, enabled, created_at, pending
             FROM probes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let mut probe = probe_from_row(&row)?;
                probe.targets = self.load_targets(probe.id).await?;
                Ok(Some(probe))
            }
            None => Ok(None),
        }
    }

    async fn probes_for_agent(&self, agent_id: i64) -> StoreResult<Vec<Probe>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, agent_id, kind, interval_sec, count, duration,
                    server, enabled, created_at, pending
             FROM probes WHERE agent_id = $1 ORDER BY id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_probes(rows).await
    }

    async fn server_probes_for_agent(
        &self,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, agent_id, kind, interval_sec, count, duration,
                    server, enabled, created_at, pending
             FROM probes
             WHERE agent_id = $1 AND kind = $2 AND server
             ORDER BY created_at, id",
        )
        .bind(agent_id)
        .bind(probe_type_str(kind))
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_probes(rows).await
    }

    async fn client_probes_of_server(
        &self,
        workspace_id: i64,
        server_agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>> {
        let rows = sqlx::query(
            "SELECT p.id, p.workspace_id, p.agent_id, p.kind, p.interval_sec, p.count,
                    p.duration, p.server, p.enabled, p.created_at, p.pending
             FROM probes p
             JOIN probe_targets t ON t.probe_id = p.id AND t.position = 0
             WHERE p.workspace_id = $1 AND p.kind = $2 AND NOT p.server AND t.agent_id = $3
             ORDER BY p.created_at, p.id",
        )
        .bind(workspace_id)
        .bind(probe_type_str(kind))
        .bind(server_agent_id)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_probes(rows).await
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        let row = sqlx::query(
            "INSERT INTO sessions
                 (item_id, is_agent, share_link_id, created, expiry, ws_connection_id, ip)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, item_id, is_agent, share_link_id, created, expiry,
                       ws_connection_id, ip",
        )
        .bind(session.item_id)
        .bind(session.is_agent)
        .bind(session.share_link_id)
        .bind(session.created)
        .bind(session.expiry)
        .bind(&session.ws_connection_id)
        .bind(&session.ip)
        .fetch_one(&self.pool)
        .await?;
        session_from_row(&row)
    }

    async fn session_by_id(&self, id: i64) -> StoreResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, item_id, is_agent, share_link_id, created, expiry,
                    ws_connection_id, ip
             FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn extend_session(&self, id: i64, expiry: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET expiry = GREATEST(expiry, $2) WHERE id = $1")
            .bind(id)
            .bind(expiry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_connection(&self, id: i64, conn_id: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET ws_connection_id = $2 WHERE id = $1")
            .bind(id)
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expiry <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_share_link(&self, link: ShareLink) -> StoreResult<ShareLink> {
        let row = sqlx::query(
            "INSERT INTO share_links
                 (token, workspace_id, agent_id, probe_id, password_hash, expires_at,
                  allow_speedtest, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id, token, workspace_id, agent_id, probe_id, password_hash,
                       expires_at, allow_speedtest, created_at",
        )
        .bind(&link.token)
        .bind(link.workspace_id)
        .bind(link.agent_id)
        .bind(link.probe_id)
        .bind(&link.password_hash)
        .bind(link.expires_at)
        .bind(link.allow_speedtest)
        .bind(link.created_at)
        .fetch_one(&self.pool)
        .await?;
        share_link_from_row(&row)
    }

    async fn share_link_by_token(&self, token: &str) -> StoreResult<Option<ShareLink>> {
        let row = sqlx::query(
            "SELECT id, token, workspace_id, agent_id, probe_id, password_hash,
                    expires_at, allow_speedtest, created_at
             FROM share_links WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(share_link_from_row).transpose()
    }

    async fn share_link_by_id(&self, id: i64) -> StoreResult<Option<ShareLink>> {
        let row = sqlx::query(
            "SELECT id, token, workspace_id, agent_id, probe_id, password_hash,
                    expires_at, allow_speedtest, created_at
             FROM share_links WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(share_link_from_row).transpose()
    }

    async fn delete_share_link(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM share_links WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queue_insert(&self, item: SpeedtestQueueItem) -> StoreResult<SpeedtestQueueItem> {
        let row = sqlx::query(
            "INSERT INTO speedtest_queue
                 (agent_id, requester_user_id, status, created_at, expires_at, result_ref)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, agent_id, requester_user_id, status, created_at, expires_at,
                       result_ref",
        )
        .bind(item.agent_id)
        .bind(item.requester_user_id)
        .bind(queue_status_str(item.status))
        .bind(item.created_at)
        .bind(item.expires_at)
        .bind(&item.result_ref)
        .fetch_one(&self.pool)
        .await?;
        queue_item_from_row(&row)
    }

    async fn queue_item(&self, id: i64) -> StoreResult<Option<SpeedtestQueueItem>> {
        let row = sqlx::query(
            "SELECT id, agent_id, requester_user_id, status, created_at, expires_at, result_ref
             FROM speedtest_queue WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn queue_items_for_agent(&self, agent_id: i64) -> StoreResult<Vec<SpeedtestQueueItem>> {
        let rows = sqlx::query(
            "SELECT id, agent_id, requester_user_id, status, created_at, expires_at, result_ref
             FROM speedtest_queue WHERE agent_id = $1 ORDER BY id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_item_from_row).collect()
    }

    async fn queue_update_status(
        &self,
        id: i64,
        status: QueueStatus,
        result_ref: Option<String>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE speedtest_queue
             SET status = $2, result_ref = COALESCE($3, result_ref)
             WHERE id = $1",
        )
        .bind(id)
        .bind(queue_status_str(status))
        .bind(result_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("no such queue item".into()));
        }
        Ok(())
    }

    async fn queue_expire_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<SpeedtestQueueItem>> {
        let rows = sqlx::query(
            "UPDATE speedtest_queue
             SET status = 'expired'
             WHERE status IN ('pending', 'in_flight') AND expires_at <= $1
             RETURNING id, agent_id, requester_user_id, status, created_at, expires_at,
                       result_ref",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_item_from_row).collect()
    }
}

#[derive(Clone)]
pub struct PgTimeSeriesStore {
    pool: PgPool,
}

impl PgTimeSeriesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimeSeriesStore for PgTimeSeriesStore {
    async fn append(&self, sample: &ProbeSample) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO probe_data
                 (workspace_id, probe_id, agent_id, target_agent_id, kind, created_at,
                  target, triggered, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(sample.workspace_id)
        .bind(sample.probe_id)
        .bind(sample.agent_id)
        .bind(sample.target_agent_id)
        .bind(probe_type_str(sample.kind))
        .bind(sample.created_at)
        .bind(&sample.target)
        .bind(sample.triggered)
        .bind(&sample.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_for_agent(
        &self,
        workspace_id: i64,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Option<ProbeSample>> {
        let row = sqlx::query(
            "SELECT workspace_id, probe_id, agent_id, target_agent_id, kind, created_at,
                    target, triggered, payload
             FROM probe_data
             WHERE workspace_id = $1 AND agent_id = $2 AND kind = $3
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(workspace_id)
        .bind(agent_id)
        .bind(probe_type_str(kind))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sample_from_row).transpose()
    }

    async fn range(
        &self,
        workspace_id: i64,
        probe_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ProbeSample>> {
        let rows = sqlx::query(
            "SELECT workspace_id, probe_id, agent_id, target_agent_id, kind, created_at,
                    target, triggered, payload
             FROM probe_data
             WHERE workspace_id = $1 AND probe_id = $2 AND created_at >= $3 AND created_at < $4
             ORDER BY created_at LIMIT $5",
        )
        .bind(workspace_id)
        .bind(probe_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sample_from_row).collect()
    }
}
