//! In-memory store implementations.
//!
//! Used when no database DSN is configured and by the test suite. All state
//! lives behind a single `RwLock`; every operation is a short critical
//! section with no awaits while locked.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use netwatch_protocol::{
    Agent, AgentPin, Probe, ProbeSample, ProbeType, QueueStatus, Role, Session, ShareLink,
    SpeedtestQueueItem, User, Workspace, WorkspaceMember,
};

use super::{IdentityStore, StoreError, StoreResult, TimeSeriesStore};

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    workspaces: HashMap<i64, Workspace>,
    members: Vec<WorkspaceMember>,
    agents: HashMap<i64, Agent>,
    pins: HashMap<i64, AgentPin>,
    probes: HashMap<i64, Probe>,
    sessions: HashMap<i64, Session>,
    share_links: HashMap<i64, ShareLink>,
    queue: HashMap<i64, SpeedtestQueueItem>,
    next_id: i64,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    tables: RwLock<Tables>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn insert_user(&self, mut user: User) -> StoreResult<User> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if t.users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict("duplicate email".into()));
        }
        if user.id == 0 {
            user.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(user.id);
        }
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn user_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.users.get(&id).cloned())
    }

    async fn insert_workspace(&self, mut workspace: Workspace) -> StoreResult<Workspace> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if workspace.id == 0 {
            workspace.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(workspace.id);
        }
        t.workspaces.insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    async fn insert_member(&self, member: WorkspaceMember) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        // Exactly one active OWNER per workspace
        if member.role == Role::Owner
            && t.members
                .iter()
                .any(|m| m.workspace_id == member.workspace_id && m.role == Role::Owner)
        {
            return Err(StoreError::Conflict("workspace already has an owner".into()));
        }
        t.members
            .retain(|m| !(m.workspace_id == member.workspace_id && m.user_id == member.user_id));
        t.members.push(member);
        Ok(())
    }

    async fn workspace_role(&self, workspace_id: i64, user_id: i64) -> StoreResult<Option<Role>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.members
            .iter()
            .find(|m| m.workspace_id == workspace_id && m.user_id == user_id)
            .map(|m| m.role))
    }

    async fn insert_agent(&self, mut agent: Agent) -> StoreResult<Agent> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if agent.id == 0 {
            agent.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(agent.id);
        }
        t.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn agent_by_id(&self, id: i64) -> StoreResult<Option<Agent>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.agents.get(&id).cloned())
    }

    async fn agents_in_workspace(&self, workspace_id: i64) -> StoreResult<Vec<Agent>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<Agent> = t
            .agents
            .values()
            .filter(|a| a.workspace_id == workspace_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }

    async fn set_agent_psk_hash(&self, agent_id: i64, hash: &str) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match t.agents.get_mut(&agent_id) {
            Some(agent) => {
                agent.psk_hash = Some(hash.to_string());
                Ok(())
            }
            None => Err(StoreError::Conflict("no such agent".into())),
        }
    }

    async fn set_agent_version(&self, agent_id: i64, version: &str) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = t.agents.get_mut(&agent_id) {
            agent.version = Some(version.to_string());
        }
        Ok(())
    }

    async fn touch_agent(&self, agent_id: i64, seen_at: DateTime<Utc>) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = t.agents.get_mut(&agent_id)
            && agent.last_seen_at.is_none_or(|prev| prev < seen_at)
        {
            agent.last_seen_at = Some(seen_at);
        }
        Ok(())
    }

    async fn delete_agent(&self, agent_id: i64) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        t.agents.remove(&agent_id);
        t.pins.remove(&agent_id);
        t.probes.retain(|_, p| p.agent_id != agent_id);
        Ok(())
    }

    async fn insert_pin(&self, pin: AgentPin) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        t.pins.insert(pin.agent_id, pin);
        Ok(())
    }

    async fn pin_for_agent(&self, agent_id: i64) -> StoreResult<Option<AgentPin>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.pins.get(&agent_id).cloned())
    }

    async fn consume_pin(&self, agent_id: i64) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match t.pins.get_mut(&agent_id) {
            Some(pin) if !pin.consumed => {
                pin.consumed = true;
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict("pin already consumed".into())),
            None => Err(StoreError::Conflict("no such pin".into())),
        }
    }

    async fn insert_probe(&self, mut probe: Probe) -> StoreResult<Probe> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if probe.id == 0 {
            probe.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(probe.id);
        }
        t.probes.insert(probe.id, probe.clone());
        Ok(probe)
    }

    async fn probe_by_id(&self, id: i64) -> StoreResult<Option<Probe>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.probes.get(&id).cloned())
    }

    async fn probes_for_agent(&self, agent_id: i64) -> StoreResult<Vec<Probe>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut probes: Vec<Probe> = t
            .probes
            .values()
            .filter(|p| p.agent_id == agent_id)
            .cloned()
            .collect();
        probes.sort_by_key(|p| p.id);
        Ok(probes)
    }

    async fn server_probes_for_agent(
        &self,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut probes: Vec<Probe> = t
            .probes
            .values()
            .filter(|p| p.agent_id == agent_id && p.kind == kind && p.server)
            .cloned()
            .collect();
        probes.sort_by_key(|p| (p.created_at, p.id));
        Ok(probes)
    }

    async fn client_probes_of_server(
        &self,
        workspace_id: i64,
        server_agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Vec<Probe>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut probes: Vec<Probe> = t
            .probes
            .values()
            .filter(|p| {
                p.workspace_id == workspace_id
                    && p.kind == kind
                    && !p.server
                    && p.targets
                        .first()
                        .is_some_and(|t| t.agent_id == Some(server_agent_id))
            })
            .cloned()
            .collect();
        probes.sort_by_key(|p| (p.created_at, p.id));
        Ok(probes)
    }

    async fn insert_session(&self, mut session: Session) -> StoreResult<Session> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if session.id == 0 {
            session.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(session.id);
        }
        t.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn session_by_id(&self, id: i64) -> StoreResult<Option<Session>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.sessions.get(&id).cloned())
    }

    async fn extend_session(&self, id: i64, expiry: DateTime<Utc>) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = t.sessions.get_mut(&id)
            && session.expiry < expiry
        {
            session.expiry = expiry;
        }
        Ok(())
    }

    async fn set_session_connection(&self, id: i64, conn_id: Option<&str>) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = t.sessions.get_mut(&id) {
            session.ws_connection_id = conn_id.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        t.sessions.remove(&id);
        Ok(())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let before = t.sessions.len();
        t.sessions.retain(|_, s| s.expiry > now);
        Ok((before - t.sessions.len()) as u64)
    }

    async fn insert_share_link(&self, mut link: ShareLink) -> StoreResult<ShareLink> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if t.share_links.values().any(|l| l.token == link.token) {
            return Err(StoreError::Conflict("duplicate share token".into()));
        }
        if link.id == 0 {
            link.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(link.id);
        }
        t.share_links.insert(link.id, link.clone());
        Ok(link)
    }

    async fn share_link_by_token(&self, token: &str) -> StoreResult<Option<ShareLink>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.share_links.values().find(|l| l.token == token).cloned())
    }

    async fn share_link_by_id(&self, id: i64) -> StoreResult<Option<ShareLink>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.share_links.get(&id).cloned())
    }

    async fn delete_share_link(&self, id: i64) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        t.share_links.remove(&id);
        Ok(())
    }

    async fn queue_insert(&self, mut item: SpeedtestQueueItem) -> StoreResult<SpeedtestQueueItem> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if item.id == 0 {
            item.id = t.allocate_id();
        } else {
            t.next_id = t.next_id.max(item.id);
        }
        t.queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn queue_item(&self, id: i64) -> StoreResult<Option<SpeedtestQueueItem>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(t.queue.get(&id).cloned())
    }

    async fn queue_items_for_agent(&self, agent_id: i64) -> StoreResult<Vec<SpeedtestQueueItem>> {
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<SpeedtestQueueItem> = t
            .queue
            .values()
            .filter(|i| i.agent_id == agent_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn queue_update_status(
        &self,
        id: i64,
        status: QueueStatus,
        result_ref: Option<String>,
    ) -> StoreResult<()> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match t.queue.get_mut(&id) {
            Some(item) => {
                item.status = status;
                if result_ref.is_some() {
                    item.result_ref = result_ref;
                }
                Ok(())
            }
            None => Err(StoreError::Conflict("no such queue item".into())),
        }
    }

    async fn queue_expire_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<SpeedtestQueueItem>> {
        let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();
        for item in t.queue.values_mut() {
            if matches!(item.status, QueueStatus::Pending | QueueStatus::InFlight)
                && item.expires_at <= now
            {
                item.status = QueueStatus::Expired;
                expired.push(item.clone());
            }
        }
        expired.sort_by_key(|i| i.id);
        Ok(expired)
    }
}

#[derive(Default)]
pub struct MemoryTimeSeriesStore {
    samples: RwLock<Vec<ProbeSample>>,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn append(&self, sample: &ProbeSample) -> StoreResult<()> {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.push(sample.clone());
        Ok(())
    }

    async fn latest_for_agent(
        &self,
        workspace_id: i64,
        agent_id: i64,
        kind: ProbeType,
    ) -> StoreResult<Option<ProbeSample>> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        Ok(samples
            .iter()
            .filter(|s| {
                s.workspace_id == workspace_id && s.agent_id == agent_id && s.kind == kind
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn range(
        &self,
        workspace_id: i64,
        probe_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ProbeSample>> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<ProbeSample> = samples
            .iter()
            .filter(|s| {
                s.workspace_id == workspace_id
                    && s.probe_id == probe_id
                    && s.created_at >= from
                    && s.created_at < to
            })
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}
