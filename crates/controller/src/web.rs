use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tower_http::limit::RequestBodyLimitLayer;

use netwatch_protocol::{
    Agent, AgentFrame, ControllerConfig, ControllerFrame, PanelFrame, Probe, Role, Session,
    ShareLink, SubscriberFrame,
};

use crate::auth::AuthService;
use crate::error::Error;
use crate::hub::agents::{AgentConnection, AgentHub};
use crate::hub::subscribers::{BroadcastHub, Filter, SubscriberScope};
use crate::hub::{CloseReason, ConnectionKick};
use crate::ingest::IngestPipeline;
use crate::queue::SpeedtestQueue;
use crate::resolver::ProbeResolver;
use crate::store::IdentityStore;

/// Shared application state. All services are created once at startup and
/// injected here; nothing lives in package-level mutable state.
pub struct AppState {
    pub config: ControllerConfig,
    pub identity: Arc<dyn IdentityStore>,
    pub auth: AuthService,
    pub resolver: ProbeResolver,
    pub ingest: IngestPipeline,
    pub queue: SpeedtestQueue,
    pub agents: AgentHub,
    pub broadcast: Arc<BroadcastHub>,
    pub login_limiter: LoginRateLimiter,
    pub started_at: std::time::Instant,
}

/// Simple per-key rate limiter for login attempts.
/// Allows at most `max_attempts` in `window_secs`.
/// Bounded to prevent memory exhaustion from enumeration attacks; expired
/// entries are pruned every `ttl_cleanup_interval` calls to `check()`.
pub struct LoginRateLimiter {
    attempts: std::sync::Mutex<std::collections::HashMap<String, Vec<std::time::Instant>>>,
    max_attempts: usize,
    window: std::time::Duration,
    max_keys: usize,
    call_count: std::sync::atomic::AtomicU64,
    ttl_cleanup_interval: u64,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
            max_attempts,
            window: std::time::Duration::from_secs(window_secs),
            max_keys: 10_000,
            call_count: std::sync::atomic::AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    /// Check if a login attempt from this key is allowed.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();

        let count = self
            .call_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count % self.ttl_cleanup_interval == 0 || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_k, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }

    /// Clear rate limit entries for a key (e.g., after successful login).
    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/agent/bootstrap", post(agent_bootstrap))
        .route("/api/share/{token}", get(share_info))
        .route("/api/share/{token}/agent", post(share_agent))
        .route("/api/agents/{id}/speedtest", post(request_speedtest))
        .route("/api/health", get(health_check))
        .route("/ws/agent", get(agent_ws_upgrade))
        .route("/ws/subscribe", get(subscriber_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
}

/// Query parameters accepted on WebSocket upgrades and token-bearing routes.
#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Extract a bearer token from the Authorization header or `token` query
/// parameter. The header wins when both are present.
fn bearer_from(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.token.clone())
}

/// Best-effort client IP for session records and audit logs.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Login request. Password is redacted in Debug output to prevent accidental
/// logging.
#[derive(Serialize, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// POST /api/auth/login
async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, Error> {
    let email = req.email.trim();
    if email.is_empty() || email.len() > 254 || !email.contains('@') {
        return Err(Error::validation("email", "not an email address"));
    }

    if !state.login_limiter.check(email) {
        tracing::warn!(target: "audit", event = "rate_limited", "Login rate limit exceeded");
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate_limited", "message": "Too many login attempts" })),
        )
            .into_response());
    }

    let ip = client_ip(&headers);
    match state.auth.login_user(email, &req.password, &ip).await {
        Ok((token, user)) => {
            state.login_limiter.clear(email);
            Ok(Json(json!({ "token": token, "user": user })).into_response())
        }
        Err(err) => {
            tracing::info!(target: "audit", event = "login_failure", %ip, "Login failed");
            Err(err)
        }
    }
}

/// POST /api/auth/logout
///
/// Destroys the bearer's session; the token is dead afterwards even though
/// its signature would still verify.
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, Error> {
    let bearer = bearer_from(&headers, &query).ok_or(Error::TokenInvalid)?;
    let session = state.auth.resolve_token(&bearer).await?;
    state.auth.logout(&session).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Serialize, Deserialize)]
struct BootstrapRequest {
    agent_id: i64,
    pin: String,
}

impl std::fmt::Debug for BootstrapRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapRequest")
            .field("agent_id", &self.agent_id)
            .field("pin", &"[REDACTED]")
            .finish()
    }
}

/// POST /api/agent/bootstrap
///
/// One-shot PIN → PSK exchange. The plaintext PSK appears in this response
/// and nowhere else.
async fn agent_bootstrap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BootstrapRequest>,
) -> Result<impl IntoResponse, Error> {
    let ip = client_ip(&headers);
    let (psk, agent) = state.auth.agent_bootstrap(req.agent_id, &req.pin, &ip).await?;
    Ok(Json(json!({ "psk": psk, "agent": agent })))
}

/// GET /api/share/{token}
///
/// Public metadata about a share link, safe to expose before the password
/// gate.
async fn share_info(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let link = state
        .identity
        .share_link_by_token(&token)
        .await?
        .ok_or(Error::NotFound("share link"))?;
    Ok(Json(json!({
        "has_password": link.password_hash.is_some(),
        "expired": link.is_expired(chrono::Utc::now()),
        "expires_at": link.expires_at,
        "allow_speedtest": link.allow_speedtest,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct SharePasswordBody {
    password: Option<String>,
}

/// POST /api/share/{token}/agent
///
/// Password-gated snapshot of the link's scope plus a share-scoped bearer for
/// the subscriber stream.
async fn share_agent(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Option<Json<SharePasswordBody>>,
) -> Result<impl IntoResponse, Error> {
    let password = body.and_then(|Json(b)| b.password);
    let link = state
        .auth
        .resolve_share_token(&token, password.as_deref())
        .await?;

    let ip = client_ip(&headers);
    let (bearer, _session) = state.auth.share_session(&link, &ip).await?;

    let (agents, probes) = share_snapshot(&state, &link).await?;
    Ok(Json(json!({
        "token": bearer,
        "workspace_id": link.workspace_id,
        "agents": agents,
        "probes": probes,
        "allow_speedtest": link.allow_speedtest,
    })))
}

/// Materialize the agents and probe definitions a share link exposes.
async fn share_snapshot(
    state: &AppState,
    link: &ShareLink,
) -> Result<(Vec<Agent>, Vec<Probe>), Error> {
    if let Some(probe_id) = link.probe_id {
        let probe = state
            .identity
            .probe_by_id(probe_id)
            .await?
            .filter(|p| p.workspace_id == link.workspace_id)
            .ok_or(Error::NotFound("probe"))?;
        let agent = state
            .identity
            .agent_by_id(probe.agent_id)
            .await?
            .ok_or(Error::NotFound("agent"))?;
        return Ok((vec![agent], vec![probe]));
    }
    if let Some(agent_id) = link.agent_id {
        let agent = state
            .identity
            .agent_by_id(agent_id)
            .await?
            .filter(|a| a.workspace_id == link.workspace_id)
            .ok_or(Error::NotFound("agent"))?;
        let probes = state.identity.probes_for_agent(agent_id).await?;
        return Ok((vec![agent], probes));
    }
    let agents = state.identity.agents_in_workspace(link.workspace_id).await?;
    let mut probes = Vec::new();
    for agent in &agents {
        probes.extend(state.identity.probes_for_agent(agent.id).await?);
    }
    Ok((agents, probes))
}

/// POST /api/agents/{id}/speedtest
///
/// Enqueue a one-shot speedtest for the agent; delivered immediately when the
/// agent is connected and idle.
async fn request_speedtest(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, Error> {
    let bearer = bearer_from(&headers, &query).ok_or(Error::TokenInvalid)?;
    let session = state.auth.resolve_token(&bearer).await?;
    let agent = state
        .identity
        .agent_by_id(agent_id)
        .await?
        .ok_or(Error::NotFound("agent"))?;

    let requester = if let Some(link_id) = session.share_link_id {
        let link = state
            .identity
            .share_link_by_id(link_id)
            .await?
            .ok_or(Error::Forbidden)?;
        let in_scope = link.workspace_id == agent.workspace_id
            && link.agent_id.is_none_or(|a| a == agent.id);
        if link.is_expired(chrono::Utc::now()) || !link.allow_speedtest || !in_scope {
            return Err(Error::Forbidden);
        }
        0
    } else {
        state
            .auth
            .assert_workspace_role(&session, agent.workspace_id, Role::User)
            .await?;
        session.item_id
    };

    let item = state.queue.enqueue(agent.id, requester).await?;
    deliver_next_speedtest(&state, agent.id).await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "request": item }))))
}

/// GET /api/health
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "agents_connected": state.agents.connected_count().await,
        "subscribers": state.broadcast.subscriber_count().await,
    }))
}

/// Hand the agent's oldest live speedtest request to its connection, if any.
pub(crate) async fn deliver_next_speedtest(state: &AppState, agent_id: i64) {
    if !state.agents.is_connected(agent_id).await {
        return;
    }
    match state.queue.next_for(agent_id).await {
        Ok(Some(item)) => {
            let frame = ControllerFrame::SpeedtestRequest {
                id: item.id,
                options: json!({ "expires_at": item.expires_at }),
            };
            if let Err(e) = state.agents.send(agent_id, frame).await {
                // Stays in flight until the sweep expires it; the agent will
                // be offered the next item on reconnect.
                tracing::warn!(agent_id, item_id = item.id, "Failed to deliver speedtest request: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(agent_id, "Speedtest queue poll failed: {e}"),
    }
}

/// Close an accepted socket with a specific close code. Used when the
/// handshake authenticated but the connection must not proceed.
async fn close_with(mut socket: WebSocket, reason: CloseReason) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code,
            reason: reason.text.into(),
        })))
        .await;
}

/// Writer half of a connection: drains the bounded send queue and emits the
/// close frame when the connection is kicked. No other task writes frames.
async fn connection_writer<T: Serialize>(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<T>,
    kick: Arc<ConnectionKick>,
) {
    loop {
        tokio::select! {
            reason = kick.fired() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: reason.code,
                        reason: reason.text.into(),
                    })))
                    .await;
                break;
            }
            maybe = rx.recv() => {
                let Some(frame) = maybe else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize outbound frame: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// GET /ws/agent: the agent's long-lived session stream.
///
/// Authenticated by `X-Agent-ID` + `X-Agent-PSK` headers; failures close the
/// accepted socket with 4401.
async fn agent_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ip = client_ip(&headers);
    let agent_id = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let psk = headers
        .get("x-agent-psk")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| async move {
        let (agent_id, psk) = match (agent_id, psk) {
            (Some(id), Some(psk)) => (id, psk),
            _ => {
                close_with(socket, CloseReason::UNAUTHORIZED).await;
                return;
            }
        };
        // The PSK check hits the KDF and the store; bound it so a stalled
        // database cannot hold handshakes open
        let authenticated = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            state.auth.agent_authenticate(agent_id, &psk, &ip),
        )
        .await
        .map_err(|_| Error::Timeout)
        .and_then(|r| r);
        match authenticated {
            Ok((session, agent)) => handle_agent_socket(state, socket, session, agent).await,
            Err(e) => {
                tracing::debug!(agent_id, "Agent handshake rejected: {e}");
                close_with(socket, CloseReason::UNAUTHORIZED).await;
            }
        }
    })
}

async fn handle_agent_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    session: Session,
    agent: Agent,
) {
    let conn = state.agents.register(agent.id).await;
    let AgentConnection {
        agent_id,
        conn_id,
        rx,
        kick,
    } = conn;
    tracing::info!(agent_id, %conn_id, "Agent connected");

    if let Err(e) = state
        .identity
        .set_session_connection(session.id, Some(&conn_id.to_string()))
        .await
    {
        tracing::warn!(agent_id, "Failed to record connection id: {e}");
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(connection_writer(sink, rx, Arc::clone(&kick)));

    let read_deadline = std::time::Duration::from_secs(state.config.limits.read_deadline_secs);
    let heartbeat_after = std::time::Duration::from_secs(state.config.limits.heartbeat_secs);
    let mut heartbeat = interval(heartbeat_after);
    heartbeat.tick().await; // consume the immediate first tick
    let mut deadline = Instant::now() + read_deadline;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = kick.fired() => break,
            // A frame must arrive within the read deadline, pongs included
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(agent_id, "Agent read deadline missed, disconnecting");
                break;
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= heartbeat_after {
                    let _ = state.agents.send(agent_id, ControllerFrame::Ping).await;
                }
            }
            maybe = stream.next() => {
                let message = match maybe {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(agent_id, "Agent WebSocket error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline = Instant::now() + read_deadline;
                last_activity = Instant::now();
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => dispatch_agent_frame(&state, &agent, frame).await,
                            Err(e) => {
                                tracing::warn!(agent_id, "Unparseable agent frame: {e}");
                            }
                        }
                    }
                    Message::Close(_) => {
                        tracing::info!(agent_id, "Agent WebSocket closed");
                        break;
                    }
                    // Control pings are answered by the transport; both count
                    // as liveness
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Binary(_) => {
                        tracing::warn!(agent_id, "Unexpected binary frame from agent");
                    }
                }
            }
        }
    }

    state.agents.deregister(agent_id, conn_id).await;
    if let Err(e) = state.identity.set_session_connection(session.id, None).await {
        tracing::debug!(agent_id, "Failed to clear connection id: {e}");
    }
    let _ = writer.await;
    tracing::info!(agent_id, %conn_id, "Agent disconnected");
}

async fn dispatch_agent_frame(state: &Arc<AppState>, agent: &Agent, frame: AgentFrame) {
    match frame {
        AgentFrame::Hello {
            version,
            hostname,
            os,
        } => {
            tracing::info!(agent_id = agent.id, %version, %hostname, %os, "Agent hello");
            if let Err(e) = state.identity.set_agent_version(agent.id, &version).await {
                tracing::warn!(agent_id = agent.id, "Failed to record agent version: {e}");
            }
            deliver_next_speedtest(state, agent.id).await;
        }
        AgentFrame::ProbeGet => {
            match state.resolver.resolve_for_agent(agent).await {
                Ok((probes, warnings)) => {
                    let _ = state
                        .agents
                        .send(agent.id, ControllerFrame::ProbeList { probes, warnings })
                        .await;
                }
                Err(e) => {
                    // The agent retries probe_get on its own schedule
                    tracing::warn!(agent_id = agent.id, "Probe resolution failed: {e}");
                }
            }
            deliver_next_speedtest(state, agent.id).await;
        }
        AgentFrame::ProbePost(envelope) => {
            let reply = state.ingest.ingest(agent, envelope).await;
            let _ = state.agents.send(agent.id, reply).await;
        }
        AgentFrame::SpeedtestDone {
            request_id,
            sample_ref,
        } => {
            if let Err(e) = state.queue.complete(request_id, &sample_ref).await {
                tracing::warn!(agent_id = agent.id, request_id, "Speedtest completion rejected: {e}");
            }
            deliver_next_speedtest(state, agent.id).await;
        }
        AgentFrame::Ping => {
            let _ = state.agents.send(agent.id, ControllerFrame::Pong).await;
        }
        AgentFrame::Pong => {}
    }
}

/// GET /ws/subscribe: panel and share-token subscriber stream.
///
/// Bearer in the Authorization header or `token` query parameter.
async fn subscriber_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bearer = bearer_from(&headers, &query);
    ws.on_upgrade(move |socket| async move {
        let Some(bearer) = bearer else {
            close_with(socket, CloseReason::UNAUTHORIZED).await;
            return;
        };
        match state.auth.resolve_token(&bearer).await {
            Ok(session) if !session.is_agent => {
                handle_subscriber_socket(state, socket, session).await
            }
            _ => close_with(socket, CloseReason::UNAUTHORIZED).await,
        }
    })
}

async fn handle_subscriber_socket(state: Arc<AppState>, socket: WebSocket, session: Session) {
    // Share-scoped sessions carry their link; it bounds every subscription
    let share_link = match session.share_link_id {
        Some(link_id) => match state.identity.share_link_by_id(link_id).await {
            Ok(Some(link)) if !link.is_expired(chrono::Utc::now()) => Some(link),
            _ => {
                close_with(socket, CloseReason::UNAUTHORIZED).await;
                return;
            }
        },
        None => None,
    };

    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<PanelFrame>(state.config.limits.send_queue_depth);
    let kick = Arc::new(ConnectionKick::new());
    let writer = tokio::spawn(connection_writer(sink, out_rx, Arc::clone(&kick)));

    let read_deadline = std::time::Duration::from_secs(state.config.limits.read_deadline_secs);
    let heartbeat_after = std::time::Duration::from_secs(state.config.limits.heartbeat_secs);
    let mut heartbeat = interval(heartbeat_after);
    heartbeat.tick().await;
    let mut deadline = Instant::now() + read_deadline;
    let mut last_activity = Instant::now();
    let mut subscription: Option<u64> = None;

    loop {
        tokio::select! {
            _ = kick.fired() => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(session_id = session.id, "Subscriber read deadline missed");
                break;
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= heartbeat_after
                    && out_tx.try_send(PanelFrame::Ping).is_err()
                {
                    kick.fire(CloseReason::BACKPRESSURE);
                }
            }
            maybe = stream.next() => {
                let message = match maybe {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                deadline = Instant::now() + read_deadline;
                last_activity = Instant::now();
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame = match serde_json::from_str::<SubscriberFrame>(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = out_tx.try_send(PanelFrame::Error {
                            code: "validation".into(),
                            message: format!("unparseable frame: {e}"),
                        });
                        continue;
                    }
                };
                match frame {
                    SubscriberFrame::Subscribe { workspace_id, probe_id } => {
                        let filter = Filter { workspace_id, probe_id };
                        match authorize_subscription(&state, &session, share_link.as_ref(), filter).await {
                            Ok(scope) => {
                                if let Some(old) = subscription.take() {
                                    state.broadcast.unsubscribe(old).await;
                                }
                                let id = state
                                    .broadcast
                                    .subscribe(filter, scope, out_tx.clone(), Arc::clone(&kick))
                                    .await;
                                subscription = Some(id);
                                let _ = out_tx.try_send(PanelFrame::Subscribed {
                                    workspace_id,
                                    probe_id,
                                });
                            }
                            Err(err) => {
                                let _ = out_tx.try_send(PanelFrame::Error {
                                    code: err.code().into(),
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                    SubscriberFrame::Ping => {
                        let _ = out_tx.try_send(PanelFrame::Pong);
                    }
                    SubscriberFrame::Pong => {}
                }
            }
        }
    }

    if let Some(id) = subscription {
        state.broadcast.unsubscribe(id).await;
    }
    drop(out_tx);
    let _ = writer.await;
}

/// Authorize a subscription filter against the session at registration time.
async fn authorize_subscription(
    state: &AppState,
    session: &Session,
    share_link: Option<&ShareLink>,
    filter: Filter,
) -> Result<SubscriberScope, Error> {
    match share_link {
        Some(link) => {
            if link.workspace_id != filter.workspace_id {
                return Err(Error::Forbidden);
            }
            if filter.probe_id != 0
                && let Some(scoped_probe) = link.probe_id
                && scoped_probe != filter.probe_id
            {
                return Err(Error::Forbidden);
            }
            Ok(SubscriberScope::Share {
                link_id: link.id,
                agent_id: link.agent_id,
                probe_id: link.probe_id,
                expires_at: link.expires_at,
            })
        }
        None => {
            state
                .auth
                .assert_workspace_role(session, filter.workspace_id, Role::Viewer)
                .await?;
            Ok(SubscriberScope::User)
        }
    }
}
