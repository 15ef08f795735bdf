//! End-to-end scenarios wiring the full service stack over in-memory stores.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use netwatch_protocol::{
    Agent, AgentPin, ControllerConfig, PanelFrame, Probe, ProbeTarget, ProbeType, QueueStatus,
    Role, SampleEnvelope, ShareLink, SiteRole, User, Workspace, WorkspaceMember,
};

use crate::auth::{hash_pin, hash_secret, AuthService};
use crate::hub::agents::AgentHub;
use crate::hub::subscribers::{BroadcastHub, Filter, SubscriberScope};
use crate::hub::ConnectionKick;
use crate::ingest::IngestPipeline;
use crate::queue::SpeedtestQueue;
use crate::resolver::ProbeResolver;
use crate::store::memory::{MemoryIdentityStore, MemoryTimeSeriesStore};
use crate::store::IdentityStore;
use crate::web::{build_router, AppState, LoginRateLimiter};

const PEPPER: &str = "scenario-pepper";

struct World {
    identity: Arc<MemoryIdentityStore>,
    state: Arc<AppState>,
}

fn world() -> World {
    let identity = Arc::new(MemoryIdentityStore::new());
    let timeseries = Arc::new(MemoryTimeSeriesStore::new());
    let config = ControllerConfig::default();
    let broadcast = Arc::new(BroadcastHub::new(
        identity.clone(),
        config.auth.share_revalidate_secs,
    ));
    let state = Arc::new(AppState {
        auth: AuthService::new(
            identity.clone(),
            "scenario-key".into(),
            PEPPER.into(),
            config.auth.session_ttl_secs,
        ),
        resolver: ProbeResolver::new(
            identity.clone(),
            timeseries.clone(),
            config.database.netinfo_cache_secs,
        ),
        ingest: IngestPipeline::new(
            identity.clone(),
            timeseries.clone(),
            broadcast.clone(),
            config.limits.clock_skew_secs,
        ),
        queue: SpeedtestQueue::new(
            identity.clone(),
            config.limits.speedtest_pending_max,
            config.limits.speedtest_ttl_secs,
        ),
        agents: AgentHub::new(config.limits.send_queue_depth),
        broadcast,
        identity: identity.clone(),
        config,
        login_limiter: LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
    });
    World { identity, state }
}

impl World {
    async fn seed_agent(&self, id: i64, workspace_id: i64) -> Agent {
        self.identity
            .insert_agent(Agent {
                id,
                workspace_id,
                name: format!("agent-{id}"),
                psk_hash: None,
                public_ip_override: None,
                last_seen_at: None,
                version: None,
            })
            .await
            .unwrap()
    }

    async fn seed_pin(&self, agent_id: i64, pin: &str) {
        self.identity
            .insert_pin(AgentPin {
                agent_id,
                pin_hash: hash_pin(PEPPER, pin),
                consumed: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn seed_probe(&self, probe: Probe) -> Probe {
        self.identity.insert_probe(probe).await.unwrap()
    }

    async fn seed_member(&self, workspace_id: i64, email: &str, role: Role) -> (User, String) {
        let user = self
            .identity
            .insert_user(User {
                id: 0,
                email: email.into(),
                password_hash: hash_secret("pw").unwrap(),
                role: SiteRole::User,
                verified: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        self.identity
            .insert_workspace(Workspace {
                id: workspace_id,
                name: format!("ws-{workspace_id}"),
                owner_user_id: user.id,
            })
            .await
            .ok();
        self.identity
            .insert_member(WorkspaceMember {
                workspace_id,
                user_id: user.id,
                role,
            })
            .await
            .unwrap();
        let (token, _) = self
            .state
            .auth
            .login_user(email, "pw", "127.0.0.1")
            .await
            .unwrap();
        (user, token)
    }

    async fn post(&self, uri: &str, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = build_router(Arc::clone(&self.state))
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = build_router(Arc::clone(&self.state))
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

fn ping_probe(id: i64, workspace_id: i64, agent_id: i64, targets: Vec<ProbeTarget>) -> Probe {
    Probe {
        id,
        workspace_id,
        agent_id,
        kind: ProbeType::Ping,
        interval_sec: 60,
        count: 4,
        duration: 0,
        server: false,
        enabled: true,
        targets,
        created_at: Utc::now(),
        pending: None,
    }
}

#[tokio::test]
async fn happy_bootstrap_then_replay_is_claimed() {
    let w = world();
    w.seed_agent(42, 1).await;
    w.seed_pin(42, "036977322").await;

    let (status, body) = w
        .post(
            "/api/agent/bootstrap",
            None,
            json!({ "agent_id": 42, "pin": "036977322" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let psk = body["psk"].as_str().unwrap().to_string();
    assert_eq!(psk.len(), 64);
    assert_eq!(body["agent"]["id"], 42);

    let (status, body) = w
        .post(
            "/api/agent/bootstrap",
            None,
            json!({ "agent_id": 42, "pin": "036977322" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_claimed");

    // The issued PSK authenticates the agent session path
    let (session, _) = w
        .state
        .auth
        .agent_authenticate(42, &psk, "203.0.113.5")
        .await
        .unwrap();
    assert!(session.is_agent);
}

#[tokio::test]
async fn wrong_pin_is_unauthorized() {
    let w = world();
    w.seed_agent(42, 1).await;
    w.seed_pin(42, "036977322").await;

    let (status, body) = w
        .post(
            "/api/agent/bootstrap",
            None,
            json!({ "agent_id": 42, "pin": "999999999" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");
}

#[tokio::test]
async fn login_returns_token_and_user() {
    let w = world();
    let (_, _) = w.seed_member(1, "ops@example.com", Role::Admin).await;

    let (status, body) = w
        .post(
            "/api/auth/login",
            None,
            json!({ "email": "ops@example.com", "password": "pw" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some());
    assert_eq!(body["user"]["email"], "ops@example.com");
    assert!(body["user"].get("password_hash").is_none());

    let (status, body) = w
        .post(
            "/api/auth/login",
            None,
            json!({ "email": "ops@example.com", "password": "nope" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");
}

#[tokio::test]
async fn logout_destroys_the_session() {
    let w = world();
    let (_, token) = w.seed_member(1, "ops@example.com", Role::Admin).await;

    let (status, _) = w.post("/api/auth/logout", Some(&token), json!({})).await;
    assert_eq!(status, StatusCode::OK);

    // The signature still verifies but the session row is gone
    let err = w.state.auth.resolve_token(&token).await.unwrap_err();
    assert!(matches!(err, crate::error::Error::TokenInvalid));
}

#[tokio::test]
async fn netinfo_ingest_feeds_peer_resolution() {
    let w = world();
    let a = w.seed_agent(1, 1).await;
    let b = w.seed_agent(2, 1).await;
    w.seed_probe(ping_probe(10, 1, 1, vec![ProbeTarget::agent(2)]))
        .await;
    let netinfo = w
        .seed_probe(Probe {
            kind: ProbeType::Netinfo,
            ..ping_probe(11, 1, 2, vec![])
        })
        .await;

    // B reports its NETINFO through the real ingest path
    let frame = w
        .state
        .ingest
        .ingest(
            &b,
            SampleEnvelope {
                probe_id: netinfo.id,
                kind: ProbeType::Netinfo,
                created_at: Utc::now(),
                target: None,
                target_agent_id: None,
                triggered: false,
                payload: json!({ "public_ip": "203.0.113.10" }),
            },
        )
        .await;
    assert!(matches!(
        frame,
        netwatch_protocol::ControllerFrame::ProbePostOk { .. }
    ));

    let (probes, warnings) = w.state.resolver.resolve_for_agent(&a).await.unwrap();
    assert!(warnings.is_empty());
    assert_eq!(
        probes[0].targets[0].target.as_deref(),
        Some("203.0.113.10")
    );
}

#[tokio::test]
async fn samples_reach_subscribers_in_emission_order() {
    let w = world();
    let a = w.seed_agent(1, 1).await;
    let probe = w
        .seed_probe(ping_probe(10, 1, 1, vec![ProbeTarget::literal("1.1.1.1")]))
        .await;

    let (tx, mut rx) = mpsc::channel(64);
    w.state
        .broadcast
        .subscribe(
            Filter {
                workspace_id: 1,
                probe_id: 0,
            },
            SubscriberScope::User,
            tx,
            Arc::new(ConnectionKick::new()),
        )
        .await;

    for i in 0..10 {
        w.state
            .ingest
            .ingest(
                &a,
                SampleEnvelope {
                    probe_id: probe.id,
                    kind: ProbeType::Ping,
                    created_at: Utc::now(),
                    target: Some("1.1.1.1".into()),
                    target_agent_id: None,
                    triggered: false,
                    payload: json!({ "seq": i }),
                },
            )
            .await;
    }

    for expected in 0..10 {
        match rx.recv().await {
            Some(PanelFrame::ProbeData(event)) => {
                assert_eq!(event.payload["seq"], expected);
            }
            other => panic!("expected ProbeData, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn share_password_gate_and_snapshot() {
    let w = world();
    w.seed_agent(2, 1).await;
    w.seed_probe(ping_probe(10, 1, 2, vec![ProbeTarget::literal("1.1.1.1")]))
        .await;
    w.identity
        .insert_share_link(ShareLink {
            id: 0,
            token: "T".into(),
            workspace_id: 1,
            agent_id: Some(2),
            probe_id: None,
            password_hash: Some(hash_secret("sesame").unwrap()),
            expires_at: None,
            allow_speedtest: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let (status, body) = w.get("/api/share/T").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_password"], true);
    assert_eq!(body["expired"], false);

    let (status, body) = w.post("/api/share/T/agent", None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "PASSWORD_REQUIRED");

    let (status, body) = w
        .post("/api/share/T/agent", None, json!({ "password": "wrong" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_PASSWORD");

    let (status, body) = w
        .post("/api/share/T/agent", None, json!({ "password": "sesame" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"][0]["id"], 2);
    assert_eq!(body["probes"][0]["id"], 10);
    assert_eq!(body["allow_speedtest"], true);
    let share_bearer = body["token"].as_str().unwrap().to_string();

    // The minted bearer resolves to a share-scoped session
    let session = w.state.auth.resolve_token(&share_bearer).await.unwrap();
    assert!(session.share_link_id.is_some());
}

#[tokio::test]
async fn expired_share_link_reports_expired() {
    let w = world();
    w.identity
        .insert_share_link(ShareLink {
            id: 0,
            token: "OLD".into(),
            workspace_id: 1,
            agent_id: None,
            probe_id: None,
            password_hash: None,
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            allow_speedtest: false,
            created_at: Utc::now() - chrono::Duration::hours(1),
        })
        .await
        .unwrap();

    let (status, body) = w.get("/api/share/OLD").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expired"], true);

    let (status, body) = w.post("/api/share/OLD/agent", None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "LINK_EXPIRED");
}

#[tokio::test]
async fn speedtest_rest_flow_enforces_role_and_limits() {
    let w = world();
    w.seed_agent(5, 1).await;
    let (_, viewer_token) = w.seed_member(1, "viewer@example.com", Role::Viewer).await;
    let (_, user_token) = w.seed_member(1, "user@example.com", Role::User).await;

    // VIEWER cannot trigger speedtests
    let (status, _) = w
        .post("/api/agents/5/speedtest", Some(&viewer_token), json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // USER can, up to the pending limit
    for _ in 0..3 {
        let (status, body) = w
            .post("/api/agents/5/speedtest", Some(&user_token), json!({}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["request"]["status"], "pending");
    }
    let (status, body) = w
        .post("/api/agents/5/speedtest", Some(&user_token), json!({}))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "too_many_pending");

    // Delivery: first item goes in flight, completion frees the next
    let item = w.state.queue.next_for(5).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::InFlight);
    assert!(w.state.queue.next_for(5).await.unwrap().is_none());
    w.state.queue.complete(item.id, "sample:1").await.unwrap();
    assert!(w.state.queue.next_for(5).await.unwrap().is_some());
}

#[tokio::test]
async fn share_speedtest_requires_capability_and_scope() {
    let w = world();
    w.seed_agent(5, 1).await;
    w.seed_agent(6, 1).await;
    w.identity
        .insert_share_link(ShareLink {
            id: 0,
            token: "S".into(),
            workspace_id: 1,
            agent_id: Some(5),
            probe_id: None,
            password_hash: None,
            expires_at: None,
            allow_speedtest: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let (_, body) = w.post("/api/share/S/agent", None, json!({})).await;
    let bearer = body["token"].as_str().unwrap().to_string();

    let (status, _) = w
        .post("/api/agents/5/speedtest", Some(&bearer), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Out of the link's agent scope
    let (status, _) = w
        .post("/api/agents/6/speedtest", Some(&bearer), json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn health_reports_connection_gauges() {
    let w = world();
    let (status, body) = w.get("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents_connected"], 0);
    assert_eq!(body["subscribers"], 0);
}
