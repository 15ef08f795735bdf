//! Probe target resolution.
//!
//! Given an authenticated agent, produces the probe list it must execute now,
//! with logical agent references rewritten to concrete destinations:
//!
//! - TRAFFICSIM servers keep their bind target and gain one `{agent_id}`
//!   target per client peer in the workspace (fan-in).
//! - Agent-typed targets are rewritten to the peer's public IP (override
//!   first, else the latest NETINFO sample). TRAFFICSIM clients additionally
//!   inherit the port of the peer's server-side bind target.
//!
//! Resolved peer IPs are cached per agent for `netinfo_cache_secs`; every
//! agent in a workspace re-fetching its probes would otherwise hit the
//! time-series store once per peer per fetch.
//!
//! Resolution never mutates persisted probes and never aborts the batch: a
//! probe that cannot be resolved is skipped and reported in the warning list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use netwatch_protocol::{Agent, Probe, ProbeTarget, ProbeType, ResolutionWarning};

use crate::error::Error;
use crate::store::{IdentityStore, TimeSeriesStore};

struct CachedIp {
    ip: String,
    fetched_at: DateTime<Utc>,
}

pub struct ProbeResolver {
    identity: Arc<dyn IdentityStore>,
    timeseries: Arc<dyn TimeSeriesStore>,
    /// How long a resolved peer IP may be served without re-reading the
    /// override and NETINFO history. Zero disables the cache.
    cache_ttl: Duration,
    ip_cache: Mutex<HashMap<i64, CachedIp>>,
}

/// Split `host:port`, accepting bracketed IPv6 (`[2001:db8::1]:5555`).
/// Unbracketed strings containing more than one `:` are rejected rather than
/// guessed at.
pub fn parse_host_port(s: &str) -> Result<(String, u16), Error> {
    let bad = || Error::validation("target", format!("{s:?} is not a valid host:port"));

    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        let port = after.strip_prefix(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port: u16 = port.parse().map_err(|_| bad())?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() || host.contains(':') {
        return Err(bad());
    }
    let port: u16 = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

/// Join a resolved IP with a port, bracketing IPv6 hosts.
fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

enum Skip {
    /// Skip the whole probe and record a warning.
    Probe(String),
}

impl ProbeResolver {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        timeseries: Arc<dyn TimeSeriesStore>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            identity,
            timeseries,
            cache_ttl: Duration::seconds(cache_ttl_secs as i64),
            ip_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve every probe assigned to `agent`. Returns the resolved probes
    /// plus warnings for probes skipped in this fetch.
    pub async fn resolve_for_agent(
        &self,
        agent: &Agent,
    ) -> Result<(Vec<Probe>, Vec<ResolutionWarning>), Error> {
        let assigned = self.identity.probes_for_agent(agent.id).await?;
        let mut resolved = Vec::with_capacity(assigned.len());
        let mut warnings = Vec::new();

        for probe in assigned {
            if !probe.enabled {
                continue;
            }
            let outcome = if probe.kind == ProbeType::Trafficsim && probe.server {
                self.resolve_server_fan_in(agent, probe.clone()).await
            } else {
                self.resolve_targets(agent, probe.clone()).await
            };
            match outcome {
                Ok(probe) => resolved.push(probe),
                Err(Skip::Probe(message)) => {
                    tracing::debug!(probe_id = probe.id, agent_id = agent.id, %message, "Probe skipped in this fetch");
                    warnings.push(ResolutionWarning {
                        probe_id: probe.id,
                        message,
                    });
                }
            }
        }

        Ok((resolved, warnings))
    }

    /// Server-side TRAFFICSIM: the first target is the bind address and is
    /// kept verbatim; one `{agent_id}` target per client peer is appended,
    /// ordered by client probe creation time then id.
    async fn resolve_server_fan_in(&self, agent: &Agent, mut probe: Probe) -> Result<Probe, Skip> {
        let bind = probe
            .targets
            .first()
            .and_then(|t| t.target.as_deref())
            .ok_or_else(|| Skip::Probe("server probe has no bind target".to_string()))?;
        parse_host_port(bind)
            .map_err(|e| Skip::Probe(format!("server bind target invalid: {e}")))?;

        let clients = self
            .identity
            .client_probes_of_server(probe.workspace_id, agent.id, probe.kind)
            .await
            .map_err(|e| Skip::Probe(format!("client lookup failed: {e}")))?;

        let bind_target = probe.targets.swap_remove(0);
        let mut targets = Vec::with_capacity(1 + clients.len());
        targets.push(bind_target);
        for client in clients {
            targets.push(ProbeTarget::agent(client.agent_id));
        }
        probe.targets = targets;
        Ok(probe)
    }

    /// Rewrite each agent-typed target to the peer's public IP. Empty
    /// (group-only) targets are dropped; literal targets pass through.
    async fn resolve_targets(&self, agent: &Agent, mut probe: Probe) -> Result<Probe, Skip> {
        let mut targets = Vec::with_capacity(probe.targets.len());
        for target in &probe.targets {
            if target.is_empty() {
                continue;
            }
            let Some(peer_id) = target.agent_id else {
                targets.push(target.clone());
                continue;
            };

            let ip = self.peer_public_ip(peer_id).await?;
            let resolved = if probe.kind.pairs_with_server() {
                let port = self.peer_server_port(agent, peer_id, probe.kind).await?;
                format_host_port(&ip, port)
            } else {
                ip
            };
            targets.push(ProbeTarget {
                target: Some(resolved),
                agent_id: Some(peer_id),
                group_id: target.group_id,
            });
        }
        probe.targets = targets;
        Ok(probe)
    }

    /// The most recent public IP observed for a peer agent: the override when
    /// set, else the latest NETINFO sample. Successful lookups are served
    /// from the cache for `cache_ttl`; failures are never cached.
    async fn peer_public_ip(&self, peer_id: i64) -> Result<String, Skip> {
        let now = Utc::now();
        {
            let cache = self.ip_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&peer_id)
                && now - cached.fetched_at < self.cache_ttl
            {
                return Ok(cached.ip.clone());
            }
        }

        let peer = self
            .identity
            .agent_by_id(peer_id)
            .await
            .map_err(|e| Skip::Probe(format!("peer lookup failed: {e}")))?
            .ok_or_else(|| Skip::Probe(format!("peer agent {peer_id} does not exist")))?;

        let ip = match peer
            .public_ip_override
            .as_deref()
            .filter(|ip| !ip.is_empty())
        {
            Some(ip) => ip.to_string(),
            None => {
                let sample = self
                    .timeseries
                    .latest_for_agent(peer.workspace_id, peer.id, ProbeType::Netinfo)
                    .await
                    .map_err(|e| Skip::Probe(format!("netinfo lookup failed: {e}")))?
                    .ok_or_else(|| {
                        Skip::Probe(format!("peer agent {peer_id} has no known public IP"))
                    })?;
                sample
                    .payload
                    .get("public_ip")
                    .and_then(|v| v.as_str())
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Skip::Probe(format!("peer agent {peer_id} has no known public IP"))
                    })?
            }
        };

        let mut cache = self.ip_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            peer_id,
            CachedIp {
                ip: ip.clone(),
                fetched_at: now,
            },
        );
        Ok(ip)
    }

    /// Port of the peer's server-side probe of matching type. With several
    /// candidates the first by creation time wins, ties broken by ascending
    /// probe id.
    async fn peer_server_port(
        &self,
        agent: &Agent,
        peer_id: i64,
        kind: ProbeType,
    ) -> Result<u16, Skip> {
        let servers = self
            .identity
            .server_probes_for_agent(peer_id, kind)
            .await
            .map_err(|e| Skip::Probe(format!("server probe lookup failed: {e}")))?;

        let server = servers
            .into_iter()
            .find(|p| p.workspace_id == agent.workspace_id)
            .ok_or_else(|| {
                Skip::Probe(format!("peer agent {peer_id} has no {kind} server probe"))
            })?;

        let bind = server
            .targets
            .first()
            .and_then(|t| t.target.as_deref())
            .ok_or_else(|| {
                Skip::Probe(format!("peer agent {peer_id} server probe has no bind target"))
            })?;

        let (_, port) = parse_host_port(bind)
            .map_err(|e| Skip::Probe(format!("peer server bind target invalid: {e}")))?;
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryIdentityStore, MemoryTimeSeriesStore};
    use chrono::{Duration, Utc};
    use netwatch_protocol::ProbeSample;
    use serde_json::json;

    struct Fixture {
        identity: Arc<MemoryIdentityStore>,
        timeseries: Arc<MemoryTimeSeriesStore>,
        resolver: ProbeResolver,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryIdentityStore::new());
        let timeseries = Arc::new(MemoryTimeSeriesStore::new());
        // Cache disabled so each assertion sees the store directly
        let resolver = ProbeResolver::new(identity.clone(), timeseries.clone(), 0);
        Fixture {
            identity,
            timeseries,
            resolver,
        }
    }

    async fn seed_agent(fx: &Fixture, id: i64, override_ip: Option<&str>) -> Agent {
        fx.identity
            .insert_agent(Agent {
                id,
                workspace_id: 1,
                name: format!("agent-{id}"),
                psk_hash: None,
                public_ip_override: override_ip.map(str::to_string),
                last_seen_at: None,
                version: None,
            })
            .await
            .unwrap()
    }

    async fn seed_netinfo(fx: &Fixture, agent_id: i64, ip: &str, age_minutes: i64) {
        fx.timeseries
            .append(&ProbeSample {
                workspace_id: 1,
                probe_id: 1000 + agent_id,
                agent_id,
                target_agent_id: None,
                kind: ProbeType::Netinfo,
                created_at: Utc::now() - Duration::minutes(age_minutes),
                target: None,
                triggered: false,
                payload: json!({"public_ip": ip}),
            })
            .await
            .unwrap();
    }

    fn probe(
        id: i64,
        agent_id: i64,
        kind: ProbeType,
        server: bool,
        targets: Vec<ProbeTarget>,
    ) -> Probe {
        Probe {
            id,
            workspace_id: 1,
            agent_id,
            kind,
            interval_sec: 60,
            count: 4,
            duration: 30,
            server,
            enabled: true,
            targets,
            created_at: Utc::now(),
            pending: None,
        }
    }

    #[test]
    fn host_port_parser_accepts_v4_and_bracketed_v6() {
        assert_eq!(
            parse_host_port("0.0.0.0:5555").unwrap(),
            ("0.0.0.0".into(), 5555)
        );
        assert_eq!(
            parse_host_port("probe.example.net:8080").unwrap(),
            ("probe.example.net".into(), 8080)
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]:5555").unwrap(),
            ("2001:db8::1".into(), 5555)
        );
    }

    #[test]
    fn host_port_parser_rejects_malformed() {
        for bad in [
            "",
            "no-port",
            ":5555",
            "host:",
            "host:notaport",
            "host:70000",
            "2001:db8::1:5555",
            "[2001:db8::1]",
            "[]:5555",
        ] {
            assert!(parse_host_port(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn peer_ip_resolution_uses_latest_netinfo() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, None).await;
        seed_netinfo(&fx, 2, "198.51.100.99", 30).await;
        seed_netinfo(&fx, 2, "203.0.113.10", 1).await;
        fx.identity
            .insert_probe(probe(0, 1, ProbeType::Ping, false, vec![ProbeTarget::agent(2)]))
            .await
            .unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(resolved.len(), 1);
        let target = &resolved[0].targets[0];
        assert_eq!(target.target.as_deref(), Some("203.0.113.10"));
        assert_eq!(target.agent_id, Some(2));
    }

    #[tokio::test]
    async fn public_ip_override_wins_over_netinfo() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, Some("198.51.100.7")).await;
        seed_netinfo(&fx, 2, "203.0.113.10", 1).await;
        fx.identity
            .insert_probe(probe(0, 1, ProbeType::Ping, false, vec![ProbeTarget::agent(2)]))
            .await
            .unwrap();

        let (resolved, _) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("198.51.100.7")
        );
    }

    #[tokio::test]
    async fn unresolvable_peer_skips_probe_with_warning() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, None).await; // no NETINFO, no override
        fx.identity
            .insert_probe(probe(10, 1, ProbeType::Ping, false, vec![ProbeTarget::agent(2)]))
            .await
            .unwrap();
        fx.identity
            .insert_probe(probe(
                11,
                1,
                ProbeType::Ping,
                false,
                vec![ProbeTarget::literal("1.1.1.1")],
            ))
            .await
            .unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        // The unresolvable probe is skipped; the rest of the batch survives
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 11);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].probe_id, 10);
    }

    #[tokio::test]
    async fn trafficsim_server_fans_in_clients() {
        let fx = fixture();
        let server = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, None).await; // C1
        seed_agent(&fx, 3, None).await; // C2
        fx.identity
            .insert_probe(probe(
                20,
                1,
                ProbeType::Trafficsim,
                true,
                vec![ProbeTarget::literal("0.0.0.0:5555")],
            ))
            .await
            .unwrap();
        let mut c1 = probe(21, 2, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]);
        c1.created_at = Utc::now() - Duration::minutes(2);
        fx.identity.insert_probe(c1).await.unwrap();
        let mut c2 = probe(22, 3, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]);
        c2.created_at = Utc::now() - Duration::minutes(1);
        fx.identity.insert_probe(c2).await.unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&server).await.unwrap();
        assert!(warnings.is_empty());
        let targets = &resolved[0].targets;
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].target.as_deref(), Some("0.0.0.0:5555"));
        assert_eq!(targets[1], ProbeTarget::agent(2));
        assert_eq!(targets[2], ProbeTarget::agent(3));
    }

    #[tokio::test]
    async fn trafficsim_client_inherits_server_port() {
        let fx = fixture();
        seed_agent(&fx, 1, Some("198.51.100.7")).await; // server S
        let c1 = seed_agent(&fx, 2, None).await;
        fx.identity
            .insert_probe(probe(
                30,
                1,
                ProbeType::Trafficsim,
                true,
                vec![ProbeTarget::literal("0.0.0.0:5555")],
            ))
            .await
            .unwrap();
        fx.identity
            .insert_probe(probe(31, 2, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]))
            .await
            .unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&c1).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("198.51.100.7:5555")
        );
    }

    #[tokio::test]
    async fn trafficsim_client_brackets_ipv6_server() {
        let fx = fixture();
        seed_agent(&fx, 1, Some("2001:db8::7")).await;
        let c1 = seed_agent(&fx, 2, None).await;
        fx.identity
            .insert_probe(probe(
                40,
                1,
                ProbeType::Trafficsim,
                true,
                vec![ProbeTarget::literal("[::]:5555")],
            ))
            .await
            .unwrap();
        fx.identity
            .insert_probe(probe(41, 2, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]))
            .await
            .unwrap();

        let (resolved, _) = fx.resolver.resolve_for_agent(&c1).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("[2001:db8::7]:5555")
        );
    }

    #[tokio::test]
    async fn first_server_probe_by_creation_wins() {
        let fx = fixture();
        seed_agent(&fx, 1, Some("198.51.100.7")).await;
        let c1 = seed_agent(&fx, 2, None).await;
        let mut newer = probe(
            51,
            1,
            ProbeType::Trafficsim,
            true,
            vec![ProbeTarget::literal("0.0.0.0:7777")],
        );
        newer.created_at = Utc::now();
        let mut older = probe(
            52,
            1,
            ProbeType::Trafficsim,
            true,
            vec![ProbeTarget::literal("0.0.0.0:5555")],
        );
        older.created_at = Utc::now() - Duration::hours(1);
        fx.identity.insert_probe(newer).await.unwrap();
        fx.identity.insert_probe(older).await.unwrap();
        fx.identity
            .insert_probe(probe(53, 2, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]))
            .await
            .unwrap();

        let (resolved, _) = fx.resolver.resolve_for_agent(&c1).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("198.51.100.7:5555")
        );
    }

    #[tokio::test]
    async fn malformed_server_bind_skips_client_probe() {
        let fx = fixture();
        seed_agent(&fx, 1, Some("198.51.100.7")).await;
        let c1 = seed_agent(&fx, 2, None).await;
        fx.identity
            .insert_probe(probe(
                60,
                1,
                ProbeType::Trafficsim,
                true,
                vec![ProbeTarget::literal("not a bind target")],
            ))
            .await
            .unwrap();
        fx.identity
            .insert_probe(probe(61, 2, ProbeType::Trafficsim, false, vec![ProbeTarget::agent(1)]))
            .await
            .unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&c1).await.unwrap();
        assert!(resolved.is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].probe_id, 61);
    }

    #[tokio::test]
    async fn disabled_probes_are_not_returned() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        let mut p = probe(
            70,
            1,
            ProbeType::Ping,
            false,
            vec![ProbeTarget::literal("1.1.1.1")],
        );
        p.enabled = false;
        fx.identity.insert_probe(p).await.unwrap();

        let (resolved, warnings) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert!(resolved.is_empty());
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn group_only_targets_are_ignored() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        fx.identity
            .insert_probe(probe(
                80,
                1,
                ProbeType::Ping,
                false,
                vec![
                    ProbeTarget {
                        target: None,
                        agent_id: None,
                        group_id: Some(9),
                    },
                    ProbeTarget::literal("1.1.1.1"),
                ],
            ))
            .await
            .unwrap();

        let (resolved, _) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert_eq!(resolved[0].targets.len(), 1);
        assert_eq!(resolved[0].targets[0].target.as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn peer_ip_is_served_from_cache_within_the_window() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, None).await;
        seed_netinfo(&fx, 2, "203.0.113.10", 5).await;
        fx.identity
            .insert_probe(probe(95, 1, ProbeType::Ping, false, vec![ProbeTarget::agent(2)]))
            .await
            .unwrap();

        let cached = ProbeResolver::new(fx.identity.clone(), fx.timeseries.clone(), 300);
        let (resolved, _) = cached.resolve_for_agent(&a).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("203.0.113.10")
        );

        // A newer NETINFO report lands, but the window has not elapsed
        seed_netinfo(&fx, 2, "203.0.113.99", 0).await;
        let (resolved, _) = cached.resolve_for_agent(&a).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("203.0.113.10")
        );

        // The fixture resolver has no cache and sees the new IP at once
        let (resolved, _) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert_eq!(
            resolved[0].targets[0].target.as_deref(),
            Some("203.0.113.99")
        );
    }

    #[tokio::test]
    async fn resolution_is_idempotent_for_stable_history() {
        let fx = fixture();
        let a = seed_agent(&fx, 1, None).await;
        seed_agent(&fx, 2, None).await;
        seed_netinfo(&fx, 2, "203.0.113.10", 5).await;
        fx.identity
            .insert_probe(probe(90, 1, ProbeType::Ping, false, vec![ProbeTarget::agent(2)]))
            .await
            .unwrap();

        let (first, _) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        let (second, _) = fx.resolver.resolve_for_agent(&a).await.unwrap();
        assert_eq!(first, second);

        // Persisted probes are untouched by resolution
        let stored = fx.identity.probe_by_id(90).await.unwrap().unwrap();
        assert_eq!(stored.targets[0], ProbeTarget::agent(2));
    }
}
