//! Ingest pipeline for `probe_post` submissions.
//!
//! Validates the envelope against the submitting agent, normalizes the
//! payload per probe type, appends to the time-series store, bumps the
//! agent's liveness timestamp, and lifts the sample into the broadcast
//! plane. Store write failures are NACK'd (the agent retries); validation
//! failures are rejected (the agent must not retry).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use netwatch_protocol::{
    Agent, BroadcastEvent, ControllerFrame, ProbeSample, ProbeType, SampleEnvelope,
};

use crate::error::Error;
use crate::hub::subscribers::BroadcastHub;
use crate::store::{IdentityStore, TimeSeriesStore};

pub struct IngestPipeline {
    identity: Arc<dyn IdentityStore>,
    timeseries: Arc<dyn TimeSeriesStore>,
    broadcast: Arc<BroadcastHub>,
    clock_skew: Duration,
}

impl IngestPipeline {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        timeseries: Arc<dyn TimeSeriesStore>,
        broadcast: Arc<BroadcastHub>,
        clock_skew_secs: i64,
    ) -> Self {
        Self {
            identity,
            timeseries,
            broadcast,
            clock_skew: Duration::seconds(clock_skew_secs),
        }
    }

    /// Process one sample from an authenticated agent and produce the frame
    /// to answer it with.
    pub async fn ingest(&self, agent: &Agent, envelope: SampleEnvelope) -> ControllerFrame {
        let probe_id = envelope.probe_id;
        match self.try_ingest(agent, envelope).await {
            Ok(()) => ControllerFrame::ProbePostOk { probe_id },
            Err(err @ (Error::Transient(_) | Error::Timeout)) => ControllerFrame::ProbePostNack {
                probe_id,
                code: err.code().to_string(),
                message: err.to_string(),
            },
            Err(err) => ControllerFrame::ProbePostReject {
                probe_id,
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    async fn try_ingest(&self, agent: &Agent, envelope: SampleEnvelope) -> Result<(), Error> {
        // Ownership is checked before existence is revealed: a probe that
        // belongs to another agent reads the same as one that does not exist.
        let probe = self
            .identity
            .probe_by_id(envelope.probe_id)
            .await?
            .filter(|p| p.agent_id == agent.id)
            .ok_or(Error::NotFound("probe"))?;

        if !probe.enabled {
            return Err(Error::validation("probe_id", "probe is disabled"));
        }
        if probe.kind != envelope.kind {
            return Err(Error::validation(
                "type",
                format!("expected {}, got {}", probe.kind, envelope.kind),
            ));
        }

        let now = Utc::now();
        let created_at = clamp_timestamp(envelope.created_at, now, self.clock_skew);
        let payload = normalize_payload(envelope.kind, envelope.payload)?;

        let sample = ProbeSample {
            workspace_id: probe.workspace_id,
            probe_id: probe.id,
            agent_id: agent.id,
            target_agent_id: envelope.target_agent_id,
            kind: envelope.kind,
            created_at,
            target: envelope.target,
            triggered: envelope.triggered,
            payload,
        };

        self.timeseries.append(&sample).await?;

        // Liveness bump is best-effort and never rejects the sample
        if let Err(e) = self.identity.touch_agent(agent.id, now).await {
            tracing::warn!(agent_id = agent.id, "Failed to update agent liveness: {e}");
        }

        self.broadcast
            .publish(&BroadcastEvent {
                workspace_id: sample.workspace_id,
                probe_id: sample.probe_id,
                agent_id: sample.agent_id,
                probe_agent_id: (probe.agent_id != agent.id).then_some(probe.agent_id),
                target_agent: sample.target_agent_id,
                kind: sample.kind,
                payload: sample.payload.clone(),
                created_at: sample.created_at,
                target: sample.target.clone(),
                triggered: sample.triggered.then_some(true),
            })
            .await;

        Ok(())
    }
}

/// Replace timestamps outside the skew tolerance with the receive time.
fn clamp_timestamp(
    reported: DateTime<Utc>,
    received: DateTime<Utc>,
    skew: Duration,
) -> DateTime<Utc> {
    if (reported - received).abs() > skew {
        received
    } else {
        reported
    }
}

/// Per-type payload normalization. Types the controller never reads pass
/// through opaque.
fn normalize_payload(kind: ProbeType, payload: Value) -> Result<Value, Error> {
    match kind {
        ProbeType::Mtr => normalize_mtr(payload),
        ProbeType::Trafficsim => normalize_trafficsim(payload),
        ProbeType::Netinfo => normalize_netinfo(payload),
        _ => Ok(payload),
    }
}

/// MTR reports are flattened to hop count plus per-hop loss and average
/// latency; everything else the agent attached is dropped.
fn normalize_mtr(payload: Value) -> Result<Value, Error> {
    let hops = payload
        .get("hops")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::validation("payload.hops", "missing hop list"))?;

    let mut flattened = Vec::with_capacity(hops.len());
    for (i, hop) in hops.iter().enumerate() {
        let host = hop
            .get("host")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string();
        let loss = hop.get("loss").and_then(|v| v.as_f64()).ok_or_else(|| {
            Error::validation(format!("payload.hops[{i}].loss"), "missing loss percentage")
        })?;
        let avg = hop.get("avg").and_then(|v| v.as_f64()).ok_or_else(|| {
            Error::validation(format!("payload.hops[{i}].avg"), "missing average latency")
        })?;
        flattened.push(json!({ "host": host, "loss": loss, "avg": avg }));
    }

    Ok(json!({
        "hop_count": flattened.len(),
        "hops": flattened,
    }))
}

/// TRAFFICSIM samples carry sequence/loss/jitter aggregates.
fn normalize_trafficsim(payload: Value) -> Result<Value, Error> {
    let sent = payload
        .get("sent")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::validation("payload.sent", "missing packet count"))?;
    let lost = payload
        .get("lost")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::validation("payload.lost", "missing loss count"))?;
    if lost > sent {
        return Err(Error::validation("payload.lost", "more lost than sent"));
    }

    let loss_pct = if sent == 0 {
        0.0
    } else {
        lost as f64 / sent as f64 * 100.0
    };

    let mut normalized = json!({
        "sent": sent,
        "lost": lost,
        "loss_pct": loss_pct,
        "out_of_order": payload.get("out_of_order").and_then(|v| v.as_u64()).unwrap_or(0),
    });
    for key in ["jitter_ms", "min_rtt_ms", "avg_rtt_ms", "max_rtt_ms"] {
        if let Some(v) = payload.get(key).and_then(|v| v.as_f64()) {
            normalized[key] = json!(v);
        }
    }
    Ok(normalized)
}

/// NETINFO is the one payload the controller itself reads (peer IP
/// resolution), so `public_ip` must be present and a string.
fn normalize_netinfo(payload: Value) -> Result<Value, Error> {
    match payload.get("public_ip").and_then(|v| v.as_str()) {
        Some(ip) if !ip.is_empty() => Ok(payload),
        _ => Err(Error::validation("payload.public_ip", "missing public IP")),
    }
}
