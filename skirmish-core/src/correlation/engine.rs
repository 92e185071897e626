use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use skirmish_model::{CorrelatedEvent, CorrelatedEventId, RawEvent, RunId};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};

use super::rules::{link_matches, tag_stage, validate_dag, LinkRule, Observation};

/// Rule priority order; the first rule with an eligible cause wins.
const RULE_PRIORITY: [LinkRule; 3] = [
    LinkRule::ProcessToConnection,
    LinkRule::QueryToConnection,
    LinkRule::WriteToUpload,
];

struct PendingEvent {
    raw: RawEvent,
    obs: Observation,
}

/// Mutable per-run correlation state, locked as a unit so `flush` is
/// single-flight per run.
struct FlushState {
    rx: mpsc::UnboundedReceiver<PendingEvent>,
    next_sequence: u64,
    timeline: Vec<CorrelatedEvent>,
    /// Parallel to `timeline`; kept so events buffered in a later flush
    /// can still link against recently correlated ones.
    observations: Vec<Observation>,
}

struct RunChannel {
    tx: mpsc::UnboundedSender<PendingEvent>,
    state: Arc<Mutex<FlushState>>,
    provisioned_at: DateTime<Utc>,
}

/// Fuses raw collector events into a causally ordered timeline.
///
/// Ingestion is concurrent and non-blocking: producers push onto a per-run
/// channel after validation. `flush` drains the channel under a per-run
/// lock, applies the linkage rules and assigns monotonically increasing
/// sequence numbers; each raw event is consumed exactly once, so a second
/// flush with no new ingests returns nothing.
pub struct CorrelationEngine {
    config: CoreConfig,
    runs: RwLock<HashMap<RunId, RunChannel>>,
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine").finish_non_exhaustive()
    }
}

impl CorrelationEngine {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Open the ingestion window for a run. Called by the pipeline once
    /// provisioning completes; `provisioned_at` anchors the skew check.
    pub async fn open_run(&self, run_id: RunId, provisioned_at: DateTime<Utc>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = RunChannel {
            tx,
            state: Arc::new(Mutex::new(FlushState {
                rx,
                next_sequence: 0,
                timeline: Vec::new(),
                observations: Vec::new(),
            })),
            provisioned_at,
        };
        self.runs.write().await.insert(run_id, channel);
    }

    /// Accept one raw event. Validation is local: a rejected event is
    /// dropped and never corrupts the timeline, and ingestion never waits
    /// on correlation.
    pub async fn ingest(&self, run_id: RunId, raw: RawEvent) -> Result<()> {
        let runs = self.runs.read().await;
        let channel = runs.get(&run_id).ok_or(CoreError::UnknownRun(run_id))?;

        let earliest = channel.provisioned_at
            - ChronoDuration::from_std(self.config.skew_tolerance)
                .unwrap_or_else(|_| ChronoDuration::seconds(5));
        if raw.observed_at < earliest {
            let skew_secs = (channel.provisioned_at - raw.observed_at).num_seconds();
            warn!(%run_id, event_id = %raw.id, skew_secs, "dropping out-of-window event");
            return Err(CoreError::OutOfWindow { skew_secs });
        }

        let obs = Observation::parse(raw.source, &raw.origin, &raw.payload)?;
        channel
            .tx
            .send(PendingEvent { raw, obs })
            .map_err(|_| CoreError::UnknownRun(run_id))?;
        Ok(())
    }

    /// Drain buffered events for a run and return the newly correlated
    /// ones. Single-flight per run; idempotent on already-correlated
    /// events.
    pub async fn flush(&self, run_id: RunId) -> Result<Vec<CorrelatedEvent>> {
        let state = {
            let runs = self.runs.read().await;
            let channel = runs.get(&run_id).ok_or(CoreError::UnknownRun(run_id))?;
            Arc::clone(&channel.state)
        };
        let mut state = state.lock().await;
        let produced = Self::correlate_pending(&self.config, run_id, &mut state);
        debug!(%run_id, count = produced.len(), "flush correlated events");
        Ok(produced)
    }

    /// Discard a run's buffer without finalizing. Called when a run fails
    /// or is cancelled: buffered raw events are dropped and later ingests
    /// fail with `UnknownRun`, same as after `finalize`.
    pub async fn close_run(&self, run_id: RunId) {
        if self.runs.write().await.remove(&run_id).is_some() {
            debug!(%run_id, "discarded correlation buffer");
        }
    }

    /// Final flush plus barrier: the run's channel is removed so further
    /// ingests fail with `UnknownRun`, and the full finalized timeline is
    /// returned after DAG validation.
    pub async fn finalize(&self, run_id: RunId) -> Result<Vec<CorrelatedEvent>> {
        let channel = self
            .runs
            .write()
            .await
            .remove(&run_id)
            .ok_or(CoreError::UnknownRun(run_id))?;
        let mut state = channel.state.lock().await;
        let _ = Self::correlate_pending(&self.config, run_id, &mut state);
        validate_dag(&state.timeline)?;
        Ok(std::mem::take(&mut state.timeline))
    }

    /// Snapshot of the timeline correlated so far.
    pub async fn timeline(&self, run_id: RunId) -> Result<Vec<CorrelatedEvent>> {
        let state = {
            let runs = self.runs.read().await;
            let channel = runs.get(&run_id).ok_or(CoreError::UnknownRun(run_id))?;
            Arc::clone(&channel.state)
        };
        let state = state.lock().await;
        Ok(state.timeline.clone())
    }

    fn correlate_pending(
        config: &CoreConfig,
        run_id: RunId,
        state: &mut FlushState,
    ) -> Vec<CorrelatedEvent> {
        let mut batch = Vec::new();
        while let Ok(pending) = state.rx.try_recv() {
            batch.push(pending);
        }
        if batch.is_empty() {
            return Vec::new();
        }

        // Deterministic processing order: source timestamp first, arrival
        // order as the tie-breaker (sort is stable).
        batch.sort_by_key(|p| p.raw.observed_at);

        let window = ChronoDuration::from_std(config.correlation_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(2));
        let first_new = state.timeline.len();

        for pending in batch {
            let cause_idx = Self::find_cause(config, state, &pending, window);
            let matched = cause_idx.map(|(rule, idx)| (rule, &state.observations[idx]));
            let stage = tag_stage(&pending.obs, matched);

            state.next_sequence += 1;
            let mut attributes = pending.obs.attributes();
            attributes.insert("origin".into(), pending.raw.origin.clone());

            let event = CorrelatedEvent {
                id: CorrelatedEventId::new(),
                run_id,
                sequence: state.next_sequence,
                stage,
                occurred_at: pending.raw.observed_at,
                raw_events: vec![pending.raw.id],
                causes: cause_idx
                    .map(|(_, idx)| vec![state.timeline[idx].id])
                    .unwrap_or_default(),
                effects: Vec::new(),
                attributes,
            };
            if let Some((_, idx)) = cause_idx {
                let effect_id = event.id;
                state.timeline[idx].effects.push(effect_id);
            }
            state.timeline.push(event);
            state.observations.push(pending.obs);
        }

        state.timeline[first_new..].to_vec()
    }

    /// Pick the cause for a pending event among already-correlated ones:
    /// rules in priority order, then smallest source timestamp, then
    /// earliest sequence.
    fn find_cause(
        config: &CoreConfig,
        state: &FlushState,
        pending: &PendingEvent,
        window: ChronoDuration,
    ) -> Option<(LinkRule, usize)> {
        for rule in RULE_PRIORITY {
            let mut best: Option<usize> = None;
            for (idx, candidate) in state.timeline.iter().enumerate() {
                let age = pending.raw.observed_at - candidate.occurred_at;
                if age < ChronoDuration::zero() || age > window {
                    continue;
                }
                if !link_matches(
                    rule,
                    &state.observations[idx],
                    &pending.obs,
                    config.size_tolerance,
                ) {
                    continue;
                }
                best = match best {
                    None => Some(idx),
                    Some(prev) => {
                        let prev_key =
                            (state.timeline[prev].occurred_at, state.timeline[prev].sequence);
                        let this_key =
                            (state.timeline[idx].occurred_at, state.timeline[idx].sequence);
                        Some(if this_key < prev_key { idx } else { prev })
                    }
                };
            }
            if let Some(idx) = best {
                return Some((rule, idx));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use skirmish_model::{AttackStage, RawEventId, SourceKind};

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn raw(
        run_id: RunId,
        source: SourceKind,
        origin: &str,
        observed: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> RawEvent {
        RawEvent {
            id: RawEventId::new(),
            run_id,
            source,
            origin: origin.to_string(),
            observed_at: observed,
            ingested_at: Utc::now(),
            payload: payload.as_object().cloned().expect("object payload"),
        }
    }

    async fn engine_with_run() -> (CorrelationEngine, RunId) {
        let engine = CorrelationEngine::new(CoreConfig::default());
        let run_id = RunId::new();
        engine.open_run(run_id, t(0)).await;
        (engine, run_id)
    }

    #[tokio::test]
    async fn ingest_for_unknown_run_is_rejected() {
        let engine = CorrelationEngine::new(CoreConfig::default());
        let run_id = RunId::new();
        let event = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(10),
            json!({ "type": "process_create", "image": "cmd.exe", "pid": 1 }),
        );
        assert!(matches!(
            engine.ingest(run_id, event).await,
            Err(CoreError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn events_before_provisioning_are_out_of_window() {
        let (engine, run_id) = engine_with_run().await;
        let event = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(-30),
            json!({ "type": "process_create", "image": "cmd.exe", "pid": 1 }),
        );
        assert!(matches!(
            engine.ingest(run_id, event).await,
            Err(CoreError::OutOfWindow { .. })
        ));

        // Inside the skew tolerance is still accepted.
        let event = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(-3),
            json!({ "type": "process_create", "image": "cmd.exe", "pid": 1 }),
        );
        engine.ingest(run_id, event).await.unwrap();
    }

    #[tokio::test]
    async fn second_flush_without_new_ingests_is_empty() {
        let (engine, run_id) = engine_with_run().await;
        let event = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(5),
            json!({
                "type": "dns_query",
                "query": "c2.example.net",
                "resolved": ["203.0.113.9"],
            }),
        );
        engine.ingest(run_id, event).await.unwrap();

        let first = engine.flush(run_id).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = engine.flush(run_id).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn psexec_smb_pair_correlates_into_lateral_movement() {
        let (engine, run_id) = engine_with_run().await;
        // Host process creation at t=-1s relative to the connection.
        let process = raw(
            run_id,
            SourceKind::Host,
            "10.0.0.5",
            t(9),
            json!({ "type": "process_create", "image": "psexec.exe", "pid": 4242 }),
        );
        let connection = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(10),
            json!({
                "type": "connection",
                "proto": "tcp",
                "src_ip": "10.0.0.5",
                "src_port": 49152,
                "dst_ip": "10.0.0.50",
                "dst_port": 445,
            }),
        );
        // Ingestion order deliberately reversed; source timestamps rule.
        engine.ingest(run_id, connection).await.unwrap();
        engine.ingest(run_id, process).await.unwrap();

        let events = engine.flush(run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        let process_ev = &events[0];
        let conn_ev = &events[1];
        assert_eq!(process_ev.stage, AttackStage::Execution);
        assert_eq!(conn_ev.stage, AttackStage::LateralMovement);
        assert_eq!(conn_ev.causes, vec![process_ev.id]);
        assert_eq!(process_ev.effects, vec![conn_ev.id]);
        assert!(process_ev.sequence < conn_ev.sequence);
    }

    #[tokio::test]
    async fn linkage_works_across_separate_flushes() {
        let (engine, run_id) = engine_with_run().await;
        let query = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(20),
            json!({
                "type": "dns_query",
                "query": "c2.example.net",
                "resolved": ["203.0.113.9"],
            }),
        );
        engine.ingest(run_id, query).await.unwrap();
        engine.flush(run_id).await.unwrap();

        let connection = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(21),
            json!({
                "type": "connection",
                "proto": "tcp",
                "src_ip": "10.0.0.20",
                "src_port": 50001,
                "dst_ip": "203.0.113.9",
                "dst_port": 8443,
            }),
        );
        engine.ingest(run_id, connection).await.unwrap();
        let events = engine.flush(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, AttackStage::InitialAccess);
        assert_eq!(events[0].causes.len(), 1);
    }

    #[tokio::test]
    async fn tie_between_candidate_causes_prefers_earlier_timestamp() {
        let (engine, run_id) = engine_with_run().await;
        for (offset, pid) in [(9, 10), (8, 11)] {
            let process = raw(
                run_id,
                SourceKind::Host,
                "10.0.0.5",
                t(offset),
                json!({ "type": "process_create", "image": "wmic.exe", "pid": pid }),
            );
            engine.ingest(run_id, process).await.unwrap();
        }
        let connection = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(10),
            json!({
                "type": "connection",
                "proto": "tcp",
                "src_ip": "10.0.0.5",
                "src_port": 49200,
                "dst_ip": "10.0.0.50",
                "dst_port": 135,
            }),
        );
        engine.ingest(run_id, connection).await.unwrap();

        let events = engine.flush(run_id).await.unwrap();
        assert_eq!(events.len(), 3);
        // Events sort by source time: pid 11 (t=8), pid 10 (t=9), conn.
        let earlier = &events[0];
        assert_eq!(earlier.attribute("pid"), Some("11"));
        assert_eq!(events[2].causes, vec![earlier.id]);
    }

    #[tokio::test]
    async fn finalize_bars_further_ingestion() {
        let (engine, run_id) = engine_with_run().await;
        let event = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(5),
            json!({ "type": "process_create", "image": "cmd.exe", "pid": 7 }),
        );
        engine.ingest(run_id, event).await.unwrap();

        let timeline = engine.finalize(run_id).await.unwrap();
        assert_eq!(timeline.len(), 1);

        let late = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(6),
            json!({ "type": "process_create", "image": "late.exe", "pid": 8 }),
        );
        assert!(matches!(
            engine.ingest(run_id, late).await,
            Err(CoreError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn close_run_discards_the_buffer() {
        let (engine, run_id) = engine_with_run().await;
        let event = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(5),
            json!({ "type": "process_create", "image": "cmd.exe", "pid": 7 }),
        );
        engine.ingest(run_id, event).await.unwrap();

        engine.close_run(run_id).await;

        assert!(matches!(
            engine.flush(run_id).await,
            Err(CoreError::UnknownRun(_))
        ));
        let late = raw(
            run_id,
            SourceKind::Host,
            "ws-1",
            t(6),
            json!({ "type": "process_create", "image": "late.exe", "pid": 8 }),
        );
        assert!(matches!(
            engine.ingest(run_id, late).await,
            Err(CoreError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_events_become_unknown_singletons() {
        let (engine, run_id) = engine_with_run().await;
        let event = raw(
            run_id,
            SourceKind::Network,
            "sensor-1",
            t(5),
            json!({
                "type": "connection",
                "proto": "udp",
                "src_ip": "10.0.0.99",
                "src_port": 5353,
                "dst_ip": "224.0.0.251",
                "dst_port": 5353,
            }),
        );
        engine.ingest(run_id, event).await.unwrap();
        let events = engine.flush(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, AttackStage::Unknown);
        assert!(events[0].causes.is_empty());
    }
}
