//! Scoring: evaluates scenario objectives against a finalized timeline.
//!
//! Evaluation is pure and deterministic. Given the same run and the same
//! finalized timeline it produces bit-identical results: no clock reads,
//! no hash-order iteration, evidence always in sequence order. That is
//! what makes leaderboards reproducible and the engine testable.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use skirmish_model::{
    AttackStage, CorrelatedEvent, CorrelatedEventId, DetectionRule,
    LeaderboardDelta, ObjectiveResult, RunState, ScenarioDefinition,
    ScenarioRun, ScoreReport,
};
use tracing::info;

use crate::error::{CoreError, Result};

/// Outcome of evaluating one rule.
struct RuleOutcome {
    satisfied: bool,
    /// Satisfying events, ordered by sequence.
    evidence: Vec<CorrelatedEventId>,
    /// Earliest instant at which the rule as a whole held.
    satisfied_at: Option<DateTime<Utc>>,
}

impl RuleOutcome {
    fn unsatisfied() -> Self {
        Self {
            satisfied: false,
            evidence: Vec::new(),
            satisfied_at: None,
        }
    }
}

/// Score a run's finalized timeline against its scenario objectives.
///
/// Only legal once the run has reached `Scoring`; calling earlier is a
/// protocol error, the timeline is not frozen yet.
pub fn score(
    definition: &ScenarioDefinition,
    run: &ScenarioRun,
    timeline: &[CorrelatedEvent],
) -> Result<ScoreReport> {
    if run.state != RunState::Scoring {
        return Err(CoreError::InvalidTransition {
            from: run.state,
            to: RunState::Scoring,
        });
    }

    let index = TimelineIndex::new(timeline);
    let attack_start = run.entered_at(RunState::AttackExecuting);
    let total_weight: f64 = definition.objectives.iter().map(|o| o.weight).sum();

    let mut objectives = Vec::with_capacity(definition.objectives.len());
    let mut total_score = 0.0;
    for spec in &definition.objectives {
        let outcome = eval_rule(&spec.rule, &index);
        let contribution = if outcome.satisfied && total_weight > 0.0 {
            spec.weight / total_weight * 100.0
        } else {
            0.0
        };
        total_score += contribution;

        let time_to_detection_secs = match (outcome.satisfied_at, attack_start) {
            (Some(at), Some(start)) if outcome.satisfied => {
                Some((at - start).num_seconds())
            }
            _ => None,
        };

        objectives.push(ObjectiveResult {
            objective_id: spec.id.clone(),
            satisfied: outcome.satisfied,
            evidence: outcome.evidence,
            time_to_detection_secs,
            contribution,
        });
    }

    info!(
        run_id = %run.id,
        scenario_id = %definition.id,
        total_score,
        "scored run"
    );

    // Anchored to the transition log, not the wall clock, so re-scoring
    // the same run reproduces the report exactly.
    let scored_at = run
        .entered_at(RunState::Scoring)
        .unwrap_or(run.started_at);

    Ok(ScoreReport {
        run_id: run.id,
        objectives,
        total_score,
        leaderboard: LeaderboardDelta {
            team_id: run.team_id,
            scenario_id: definition.id,
            points: total_score,
        },
        scored_at,
    })
}

/// Sequence-ordered view of the timeline with a reverse id index.
struct TimelineIndex<'a> {
    events: &'a [CorrelatedEvent],
    by_id: HashMap<CorrelatedEventId, usize>,
}

impl<'a> TimelineIndex<'a> {
    fn new(events: &'a [CorrelatedEvent]) -> Self {
        let by_id = events
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.id, idx))
            .collect();
        Self { events, by_id }
    }

    fn tagged(&self, stage: AttackStage) -> impl Iterator<Item = &CorrelatedEvent> {
        self.events.iter().filter(move |e| e.stage == stage)
    }

    /// Is `ancestor` causally upstream of `event` (transitively)?
    fn reachable_from(&self, event: &CorrelatedEvent, ancestor: CorrelatedEventId) -> bool {
        let mut stack: Vec<CorrelatedEventId> = event.causes.clone();
        let mut visited = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(&idx) = self.by_id.get(&id) {
                stack.extend(self.events[idx].causes.iter().copied());
            }
        }
        false
    }
}

fn eval_rule(rule: &DetectionRule, index: &TimelineIndex<'_>) -> RuleOutcome {
    match rule {
        DetectionRule::StagePresent { stage } => {
            let evidence: Vec<_> = index.tagged(*stage).collect();
            match evidence.first() {
                Some(first) => RuleOutcome {
                    satisfied: true,
                    satisfied_at: Some(first.occurred_at),
                    evidence: evidence.iter().map(|e| e.id).collect(),
                },
                None => RuleOutcome::unsatisfied(),
            }
        }
        DetectionRule::StageSequence {
            upstream,
            downstream,
            within_secs,
        } => {
            let budget = ChronoDuration::seconds(*within_secs);
            // Downstream events in sequence order; the first causal pair
            // inside the time budget wins.
            for effect in index.tagged(*downstream) {
                for cause in index.tagged(*upstream) {
                    if cause.sequence >= effect.sequence {
                        continue;
                    }
                    if effect.occurred_at - cause.occurred_at > budget {
                        continue;
                    }
                    if index.reachable_from(effect, cause.id) {
                        return RuleOutcome {
                            satisfied: true,
                            satisfied_at: Some(effect.occurred_at),
                            evidence: vec![cause.id, effect.id],
                        };
                    }
                }
            }
            RuleOutcome::unsatisfied()
        }
        DetectionRule::AttributeEquals { key, value } => {
            let evidence: Vec<_> = index
                .events
                .iter()
                .filter(|e| e.attribute(key) == Some(value.as_str()))
                .collect();
            match evidence.first() {
                Some(first) => RuleOutcome {
                    satisfied: true,
                    satisfied_at: Some(first.occurred_at),
                    evidence: evidence.iter().map(|e| e.id).collect(),
                },
                None => RuleOutcome::unsatisfied(),
            }
        }
        DetectionRule::AllOf { rules } => {
            let mut evidence = Vec::new();
            let mut satisfied_at: Option<DateTime<Utc>> = None;
            for sub in rules {
                let outcome = eval_rule(sub, index);
                if !outcome.satisfied {
                    return RuleOutcome::unsatisfied();
                }
                evidence.extend(outcome.evidence);
                // The conjunction holds once its last conjunct holds.
                satisfied_at = match (satisfied_at, outcome.satisfied_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            RuleOutcome {
                satisfied: true,
                evidence: dedup_by_sequence(evidence, index),
                satisfied_at,
            }
        }
        DetectionRule::AnyOf { rules } => {
            for sub in rules {
                let outcome = eval_rule(sub, index);
                if outcome.satisfied {
                    return outcome;
                }
            }
            RuleOutcome::unsatisfied()
        }
    }
}

fn dedup_by_sequence(
    ids: Vec<CorrelatedEventId>,
    index: &TimelineIndex<'_>,
) -> Vec<CorrelatedEventId> {
    let mut keyed: Vec<(u64, CorrelatedEventId)> = ids
        .into_iter()
        .filter_map(|id| index.by_id.get(&id).map(|&idx| (index.events[idx].sequence, id)))
        .collect();
    keyed.sort_by_key(|(seq, _)| *seq);
    keyed.dedup_by_key(|(seq, _)| *seq);
    keyed.into_iter().map(|(_, id)| id).collect()
}
