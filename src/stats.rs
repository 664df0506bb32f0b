//! Statistics aggregation.
//!
//! Virtual users report step outcomes fire-and-forget over an unbounded
//! channel; a single actor task owns the accumulators and answers snapshot
//! requests over oneshot replies. The hot path never takes a lock.
//!
//! Accumulators store raw mergeable data (counts, sums, extremes); derived
//! values (mean, RPS, megabytes) are computed at snapshot time.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::SessionInfo;
use crate::error::{AppError, Result};

/// One observed step execution, as reported by a pipeline.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub scenario_name: String,
    pub step_name: String,
    pub ok: bool,
    pub latency_ms: f64,
    pub size_bytes: u64,
}

/// Final statistics for one step fingerprint `(scenario_name, step_name)`.
#[derive(Clone, Debug, Serialize)]
pub struct StepStats {
    pub scenario_name: String,
    pub step_name: String,
    pub ok_count: u64,
    pub fail_count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub rps: f64,
    pub data_kb_min: f64,
    pub data_kb_mean: f64,
    pub data_kb_max: f64,
    pub all_data_mb: f64,
}

/// Statistics for one scenario.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioStats {
    pub scenario_name: String,
    pub planned_duration: Duration,
    pub executed_duration: Duration,
    pub step_stats: Vec<StepStats>,
}

/// The per-node snapshot handed to reporting sinks.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStats {
    pub session_id: String,
    pub node_name: String,
    pub scenario_stats: Vec<ScenarioStats>,
    /// Set when a step requested cooperative termination.
    pub stop_reason: Option<String>,
}

impl NodeStats {
    /// All step stats across scenarios, in report order.
    pub fn step_stats(&self) -> impl Iterator<Item = &StepStats> {
        self.scenario_stats
            .iter()
            .flat_map(|scenario| scenario.step_stats.iter())
    }
}

/// Warm-up ok/fail totals for one step, used by the warm-up validator.
#[derive(Clone, Debug)]
pub(crate) struct WarmUpStepStats {
    pub step_name: String,
    pub ok_count: u64,
    pub fail_count: u64,
}

/// Fails on the first step whose failures exceed its successes.
pub(crate) fn validate_warm_up(stats: &[WarmUpStepStats]) -> Result<()> {
    for step in stats {
        if step.fail_count > step.ok_count {
            return Err(AppError::WarmUpErrorWithManyFailedSteps {
                ok: step.ok_count,
                fail: step.fail_count,
            });
        }
    }
    Ok(())
}

#[derive(Debug)]
struct StepAccum {
    seq: usize,
    ok_count: u64,
    fail_count: u64,
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    min_bytes: u64,
    max_bytes: u64,
    sum_bytes: u64,
}

impl StepAccum {
    fn new(seq: usize) -> Self {
        Self {
            seq,
            ok_count: 0,
            fail_count: 0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            sum_ms: 0.0,
            min_bytes: u64::MAX,
            max_bytes: 0,
            sum_bytes: 0,
        }
    }

    fn consume(&mut self, outcome: &StepOutcome) {
        if outcome.ok {
            self.ok_count += 1;
        } else {
            self.fail_count += 1;
        }
        self.min_ms = self.min_ms.min(outcome.latency_ms);
        self.max_ms = self.max_ms.max(outcome.latency_ms);
        self.sum_ms += outcome.latency_ms;
        self.min_bytes = self.min_bytes.min(outcome.size_bytes);
        self.max_bytes = self.max_bytes.max(outcome.size_bytes);
        self.sum_bytes += outcome.size_bytes;
    }

    fn finalize(&self, scenario_name: &str, step_name: &str, executed: Duration) -> StepStats {
        let total = self.ok_count + self.fail_count;
        let mean_ms = if total == 0 {
            0.0
        } else {
            self.sum_ms / total as f64
        };
        let executed_secs = executed.as_secs().max(1);
        StepStats {
            scenario_name: scenario_name.to_string(),
            step_name: step_name.to_string(),
            ok_count: self.ok_count,
            fail_count: self.fail_count,
            min_ms: if total == 0 { 0.0 } else { self.min_ms },
            mean_ms,
            max_ms: self.max_ms,
            rps: self.ok_count as f64 / executed_secs as f64,
            data_kb_min: if total == 0 {
                0.0
            } else {
                self.min_bytes as f64 / 1000.0
            },
            data_kb_mean: if total == 0 {
                0.0
            } else {
                (self.sum_bytes as f64 / total as f64) / 1000.0
            },
            data_kb_max: self.max_bytes as f64 / 1000.0,
            all_data_mb: self.sum_bytes as f64 / 1_000_000.0,
        }
    }
}

struct ScenarioAccum {
    order: usize,
    planned: Duration,
    started: Instant,
    executed: Option<Duration>,
    steps: HashMap<String, StepAccum>,
}

impl ScenarioAccum {
    fn executed_duration(&self) -> Duration {
        self.executed.unwrap_or_else(|| self.started.elapsed())
    }
}

enum Command {
    Record(StepOutcome),
    Register {
        scenario: String,
        planned: Duration,
    },
    Reset {
        scenario: String,
    },
    Finish {
        scenario: String,
        executed: Duration,
    },
    Deregister {
        scenario: String,
    },
    WarmUp {
        scenario: String,
        reply: oneshot::Sender<Vec<WarmUpStepStats>>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeStats>,
    },
}

/// Cheap, cloneable handle to the aggregator actor.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StatsHandle {
    /// Record one outcome. Never blocks; outcomes sent after the actor has
    /// stopped are dropped.
    pub(crate) fn record(&self, outcome: StepOutcome) {
        let _ = self.tx.send(Command::Record(outcome));
    }

    pub(crate) fn register(&self, scenario: &str, planned: Duration) {
        let _ = self.tx.send(Command::Register {
            scenario: scenario.to_string(),
            planned,
        });
    }

    /// Clear the scenario's counters at the warm-up / main boundary.
    pub(crate) fn reset(&self, scenario: &str) {
        let _ = self.tx.send(Command::Reset {
            scenario: scenario.to_string(),
        });
    }

    /// Freeze the elapsed time used for the scenario's RPS computation.
    pub(crate) fn finish(&self, scenario: &str, executed: Duration) {
        let _ = self.tx.send(Command::Finish {
            scenario: scenario.to_string(),
            executed,
        });
    }

    /// Drop the scenario from future snapshots (warm-up abort).
    pub(crate) fn deregister(&self, scenario: &str) {
        let _ = self.tx.send(Command::Deregister {
            scenario: scenario.to_string(),
        });
    }

    pub(crate) async fn warm_up_stats(&self, scenario: &str) -> Vec<WarmUpStepStats> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::WarmUp {
            scenario: scenario.to_string(),
            reply,
        });
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn snapshot(&self) -> NodeStats {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Snapshot { reply });
        rx.await.unwrap_or(NodeStats {
            session_id: String::new(),
            node_name: String::new(),
            scenario_stats: Vec::new(),
            stop_reason: None,
        })
    }
}

/// Spawn the aggregator actor. The task ends once every handle clone has
/// been dropped.
pub(crate) fn spawn(session: SessionInfo) -> (StatsHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(aggregator_task(session, rx));
    (StatsHandle { tx }, task)
}

async fn aggregator_task(session: SessionInfo, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut scenarios: HashMap<String, ScenarioAccum> = HashMap::new();
    let mut registered = 0usize;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(outcome) => {
                let scenario = scenarios
                    .entry(outcome.scenario_name.clone())
                    .or_insert_with(|| {
                        registered += 1;
                        ScenarioAccum {
                            order: registered - 1,
                            planned: Duration::ZERO,
                            started: Instant::now(),
                            executed: None,
                            steps: HashMap::new(),
                        }
                    });
                let next_seq = scenario.steps.len();
                scenario
                    .steps
                    .entry(outcome.step_name.clone())
                    .or_insert_with(|| StepAccum::new(next_seq))
                    .consume(&outcome);
            }
            Command::Register { scenario, planned } => {
                registered += 1;
                scenarios.insert(
                    scenario,
                    ScenarioAccum {
                        order: registered - 1,
                        planned,
                        started: Instant::now(),
                        executed: None,
                        steps: HashMap::new(),
                    },
                );
            }
            Command::Reset { scenario } => {
                if let Some(accum) = scenarios.get_mut(&scenario) {
                    accum.steps.clear();
                    accum.started = Instant::now();
                    accum.executed = None;
                }
            }
            Command::Finish { scenario, executed } => {
                if let Some(accum) = scenarios.get_mut(&scenario) {
                    accum.executed = Some(executed);
                }
            }
            Command::Deregister { scenario } => {
                scenarios.remove(&scenario);
            }
            Command::WarmUp { scenario, reply } => {
                let mut stats: Vec<WarmUpStepStats> = scenarios
                    .get(&scenario)
                    .map(|accum| {
                        accum
                            .steps
                            .iter()
                            .map(|(name, step)| WarmUpStepStats {
                                step_name: name.clone(),
                                ok_count: step.ok_count,
                                fail_count: step.fail_count,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                stats.sort_by(|a, b| a.step_name.cmp(&b.step_name));
                let _ = reply.send(stats);
            }
            Command::Snapshot { reply } => {
                let mut ordered: Vec<(&String, &ScenarioAccum)> = scenarios.iter().collect();
                ordered.sort_by_key(|(_, accum)| accum.order);

                let scenario_stats = ordered
                    .into_iter()
                    .map(|(name, accum)| {
                        let executed = accum.executed_duration();
                        let mut steps: Vec<(&String, &StepAccum)> = accum.steps.iter().collect();
                        steps.sort_by_key(|(_, step)| step.seq);
                        ScenarioStats {
                            scenario_name: name.clone(),
                            planned_duration: accum.planned,
                            executed_duration: executed,
                            step_stats: steps
                                .into_iter()
                                .map(|(step_name, step)| step.finalize(name, step_name, executed))
                                .collect(),
                        }
                    })
                    .collect();

                let _ = reply.send(NodeStats {
                    session_id: session.session_id.clone(),
                    node_name: session.node_name.clone(),
                    scenario_stats,
                    stop_reason: None,
                });
            }
        }
    }
}
