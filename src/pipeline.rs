//! The step pipeline: one pass of one virtual user through its scenario.
//!
//! Each pass asks the scenario for a step order, then runs the steps
//! sequentially: acquire the copy's pooled connection, pull a feed item,
//! execute the user body, measure latency, report the outcome, and hand
//! the response payload to the next step. A panicking step body becomes a
//! failed response, never a dead copy.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::Clock;
use crate::context::{CorrelationId, StepContext, StopSignal};
use crate::pool::{resolved_pool_name, ConnectionPool};
use crate::response::{ExitCode, Payload, Response};
use crate::scenario::Scenario;
use crate::stats::{StatsHandle, StepOutcome};

/// State owned by exactly one copy, never shared.
pub(crate) struct CopyState {
    /// Pipeline passes begun by this copy, this phase.
    pub invocation_count: u64,
    warned_invalid_order: bool,
}

impl CopyState {
    pub fn new() -> Self {
        Self {
            invocation_count: 0,
            warned_invalid_order: false,
        }
    }
}

/// Drives one virtual user through one pass of the scenario's steps.
pub(crate) struct StepPipeline {
    scenario: Arc<Scenario>,
    pools: Arc<HashMap<String, Arc<ConnectionPool>>>,
    stats: StatsHandle,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl StepPipeline {
    pub fn new(
        scenario: Arc<Scenario>,
        pools: Arc<HashMap<String, Arc<ConnectionPool>>>,
        stats: StatsHandle,
        clock: Arc<dyn Clock>,
        stop: StopSignal,
    ) -> Self {
        Self {
            scenario,
            pools,
            stats,
            clock,
            stop,
        }
    }

    /// One pass. Returns early between steps when the copy is cancelled or
    /// the session is stopping.
    pub async fn run_once(
        &self,
        correlation: &CorrelationId,
        token: &CancellationToken,
        state: &mut CopyState,
    ) {
        state.invocation_count += 1;
        let order = self.scenario.steps_order();
        let mut previous: Option<Payload> = None;

        for index in order {
            if token.is_cancelled() || self.stop.is_stopped() {
                return;
            }

            let Some(step) = self.scenario.steps.get(index) else {
                if !state.warned_invalid_order {
                    warn!(
                        copy = %correlation.id,
                        index,
                        "steps order returned an index out of range; skipping"
                    );
                    state.warned_invalid_order = true;
                }
                continue;
            };

            let connection = step.pool_args.as_ref().and_then(|args| {
                let name = resolved_pool_name(&correlation.scenario_name, &args.name);
                self.pools
                    .get(&name)
                    .and_then(|pool| pool.get(correlation.copy_number))
            });
            let feed_item = match &step.feed {
                Some(feed) => feed.pull().await,
                None => None,
            };

            let ctx = StepContext {
                correlation_id: correlation.clone(),
                cancellation: token.clone(),
                invocation_count: state.invocation_count,
                connection,
                feed_item,
                previous: previous.take(),
                stop: self.stop.clone(),
            };

            let started = self.clock.now();
            let mut response = match AssertUnwindSafe((step.execute)(ctx)).catch_unwind().await {
                Ok(response) => response,
                Err(_) => {
                    warn!(copy = %correlation.id, step = %step.name, "step body panicked");
                    Response::fail()
                }
            };
            let latency_ms = match response.latency_ms {
                Some(ms) => ms as f64,
                None => (self.clock.now() - started).as_secs_f64() * 1000.0,
            };

            if !step.do_not_track {
                self.stats.record(StepOutcome {
                    scenario_name: correlation.scenario_name.clone(),
                    step_name: step.name.clone(),
                    ok: response.ok,
                    latency_ms,
                    size_bytes: response.size_bytes,
                });
            }

            previous = response.take_payload();

            if response.exit_code == ExitCode::StopTest {
                self.stop
                    .stop(&format!("step '{}' requested stop", step.name));
            }
        }
    }
}
