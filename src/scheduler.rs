//! The per-scenario scheduler.
//!
//! Drives one scenario through its warm-up and main phases. Every tick the
//! compiled timeline is consulted: closed intervals give a target number
//! of live copies (spawn the shortfall, retire the excess LIFO), open
//! intervals give an injection rate turned into discrete spawns with a
//! fractional accumulator carried across ticks so the long-run count
//! matches the integrated rate.
//!
//! Copies are cooperative tasks: retirement trips a child token and the
//! copy finishes its current step before exiting. At end of plan, stop
//! request, or external cancellation, all copies are cancelled and
//! awaited under a grace period; stragglers are abandoned with a warning.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::context::{CorrelationId, StopSignal};
use crate::error::Result;
use crate::pipeline::{CopyState, StepPipeline};
use crate::scenario::Scenario;
use crate::stats::{validate_warm_up, StatsHandle};
use crate::timeline::{LoadMode, LoadSimulation, LoadTimeline};

/// Scheduling loop cadence. 100 ms keeps injection error bounded for open
/// models; closed targets change at coarser granularity anyway.
pub(crate) const TICK: Duration = Duration::from_millis(100);

/// How long retired copies get to finish their current step before being
/// abandoned.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How a finished scenario run went.
#[derive(Debug, Clone)]
pub(crate) struct ScenarioOutcome {
    pub scenario_name: String,
    pub planned_duration: Duration,
    pub executed_duration: Duration,
}

pub(crate) struct ScenarioScheduler {
    scenario: Arc<Scenario>,
    timeline: LoadTimeline,
    pipeline: Arc<StepPipeline>,
    stats: StatsHandle,
    stop: StopSignal,
}

impl ScenarioScheduler {
    pub fn new(
        scenario: Arc<Scenario>,
        timeline: LoadTimeline,
        pipeline: Arc<StepPipeline>,
        stats: StatsHandle,
        stop: StopSignal,
    ) -> Self {
        Self {
            scenario,
            timeline,
            pipeline,
            stats,
            stop,
        }
    }

    /// Warm-up phase (when configured), warm-up health check, stats reset,
    /// then the main phase.
    pub async fn run(&self) -> Result<ScenarioOutcome> {
        let name = &self.scenario.name;
        let mut next_copy_number = 0u64;

        if let Some(warm_up) = self.scenario.warm_up_duration.filter(|d| !d.is_zero()) {
            info!(scenario = %name, duration = ?warm_up, "warm-up starting");
            let warm_timeline = LoadTimeline::compile(
                name,
                &[LoadSimulation::KeepConstant {
                    copies: 1,
                    during: warm_up,
                }],
            )?;
            self.run_phase(&warm_timeline, &mut next_copy_number).await;

            let warm_stats = self.stats.warm_up_stats(name).await;
            if let Err(err) = validate_warm_up(&warm_stats) {
                error!(scenario = %name, %err, "warm-up failed; scenario aborted");
                self.stats.deregister(name);
                return Err(err);
            }
            self.stats.reset(name);
        }

        info!(scenario = %name, planned = ?self.timeline.planned_duration(), "main phase starting");
        let executed = self.run_phase(&self.timeline, &mut next_copy_number).await;
        self.stats.finish(name, executed);
        info!(scenario = %name, executed = ?executed, "scenario finished");

        Ok(ScenarioOutcome {
            scenario_name: name.clone(),
            planned_duration: self.timeline.planned_duration(),
            executed_duration: executed,
        })
    }

    /// One phase: tick until the plan runs out or the session stops, then
    /// drain. Returns the executed duration, capped at the plan.
    async fn run_phase(&self, timeline: &LoadTimeline, next_copy_number: &mut u64) -> Duration {
        let planned = timeline.planned_duration();
        let phase_start = Instant::now();
        let copies_parent = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut live: Vec<(u64, CancellationToken)> = Vec::new();
        let mut carry = 0.0_f64;
        let mut next_tick = phase_start;

        loop {
            if self.stop.is_stopped() {
                break;
            }
            let elapsed = phase_start.elapsed();
            if elapsed >= planned {
                break;
            }
            let Some(point) = timeline.target_at(elapsed) else {
                break;
            };

            match point.mode {
                LoadMode::Closed => {
                    let target = point.copies as usize;
                    while live.len() < target {
                        let copy_number = *next_copy_number;
                        *next_copy_number += 1;
                        let token = copies_parent.child_token();
                        live.push((copy_number, token.clone()));
                        self.spawn_looping_copy(&tracker, copy_number, token);
                    }
                    while live.len() > target {
                        let (copy_number, token) = live.pop().expect("live is non-empty");
                        debug!(scenario = %self.scenario.name, copy_number, "retiring copy");
                        token.cancel();
                    }
                }
                LoadMode::Open => {
                    let (spawn_now, next_carry) = injection_for_tick(point.rate, TICK, carry);
                    carry = next_carry;
                    for _ in 0..spawn_now {
                        let copy_number = *next_copy_number;
                        *next_copy_number += 1;
                        self.spawn_one_shot_copy(&tracker, copy_number, copies_parent.child_token());
                    }
                }
            }

            next_tick += TICK;
            tokio::select! {
                _ = sleep_until(next_tick) => {}
                _ = self.stop.cancelled() => break,
            }
        }

        copies_parent.cancel();
        tracker.close();
        if timeout(DRAIN_GRACE, tracker.wait()).await.is_err() {
            warn!(
                scenario = %self.scenario.name,
                grace = ?DRAIN_GRACE,
                "copies did not finish within the grace period; abandoning them"
            );
        }

        phase_start.elapsed().min(planned)
    }

    /// A closed-model copy: repeats the pipeline until retired or the
    /// session stops.
    fn spawn_looping_copy(&self, tracker: &TaskTracker, copy_number: u64, token: CancellationToken) {
        let pipeline = self.pipeline.clone();
        let stop = self.stop.clone();
        let scenario_name = self.scenario.name.clone();
        let has_steps = !self.scenario.steps.is_empty();
        tracker.spawn(async move {
            let correlation = CorrelationId::new(&scenario_name, copy_number);
            let mut state = CopyState::new();
            if !has_steps {
                token.cancelled().await;
                return;
            }
            while !token.is_cancelled() && !stop.is_stopped() {
                pipeline.run_once(&correlation, &token, &mut state).await;
                // A pipeline of never-suspending steps must not starve the
                // tick loop.
                tokio::task::yield_now().await;
            }
        });
    }

    /// An open-model copy: runs the pipeline exactly once.
    fn spawn_one_shot_copy(&self, tracker: &TaskTracker, copy_number: u64, token: CancellationToken) {
        let pipeline = self.pipeline.clone();
        let scenario_name = self.scenario.name.clone();
        let has_steps = !self.scenario.steps.is_empty();
        tracker.spawn(async move {
            if !has_steps {
                return;
            }
            let correlation = CorrelationId::new(&scenario_name, copy_number);
            let mut state = CopyState::new();
            pipeline.run_once(&correlation, &token, &mut state).await;
        });
    }
}

/// How many copies to inject this tick at the given instantaneous rate.
/// The fractional remainder is returned so the caller carries it into the
/// next tick, preserving the long-run average.
pub(crate) fn injection_for_tick(rate: f64, tick: Duration, carry: f64) -> (u64, f64) {
    let add = rate.max(0.0) * tick.as_secs_f64() + carry;
    let whole = add.floor() as u64;
    (whole, add - whole as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::context::SessionInfo;
    use crate::response::Response;
    use crate::scenario::Step;
    use crate::stats;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn injection_carry_preserves_the_integrated_rate() {
        let tick = Duration::from_millis(100);
        let mut carry = 0.0;
        let mut spawned = 0u64;
        // 3.5 copies/sec over 10 seconds of ticks
        for _ in 0..100 {
            let (now, next_carry) = injection_for_tick(3.5, tick, carry);
            carry = next_carry;
            spawned += now;
        }
        assert_eq!(spawned, 35);
    }

    proptest! {
        #[test]
        fn integrated_injection_matches_the_rate(rate in 0.0f64..200.0, secs in 1u64..60) {
            let mut carry = 0.0;
            let mut spawned = 0u64;
            for _ in 0..secs * 10 {
                let (now, next_carry) = injection_for_tick(rate, TICK, carry);
                carry = next_carry;
                spawned += now;
            }
            let expected = rate * secs as f64;
            prop_assert!((spawned as f64 - expected).abs() <= 1.0);
        }
    }

    #[test]
    fn fractional_rates_are_not_lost() {
        let tick = Duration::from_millis(100);
        let mut carry = 0.0;
        let mut spawned = 0u64;
        // 0.3 copies/sec: a naive per-tick rounding would spawn nothing
        for _ in 0..100 {
            let (now, next_carry) = injection_for_tick(0.3, tick, carry);
            carry = next_carry;
            spawned += now;
        }
        assert_eq!(spawned, 3);
    }

    fn harness(scenario: Scenario) -> (ScenarioScheduler, StatsHandle, StopSignal) {
        let (stats, _task) = stats::spawn(SessionInfo {
            session_id: "session-test".into(),
            node_name: "localhost".into(),
        });
        let scenario = Arc::new(scenario);
        let timeline =
            LoadTimeline::compile(&scenario.name, &scenario.load_simulations).unwrap();
        stats.register(&scenario.name, timeline.planned_duration());
        let stop = StopSignal::new(CancellationToken::new());
        let pipeline = Arc::new(StepPipeline::new(
            scenario.clone(),
            Arc::new(HashMap::new()),
            stats.clone(),
            Arc::new(TokioClock),
            stop.clone(),
        ));
        let scheduler = ScenarioScheduler::new(scenario, timeline, pipeline, stats.clone(), stop.clone());
        (scheduler, stats, stop)
    }

    fn sleepy_step(name: &str, ms: u64, ok: bool) -> Step {
        Step::new(name, move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if ok {
                Response::ok()
            } else {
                Response::fail()
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn keep_constant_runs_to_plan() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![sleepy_step("work", 100, true)])
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 2,
                during: Duration::from_secs(2),
            }])
            .build();
        let (scheduler, stats, _stop) = harness(scenario);

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.executed_duration, Duration::from_secs(2));

        let snapshot = stats.snapshot().await;
        let step = &snapshot.scenario_stats[0].step_stats[0];
        // two copies at ~10 passes/sec for 2 seconds
        assert!(step.ok_count >= 30, "ok_count = {}", step.ok_count);
        assert!(step.ok_count <= 42, "ok_count = {}", step.ok_count);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_truncates_the_run() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![Step::new("stopper", |ctx| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if ctx.invocation_count >= 3 {
                    ctx.stop_current_test("enough");
                }
                Response::ok()
            })])
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(60),
            }])
            .build();
        let (scheduler, _stats, stop) = harness(scenario);

        let outcome = scheduler.run().await.unwrap();
        assert!(outcome.executed_duration < Duration::from_secs(60));
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some("enough"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_warm_up_aborts_before_the_main_phase() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![sleepy_step("broken", 100, false)])
            .warm_up_duration(Some(Duration::from_secs(1)))
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(30),
            }])
            .build();
        let (scheduler, stats, _stop) = harness(scenario);

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::WarmUpErrorWithManyFailedSteps { .. }
        ));
        // the aborted scenario is excluded from reporting
        let snapshot = stats.snapshot().await;
        assert!(snapshot.scenario_stats.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_model_injects_the_integrated_count() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![sleepy_step("shot", 10, true)])
            .load_simulations(vec![LoadSimulation::InjectPerSec {
                rate: 5.0,
                during: Duration::from_secs(4),
            }])
            .build();
        let (scheduler, stats, _stop) = harness(scenario);

        scheduler.run().await.unwrap();
        let snapshot = stats.snapshot().await;
        let step = &snapshot.scenario_stats[0].step_stats[0];
        let total = step.ok_count + step.fail_count;
        assert!((19..=21).contains(&total), "total = {total}");
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_resets_invocation_counts_for_the_main_phase() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![Step::new("observer", |ctx| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                // the response carries the invocation count as latency so
                // the test can observe it through stats
                Response::ok().with_latency(ctx.invocation_count)
            })])
            .warm_up_duration(Some(Duration::from_secs(5)))
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(5),
            }])
            .build();
        let (scheduler, stats, _stop) = harness(scenario);

        scheduler.run().await.unwrap();
        let snapshot = stats.snapshot().await;
        let step = &snapshot.scenario_stats[0].step_stats[0];
        assert!(step.min_ms >= 1.0, "min = {}", step.min_ms);
        assert!(step.max_ms <= 6.0, "max = {}", step.max_ms);
    }
}
