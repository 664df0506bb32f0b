//! The session coordinator: top-level driver for a set of scenarios.
//!
//! Validates and configures the scenarios, opens every distinct connection
//! pool, runs init hooks, drives all scenario schedulers in parallel, then
//! runs clean hooks best-effort, closes the pools, and returns the final
//! statistics snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::config::{self, EngineConfig};
use crate::context::{ScenarioContext, SessionInfo, StopSignal};
use crate::error::{AppError, Result};
use crate::pipeline::StepPipeline;
use crate::pool::{resolved_pool_name, ConnectionPool, ConnectionPoolArgs, PoolContext};
use crate::report::Reporter;
use crate::scenario::{self, Scenario};
use crate::scheduler::ScenarioScheduler;
use crate::stats::{self, NodeStats, StatsHandle};
use crate::timeline::LoadTimeline;

/// Builder-style entry point for running a session.
pub struct SessionCoordinator {
    scenarios: Vec<Scenario>,
    config: EngineConfig,
    reporters: Vec<Arc<dyn Reporter>>,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self {
            scenarios,
            config: EngineConfig::default(),
            reporters: Vec::new(),
            clock: Arc::new(TokioClock),
            cancellation: CancellationToken::new(),
        }
    }

    /// Apply an external engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a reporting sink; it receives periodic snapshots and the
    /// final statistics.
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporters.push(Arc::new(reporter));
        self
    }

    /// Use an externally-owned cancellation token as the session token,
    /// e.g. wired to a ctrl-c handler.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[doc(hidden)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the whole session to completion.
    pub async fn run(self) -> Result<NodeStats> {
        let Self {
            mut scenarios,
            config,
            reporters,
            clock,
            cancellation,
        } = self;

        scenario::validate(&scenarios)?;
        config::apply(&config, &mut scenarios);
        if let Some(targets) = &config.target_scenarios {
            scenarios.retain(|scenario| targets.contains(&scenario.name));
        }
        let scenarios: Vec<Arc<Scenario>> = scenarios.into_iter().map(Arc::new).collect();

        // Compile every schedulable timeline up front so simulation errors
        // abort before any resource is touched. Scenarios without steps
        // only contribute their hooks.
        let mut timelines: HashMap<String, LoadTimeline> = HashMap::new();
        for scenario in scenarios.iter().filter(|s| !s.steps.is_empty()) {
            let timeline = LoadTimeline::compile(&scenario.name, &scenario.load_simulations)?;
            timelines.insert(scenario.name.clone(), timeline);
        }

        let session = SessionInfo::generate();
        let stop = StopSignal::new(cancellation.clone());
        info!(
            session = %session.session_id,
            scenarios = scenarios.len(),
            "session starting"
        );

        let pool_ctx = PoolContext {
            session: session.clone(),
            cancellation: cancellation.clone(),
        };
        let pools = match open_pools(&scenarios, &pool_ctx).await {
            Ok(pools) => Arc::new(pools),
            Err(err) => {
                error!(%err, "pool initialization failed; session aborted");
                return Err(err);
            }
        };

        if let Err(err) = run_init_hooks(&scenarios, &session, &cancellation).await {
            error!(%err, "init failed; session aborted");
            dispose_pools(&pools, &pool_ctx).await;
            return Err(err);
        }

        let (stats, stats_task) = stats::spawn(session.clone());
        for scenario in scenarios.iter().filter(|s| !s.steps.is_empty()) {
            stats.register(&scenario.name, timelines[&scenario.name].planned_duration());
        }

        let ticker_token = CancellationToken::new();
        let ticker = spawn_report_ticker(
            reporters.clone(),
            stats.clone(),
            config.reporting.send_stats_interval(),
            ticker_token.clone(),
        );

        let scheduled = scenarios.iter().filter(|s| !s.steps.is_empty()).count();
        let runs = scenarios
            .iter()
            .filter(|s| !s.steps.is_empty())
            .map(|scenario| {
                let timeline = timelines
                    .remove(&scenario.name)
                    .expect("timeline was compiled above");
                let pipeline = Arc::new(StepPipeline::new(
                    scenario.clone(),
                    pools.clone(),
                    stats.clone(),
                    clock.clone(),
                    stop.clone(),
                ));
                let scheduler = ScenarioScheduler::new(
                    scenario.clone(),
                    timeline,
                    pipeline,
                    stats.clone(),
                    stop.clone(),
                );
                async move { scheduler.run().await }
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(runs).await;

        if let Some(reason) = stop.reason() {
            info!(
                "{}",
                AppError::StopTestRequested {
                    reason: reason.to_string()
                }
            );
        }

        run_clean_hooks(&scenarios, &session, &cancellation).await;
        dispose_pools(&pools, &pool_ctx).await;

        ticker_token.cancel();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }

        let mut final_stats = stats.snapshot().await;
        final_stats.stop_reason = stop.reason().map(str::to_string);
        for reporter in &reporters {
            if let Err(error) = reporter.report(&final_stats).await {
                warn!(%error, "reporting sink failed on the final snapshot");
            }
        }
        drop(stats);
        let _ = stats_task.await;

        let mut first_err = None;
        let mut succeeded = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(done) => {
                    succeeded += 1;
                    info!(
                        scenario = %done.scenario_name,
                        executed = ?done.executed_duration,
                        planned = ?done.planned_duration,
                        "scenario completed"
                    );
                }
                Err(err) if first_err.is_none() => first_err = Some(err),
                Err(_) => {}
            }
        }
        if scheduled > 0 && succeeded == 0 {
            if let Some(err) = first_err {
                return Err(err);
            }
        }

        info!(session = %final_stats.session_id, "session finished");
        Ok(final_stats)
    }
}

/// Open every distinct pool (by resolved name) across all scenarios, in
/// parallel. On any failure the pools that did open are disposed.
async fn open_pools(
    scenarios: &[Arc<Scenario>],
    ctx: &PoolContext,
) -> Result<HashMap<String, Arc<ConnectionPool>>> {
    let mut declarations: Vec<(String, ConnectionPoolArgs)> = Vec::new();
    for scenario in scenarios {
        for args in scenario.steps.iter().filter_map(|step| step.pool_args.as_ref()) {
            let resolved = resolved_pool_name(&scenario.name, &args.name);
            if !declarations.iter().any(|(name, _)| *name == resolved) {
                declarations.push((resolved, args.clone()));
            }
        }
    }

    let opened = join_all(declarations.into_iter().map(|(name, args)| {
        let ctx = ctx.clone();
        async move {
            let mut pool = ConnectionPool::new(name.clone(), args);
            pool.init(&ctx).await?;
            Ok::<_, AppError>((name, Arc::new(pool)))
        }
    }))
    .await;

    let mut pools = HashMap::new();
    let mut failure = None;
    for result in opened {
        match result {
            Ok((name, pool)) => {
                pools.insert(name, pool);
            }
            Err(err) if failure.is_none() => failure = Some(err),
            Err(_) => {}
        }
    }
    if let Some(err) = failure {
        dispose_pools(&pools, ctx).await;
        return Err(err);
    }
    Ok(pools)
}

async fn dispose_pools(pools: &HashMap<String, Arc<ConnectionPool>>, ctx: &PoolContext) {
    join_all(pools.values().map(|pool| pool.dispose(ctx))).await;
}

async fn run_init_hooks(
    scenarios: &[Arc<Scenario>],
    session: &SessionInfo,
    cancellation: &CancellationToken,
) -> Result<()> {
    let jobs: Vec<_> = scenarios
        .iter()
        .filter_map(|scenario| {
            let hook = scenario.init.clone()?;
            let name = scenario.name.clone();
            let ctx = ScenarioContext {
                scenario_name: name.clone(),
                session: session.clone(),
                custom_settings: scenario.custom_settings.clone(),
                cancellation: cancellation.clone(),
            };
            Some(async move {
                hook(ctx).await.map_err(|cause| AppError::InitFailed {
                    scenario: name,
                    cause: cause.to_string(),
                })
            })
        })
        .collect();

    for result in join_all(jobs).await {
        result?;
    }
    Ok(())
}

/// Clean hooks are best-effort: failures are logged, never propagated.
async fn run_clean_hooks(
    scenarios: &[Arc<Scenario>],
    session: &SessionInfo,
    cancellation: &CancellationToken,
) {
    let jobs: Vec<_> = scenarios
        .iter()
        .filter_map(|scenario| {
            let hook = scenario.clean.clone()?;
            let name = scenario.name.clone();
            let ctx = ScenarioContext {
                scenario_name: name.clone(),
                session: session.clone(),
                custom_settings: scenario.custom_settings.clone(),
                cancellation: cancellation.clone(),
            };
            Some(async move { (name, hook(ctx).await) })
        })
        .collect();

    for (name, result) in join_all(jobs).await {
        if let Err(error) = result {
            warn!(scenario = %name, %error, "clean hook failed");
        }
    }
}

fn spawn_report_ticker(
    reporters: Vec<Arc<dyn Reporter>>,
    stats: StatsHandle,
    interval: std::time::Duration,
    token: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if reporters.is_empty() {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let snapshot = stats.snapshot().await;
                    for reporter in &reporters {
                        if let Err(error) = reporter.report(&snapshot).await {
                            warn!(%error, "reporting sink failed");
                        }
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::scenario::Step;
    use crate::timeline::LoadSimulation;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn init_only_session_runs_hooks_and_returns_empty_stats() {
        let ran_init = Arc::new(AtomicBool::new(false));
        let ran_clean = Arc::new(AtomicBool::new(false));
        let init_flag = ran_init.clone();
        let clean_flag = ran_clean.clone();

        let scenario = Scenario::builder()
            .name("setup")
            .build()
            .with_init(move |_ctx| {
                let flag = init_flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_clean(move |_ctx| {
                let flag = clean_flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

        let stats = SessionCoordinator::new(vec![scenario]).run().await.unwrap();
        assert!(ran_init.load(Ordering::SeqCst));
        assert!(ran_clean.load(Ordering::SeqCst));
        assert!(stats.scenario_stats.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_init_aborts_and_disposes_pools() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_in_args = closed.clone();
        let args = ConnectionPoolArgs::new(
            "db",
            2,
            |index, _ctx| async move { Ok(index) },
            move |_conn: Arc<usize>, _ctx| {
                let closed = closed_in_args.clone();
                async move {
                    closed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![
                Step::new("a", |_ctx| async { Response::ok() }).with_pool(args)
            ])
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(1),
            }])
            .build()
            .with_init(|_ctx| async { Err("bad config".into()) });

        let err = SessionCoordinator::new(vec![scenario]).run().await.unwrap_err();
        assert!(matches!(err, AppError::InitFailed { scenario, .. } if scenario == "s"));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn target_scenarios_filters_the_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let make = |name: &str| {
            let ran = ran.clone();
            Scenario::builder()
                .name(name)
                .steps(vec![Step::new("tick", move |_ctx| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Response::ok()
                    }
                })])
                .load_simulations(vec![LoadSimulation::KeepConstant {
                    copies: 1,
                    during: Duration::from_millis(500),
                }])
                .build()
        };
        let config = EngineConfig {
            target_scenarios: Some(vec!["wanted".into()]),
            ..EngineConfig::default()
        };

        let stats = SessionCoordinator::new(vec![make("wanted"), make("ignored")])
            .with_config(config)
            .run()
            .await
            .unwrap();
        assert_eq!(stats.scenario_stats.len(), 1);
        assert_eq!(stats.scenario_stats[0].scenario_name, "wanted");
        assert!(ran.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_clean_does_not_fail_the_session() {
        let scenario = Scenario::builder()
            .name("s")
            .steps(vec![Step::new("work", |_ctx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Response::ok()
            })])
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_millis(300),
            }])
            .build()
            .with_clean(|_ctx| async { Err("cleanup exploded".into()) });

        let stats = SessionCoordinator::new(vec![scenario]).run().await.unwrap();
        assert_eq!(stats.scenario_stats.len(), 1);
    }
}
