//! The workload definition layer.
//!
//! A [`Scenario`] is a named pipeline of [`Step`]s plus lifecycle hooks and
//! a load-simulation list. Scenarios are configuration objects: built with
//! the typed builder, optionally adjusted by external settings, then handed
//! to the session coordinator which drives them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::context::{ScenarioContext, StepContext};
use crate::error::{AppError, Result, UserError};
use crate::feed::Feed;
use crate::pool::ConnectionPoolArgs;
use crate::response::Response;
use crate::timeline::LoadSimulation;

/// Type-erased step body.
pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Response> + Send + Sync>;

/// Type-erased init/clean hook.
pub type HookFn = Arc<
    dyn Fn(ScenarioContext) -> BoxFuture<'static, std::result::Result<(), UserError>>
        + Send
        + Sync,
>;

/// Produces the step execution order for one pipeline pass: indices into
/// `scenario.steps`.
pub type StepsOrderFn = Arc<dyn Fn() -> Vec<usize> + Send + Sync>;

/// One operation within a scenario.
///
/// Step names within a scenario need not be unique; repeating a name reuses
/// its identity for stats aggregation.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub(crate) pool_args: Option<ConnectionPoolArgs>,
    pub(crate) feed: Option<Feed>,
    pub(crate) execute: StepFn,
    pub do_not_track: bool,
}

impl Step {
    /// A step executing the given async body.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self {
            name: name.into(),
            pool_args: None,
            feed: None,
            execute: Arc::new(move |ctx| -> BoxFuture<'static, Response> {
                Box::pin(execute(ctx))
            }),
            do_not_track: false,
        }
    }

    /// The built-in pause step: sleeps for `duration` (cooperating with the
    /// copy's cancellation token) and succeeds. Never tracked in stats.
    pub fn pause(duration: Duration) -> Self {
        let mut step = Self::new("pause", move |ctx: StepContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = ctx.cancellation.cancelled() => {}
            }
            Response::ok()
        });
        step.do_not_track = true;
        step
    }

    /// Bind this step to a connection pool declaration.
    pub fn with_pool(mut self, args: ConnectionPoolArgs) -> Self {
        self.pool_args = Some(args);
        self
    }

    /// Bind this step to a feed; one item is pulled per execution.
    pub fn with_feed(mut self, feed: Feed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Exclude this step from statistics and from the reported step list.
    pub fn untracked(mut self) -> Self {
        self.do_not_track = true;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("pool", &self.pool_args.as_ref().map(|args| &args.name))
            .field("feed", &self.feed.as_ref().map(Feed::name))
            .field("do_not_track", &self.do_not_track)
            .finish()
    }
}

/// A named pipeline driven under a load profile.
#[derive(Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub steps: Vec<Step>,
    /// Preliminary phase with unit concurrency; its statistics are used
    /// only for sanity checking and discarded before the main run.
    #[builder(default)]
    pub warm_up_duration: Option<Duration>,
    #[builder(default)]
    pub load_simulations: Vec<LoadSimulation>,
    /// Free-form settings string forwarded to the init hook's context.
    #[builder(default, setter(into))]
    pub custom_settings: String,
    #[builder(default, setter(skip))]
    pub(crate) init: Option<HookFn>,
    #[builder(default, setter(skip))]
    pub(crate) clean: Option<HookFn>,
    #[builder(default, setter(skip))]
    pub(crate) steps_order: Option<StepsOrderFn>,
}

impl Scenario {
    /// Attach an init hook, run once at session start.
    pub fn with_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), UserError>> + Send + 'static,
    {
        self.init = Some(Arc::new(
            move |ctx| -> BoxFuture<'static, std::result::Result<(), UserError>> {
                Box::pin(hook(ctx))
            },
        ));
        self
    }

    /// Attach a clean hook, run best-effort at session end.
    pub fn with_clean<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ScenarioContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), UserError>> + Send + 'static,
    {
        self.clean = Some(Arc::new(
            move |ctx| -> BoxFuture<'static, std::result::Result<(), UserError>> {
                Box::pin(hook(ctx))
            },
        ));
        self
    }

    /// Override the step execution order. Called once per pipeline pass;
    /// returns indices into `steps`. Invalid indices are skipped.
    pub fn with_steps_order<F>(mut self, order: F) -> Self
    where
        F: Fn() -> Vec<usize> + Send + Sync + 'static,
    {
        self.steps_order = Some(Arc::new(order));
        self
    }

    /// The execution order for one pass; identity when no override is set.
    pub(crate) fn steps_order(&self) -> Vec<usize> {
        match &self.steps_order {
            Some(order) => order(),
            None => (0..self.steps.len()).collect(),
        }
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("warm_up_duration", &self.warm_up_duration)
            .field("load_simulations", &self.load_simulations)
            .finish()
    }
}

/// Session-level validation, run before any side effect.
pub(crate) fn validate(scenarios: &[Scenario]) -> Result<()> {
    use std::collections::{BTreeSet, HashMap};

    if scenarios.iter().any(|scenario| scenario.name.is_empty()) {
        return Err(AppError::EmptyScenarioName);
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for scenario in scenarios {
        if !seen.insert(scenario.name.as_str()) {
            duplicates.insert(scenario.name.clone());
        }
    }
    if !duplicates.is_empty() {
        return Err(AppError::DuplicateScenarioName {
            names: duplicates.into_iter().collect(),
        });
    }

    for scenario in scenarios {
        if scenario.steps.is_empty() && scenario.init.is_none() && scenario.clean.is_none() {
            return Err(AppError::EmptySteps {
                scenario: scenario.name.clone(),
            });
        }
        if scenario.steps.iter().any(|step| step.name.is_empty()) {
            return Err(AppError::EmptyStepName {
                scenario: scenario.name.clone(),
            });
        }

        let mut pools: HashMap<&str, &ConnectionPoolArgs> = HashMap::new();
        for args in scenario
            .steps
            .iter()
            .filter_map(|step| step.pool_args.as_ref())
        {
            match pools.get(args.name.as_str()) {
                Some(existing) if !existing.same_instance(args) => {
                    return Err(AppError::DuplicateConnectionPoolName {
                        scenario: scenario.name.clone(),
                        pool: args.name.clone(),
                    });
                }
                _ => {
                    pools.insert(args.name.as_str(), args);
                }
            }
        }
    }

    Ok(())
}
