//! Stampede, a load-testing engine for Rust.
//!
//! Stampede drives user-defined request pipelines against a target under
//! controlled concurrency profiles and aggregates per-operation latency and
//! throughput statistics.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`] / [`Step`]: the workload definition, a named pipeline of
//!   asynchronous steps, lifecycle hooks, and a load-simulation list.
//! - [`LoadSimulation`] / [`LoadTimeline`]: declarative load phases
//!   compiled into a time-indexed schedule of target concurrency (closed
//!   models) and injection rate (open models).
//! - [`ConnectionPoolArgs`]: a named, bounded set of externally-opened
//!   connections shared by a scenario's steps; copy `c` reads slot
//!   `c mod count`.
//! - [`Feed`]: a lazy item source delivering per-step inputs.
//! - [`SessionCoordinator`]: the driver that validates scenarios, applies
//!   the [`EngineConfig`], opens pools, runs hooks, schedules every
//!   scenario in parallel, and returns the final [`NodeStats`].
//! - [`Reporter`]: the I/O boundary, sinks receiving periodic and final
//!   statistics snapshots.
//!
//! Each live virtual user (copy) is a lightweight tokio task running the
//! step pipeline; a scenario routinely drives thousands of them. All
//! termination is cooperative: retiring a copy lets it finish its current
//! step, and a step may end the whole session with
//! [`Response::stop_test`] or `StepContext::stop_current_test`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stampede::{
//!     LoadSimulation, Response, Scenario, SessionCoordinator, Step, StdoutReporter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stampede::AppError> {
//!     let scenario = Scenario::builder()
//!         .name("hello")
//!         .steps(vec![Step::new("wait", |_ctx| async {
//!             tokio::time::sleep(Duration::from_millis(50)).await;
//!             Response::ok()
//!         })])
//!         .load_simulations(vec![LoadSimulation::KeepConstant {
//!             copies: 10,
//!             during: Duration::from_secs(30),
//!         }])
//!         .build();
//!
//!     let stats = SessionCoordinator::new(vec![scenario])
//!         .with_reporter(StdoutReporter)
//!         .run()
//!         .await?;
//!     println!("scenarios: {}", stats.scenario_stats.len());
//!     Ok(())
//! }
//! ```

/// Command-line surface for embedding binaries
pub mod cli;
/// Injectable monotonic time source
pub mod clock;
/// External engine configuration
pub mod config;
/// Contexts handed to user code
pub mod context;
/// Error taxonomy
pub mod error;
/// Lazy per-step data streams
pub mod feed;
/// One virtual-user pass through the steps
mod pipeline;
/// Shared connection pools
pub mod pool;
/// Reporting sinks
pub mod report;
/// Step outcomes
pub mod response;
/// Workload definitions
pub mod scenario;
/// Per-scenario scheduling
mod scheduler;
/// The top-level session driver
pub mod session;
/// Statistics aggregation
pub mod stats;
/// Load simulations and their compiled schedule
pub mod timeline;

pub use cli::Cli;
pub use config::EngineConfig;
pub use context::{CorrelationId, ScenarioContext, SessionInfo, StepContext};
pub use error::{AppError, Result, UserError};
pub use feed::Feed;
pub use pool::{ConnectionPoolArgs, PoolContext};
pub use report::{Reporter, StdoutReporter};
pub use response::{ExitCode, Response};
pub use scenario::{Scenario, Step};
pub use session::SessionCoordinator;
pub use stats::{NodeStats, ScenarioStats, StepStats};
pub use timeline::{LoadSimulation, LoadTimeline};
