//! Error types for the engine.
//!
//! One tag per failure kind, propagated by value. Validation errors are
//! produced before any side effect; resource errors roll back whatever was
//! already acquired; runtime errors surface in the session result.

use thiserror::Error;

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Boxed error produced by user-supplied callbacks (step bodies excepted;
/// those report failure through their `Response`).
pub type UserError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum AppError {
    /// A scenario was registered with an empty name.
    #[error("scenario name must not be empty")]
    EmptyScenarioName,

    /// Two or more scenarios share a name within one session.
    #[error("duplicate scenario names: {names:?}")]
    DuplicateScenarioName { names: Vec<String> },

    /// A scenario has no steps and neither an init nor a clean hook.
    #[error("scenario '{scenario}' has no steps and no init/clean hook")]
    EmptySteps { scenario: String },

    /// A step within the scenario has an empty name.
    #[error("scenario '{scenario}' contains a step with an empty name")]
    EmptyStepName { scenario: String },

    /// The same pool name is declared by distinct pool instances within
    /// one scenario.
    #[error("scenario '{scenario}' declares connection pool '{pool}' with conflicting instances")]
    DuplicateConnectionPoolName { scenario: String, pool: String },

    /// A scenario was registered with an empty load-simulation list.
    #[error("scenario '{scenario}' has no load simulations")]
    EmptyLoadSimulations { scenario: String },

    /// A load simulation declares a non-positive duration.
    #[error("scenario '{scenario}': load simulation '{simulation}' has a non-positive duration")]
    InvalidDuration { scenario: String, simulation: String },

    /// Opening one of a pool's connections failed; the session aborts and
    /// already-opened connections are closed.
    #[error("connection pool '{pool}' failed to open connection {index}: {cause}")]
    PoolOpenFailed {
        pool: String,
        index: usize,
        cause: String,
    },

    /// A scenario's init hook failed; the session aborts.
    #[error("scenario '{scenario}' init failed: {cause}")]
    InitFailed { scenario: String, cause: String },

    /// The warm-up phase observed more failures than successes on a step.
    #[error("warm-up found a step with more failures than successes: ok {ok}, failed {fail}")]
    WarmUpErrorWithManyFailedSteps { ok: u64, fail: u64 },

    /// A step requested cooperative termination of the whole session.
    /// Success-like: the session still returns its statistics.
    #[error("stop test requested: {reason}")]
    StopTestRequested { reason: String },

    /// The config file could not be read or parsed.
    #[error("failed to parse config '{path}': {cause}")]
    ConfigParseFailed { path: String, cause: String },

    /// The config file extension maps to no supported format.
    #[error("unsupported config format: '{ext}'")]
    UnsupportedConfigFormat { ext: String },
}
