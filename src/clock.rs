//! Monotonic time source, injectable for tests.

use std::fmt::Debug;

use tokio::time::Instant;

/// Source of monotonic instants used for step latency measurement.
///
/// The default implementation reads the tokio clock, so tests running
/// under `tokio::time::pause` control it without a custom stub.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// The tokio runtime clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn paused_runtime_controls_the_clock() {
        let clock = TokioClock;
        let before = clock.now();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now() - before, Duration::from_millis(250));
    }
}
