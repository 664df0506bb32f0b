//! Reporting sinks.
//!
//! A [`Reporter`] consumes [`NodeStats`] snapshots and performs side
//! effects: printing, shipping to a service, persisting. The computation
//! layer stays pure; reporters are the I/O boundary. The coordinator calls
//! every registered sink on the reporting interval and once more with the
//! final statistics.

use async_trait::async_trait;

use crate::error::UserError;
use crate::stats::NodeStats;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, stats: &NodeStats) -> Result<(), UserError>;
}

/// Prints each snapshot as pretty JSON to stdout.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, stats: &NodeStats) -> Result<(), UserError> {
        let text = serde_json::to_string_pretty(stats)?;
        println!("{text}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdout_reporter_serializes_node_stats() {
        let stats = NodeStats {
            session_id: "session-1".into(),
            node_name: "localhost".into(),
            scenario_stats: Vec::new(),
            stop_reason: None,
        };
        StdoutReporter.report(&stats).await.unwrap();
    }
}
