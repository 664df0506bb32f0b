//! Execution contexts handed to user code.
//!
//! Hooks receive a [`ScenarioContext`]; step bodies receive a
//! [`StepContext`] owning everything one step execution may touch: the
//! virtual user's identity, its cancellation token, the pooled connection,
//! the feed item, and the previous step's payload. Contexts are owned by
//! exactly one virtual user and never shared.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::feed::FeedItem;
use crate::pool::PoolConnection;
use crate::response::Payload;

/// Identifies one virtual user within its scenario for the lifetime of
/// that copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId {
    pub id: String,
    pub scenario_name: String,
    pub copy_number: u64,
}

impl CorrelationId {
    pub fn new(scenario_name: &str, copy_number: u64) -> Self {
        Self {
            id: format!("{scenario_name}_{copy_number}"),
            scenario_name: scenario_name.to_string(),
            copy_number,
        }
    }
}

/// Session-wide identity shared with hooks and pool callbacks.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub session_id: String,
    pub node_name: String,
}

impl SessionInfo {
    pub(crate) fn generate() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            session_id: format!("session-{millis}"),
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
        }
    }
}

/// Handle that cooperatively terminates the whole session. The first
/// reason supplied wins; later calls are no-ops.
#[derive(Clone, Debug)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl StopSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn stop(&self, reason: &str) {
        let _ = self.reason.set(reason.to_string());
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session is stopping.
    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

/// Context for a scenario's init and clean hooks.
#[derive(Clone, Debug)]
pub struct ScenarioContext {
    pub scenario_name: String,
    pub session: SessionInfo,
    /// Free-form settings string from the engine config; empty when none
    /// were supplied or when parsing upstream failed.
    pub custom_settings: String,
    pub cancellation: CancellationToken,
}

/// Everything one step execution may touch.
pub struct StepContext {
    pub correlation_id: CorrelationId,
    /// The copy's token; user code may select on it to cooperate with
    /// retirement.
    pub cancellation: CancellationToken,
    /// How many pipeline passes this copy has begun, this phase. Starts
    /// at 1.
    pub invocation_count: u64,
    pub(crate) connection: Option<PoolConnection>,
    pub(crate) feed_item: Option<FeedItem>,
    pub(crate) previous: Option<Payload>,
    pub(crate) stop: StopSignal,
}

impl StepContext {
    /// Typed view of this copy's pooled connection.
    pub fn connection<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.connection.clone()?.downcast::<T>().ok()
    }

    /// Typed view of the item pulled from the step's feed.
    pub fn feed_item<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.feed_item.clone()?.downcast::<T>().ok()
    }

    /// Typed view of the previous step's payload. `None` when there was no
    /// previous step, it carried no payload, or the type does not match.
    pub fn previous_step_response<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.previous.clone()?.downcast::<T>().ok()
    }

    /// Request cooperative termination of the session. The current step's
    /// response is still processed normally.
    pub fn stop_current_test(&self, reason: &str) {
        self.stop.stop(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_concatenates_scenario_and_copy() {
        let id = CorrelationId::new("checkout", 7);
        assert_eq!(id.id, "checkout_7");
        assert_eq!(id.copy_number, 7);
    }

    #[test]
    fn stop_signal_keeps_first_reason() {
        let stop = StopSignal::new(CancellationToken::new());
        assert!(!stop.is_stopped());
        stop.stop("threshold reached");
        stop.stop("second caller");
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some("threshold reached"));
    }

    #[test]
    fn typed_reads_reject_wrong_types() {
        let ctx = StepContext {
            correlation_id: CorrelationId::new("s", 0),
            cancellation: CancellationToken::new(),
            invocation_count: 1,
            connection: None,
            feed_item: Some(Arc::new(42u32)),
            previous: Some(Arc::new("payload".to_string())),
            stop: StopSignal::new(CancellationToken::new()),
        };
        assert_eq!(*ctx.feed_item::<u32>().unwrap(), 42);
        assert!(ctx.feed_item::<String>().is_none());
        assert_eq!(*ctx.previous_step_response::<String>().unwrap(), "payload");
        assert!(ctx.connection::<u32>().is_none());
    }
}
