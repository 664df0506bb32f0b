//! The step outcome value.
//!
//! A step body returns a [`Response`] describing what happened: success or
//! failure, an optional payload handed to the next step, the transferred
//! size, an optional latency override, and an exit code that can request
//! cooperative termination of the whole session.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased value carried between steps and into statistics sizing.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// What the engine should do after observing a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExitCode {
    /// Keep running.
    #[default]
    Continue,
    /// Terminate the session cooperatively at the next step boundary.
    StopTest,
}

/// Outcome of one step execution.
#[derive(Clone, Default)]
pub struct Response {
    pub ok: bool,
    payload: Option<Payload>,
    pub size_bytes: u64,
    /// When set, overrides the measured latency in statistics.
    pub latency_ms: Option<u64>,
    pub exit_code: ExitCode,
}

impl Response {
    /// A successful response with no payload.
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// A successful response carrying raw bytes; `size_bytes` defaults to
    /// the payload length.
    pub fn ok_data(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            ok: true,
            size_bytes: size,
            payload: Some(Arc::new(data)),
            ..Self::default()
        }
    }

    /// A failed response.
    pub fn fail() -> Self {
        Self {
            ok: false,
            ..Self::default()
        }
    }

    /// Attach a typed payload for the next step to read via
    /// `StepContext::previous_step_response`.
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Override the reported transfer size.
    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = bytes;
        self
    }

    /// Override the measured latency.
    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    /// Request cooperative termination of the session. The response itself
    /// is still processed normally.
    pub fn stop_test(mut self) -> Self {
        self.exit_code = ExitCode::StopTest;
        self
    }

    pub(crate) fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// Typed read of the payload, if one was attached with that type.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("ok", &self.ok)
            .field("has_payload", &self.payload.is_some())
            .field("size_bytes", &self.size_bytes)
            .field("latency_ms", &self.latency_ms)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
