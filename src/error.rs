use std::time::Duration;

/// Error taxonomy for the engine, covering both the orchestration layer and
/// its external collaborators (the worker runtime, artifact I/O).
///
/// Categories map to the local-policy column of the error handling design:
/// - Retryable: transient, worth retrying with backoff.
/// - Fatal: halt the affected project, set `status=error`.
/// - Recovered locally: logged, does not fail the phase.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("worker runtime request failed (transient): {0}")]
    TransientBackendFailure(String),

    #[error("worker runtime request failed (permanent): {0}")]
    PermanentBackendFailure(String),

    #[error("worker {worker_id} did not complete within {timeout:?}")]
    WorkerTimeout { worker_id: String, timeout: Duration },

    #[error("could not parse worker output: {0}")]
    OutputParseError(String),

    #[error("graph failed validation: {0:?}")]
    SchemaViolation(Vec<String>),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("operation cancelled by pause")]
    Paused,

    #[error("{0}")]
    Io(String),
}

impl EngineError {
    /// True if the operation should be retried with bounded, backed-off attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientBackendFailure(_))
    }

    /// True if the error is unrecoverable for the affected project and its
    /// status should be set to `error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvariantViolation(_) | EngineError::PermanentBackendFailure(_)
        )
    }

    /// True if this is a cooperative-cancellation unwind, not a failure.
    pub fn is_paused(&self) -> bool {
        matches!(self, EngineError::Paused)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            EngineError::TransientBackendFailure(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_side_error() || status.as_u16() == 429 {
                EngineError::TransientBackendFailure(err.to_string())
            } else {
                EngineError::PermanentBackendFailure(err.to_string())
            }
        } else {
            EngineError::PermanentBackendFailure(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_backend_failure_is_retryable() {
        assert!(EngineError::TransientBackendFailure("boom".into()).is_retryable());
        assert!(!EngineError::PermanentBackendFailure("boom".into()).is_retryable());
    }

    #[test]
    fn invariant_violation_and_permanent_failure_are_fatal() {
        assert!(EngineError::InvariantViolation("bad state".into()).is_fatal());
        assert!(EngineError::PermanentBackendFailure("boom".into()).is_fatal());
        assert!(!EngineError::WorkerTimeout {
            worker_id: "w1".into(),
            timeout: Duration::from_secs(1)
        }
        .is_fatal());
    }

    #[test]
    fn paused_is_not_retryable_or_fatal() {
        assert!(!EngineError::Paused.is_retryable());
        assert!(!EngineError::Paused.is_fatal());
        assert!(EngineError::Paused.is_paused());
    }
}
