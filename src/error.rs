//! Error types for the workflow engine

use thiserror::Error;

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error taxonomy for the workflow engine
///
/// Work-item level errors (`OutputValidationFailed`, `WorkerUnresponsive`,
/// `WorkItemFailed`) are recovered locally through retries and error arcs.
/// Structural errors (`InvalidSpecification`, `InvariantBroken`) are
/// surfaced to the caller and never swallowed.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Specification failed a load-time invariant; names the violated rule
    #[error("invalid specification (rule {rule}): {message}")]
    InvalidSpecification { rule: &'static str, message: String },

    /// Specification bytes could not be parsed at all
    #[error("parse error: {0}")]
    Parse(String),

    /// Case not found
    #[error("case {0} not found")]
    CaseNotFound(String),

    /// Work item not found
    #[error("work item {0} not found")]
    ItemNotFound(String),

    /// A state-machine rule was broken; no state was changed
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// Work-item outputs failed parameter type checks
    #[error("output validation failed for item {item_id}: {message}")]
    OutputValidationFailed { item_id: String, message: String },

    /// Lease expired without heartbeat
    #[error("worker {worker_id} unresponsive on item {item_id}")]
    WorkerUnresponsive { item_id: String, worker_id: String },

    /// A work item reported failure; consumed by the net runner
    #[error("work item {item_id} failed: {message}")]
    WorkItemFailed { item_id: String, message: String },

    /// The engine selector rejected the launch
    #[error("launch rejected: {0}")]
    RoutingRejected(String),

    /// Required engine variant is down and no fallback is allowed
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No eligible worker or pool capacity for an allocation
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A core invariant would be violated; the case is poisoned
    #[error("internal invariant broken: {0}")]
    InvariantBroken(String),

    /// Durable log or snapshot failure
    #[error("state persistence error: {0}")]
    StatePersistence(String),

    /// Configuration error (bad environment variable)
    #[error("configuration error for {variable}: {message}")]
    Configuration { variable: &'static str, message: String },
}

impl WorkflowError {
    /// Whether the error is recovered locally (retries, error arcs) rather
    /// than surfaced as a case failure
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkflowError::OutputValidationFailed { .. }
                | WorkflowError::WorkerUnresponsive { .. }
                | WorkflowError::WorkItemFailed { .. }
                | WorkflowError::ResourceUnavailable(_)
        )
    }

    /// CLI exit code mapping
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::Parse(_) | WorkflowError::Configuration { .. } => 2,
            WorkflowError::CaseNotFound(_) | WorkflowError::ItemNotFound(_) => 3,
            WorkflowError::PreconditionViolated(_)
            | WorkflowError::RoutingRejected(_)
            | WorkflowError::InvalidSpecification { .. } => 4,
            _ => 5,
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::StatePersistence(err.to_string())
    }
}

impl From<sled::Error> for WorkflowError {
    fn from(err: sled::Error) -> Self {
        WorkflowError::StatePersistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let err = WorkflowError::WorkerUnresponsive {
            item_id: "i1".to_string(),
            worker_id: "w1".to_string(),
        };
        assert!(err.is_recoverable());

        let err = WorkflowError::InvariantBroken("token count negative".to_string());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(WorkflowError::CaseNotFound("c1".to_string()).exit_code(), 3);
        assert_eq!(
            WorkflowError::PreconditionViolated("bad".to_string()).exit_code(),
            4
        );
        assert_eq!(
            WorkflowError::StatePersistence("disk".to_string()).exit_code(),
            5
        );
    }
}
