use thiserror::Error;

/// Canonical fanout error taxonomy used across crates.
///
/// The enum is `Clone` because one failure may resolve several result slots
/// (a node that goes away fails every group it was assigned to).
///
/// Classification guidance:
/// - [`FanoutError::ProtocolViolation`]: a peer replied in a shape that does not match
///   the agreed delivery mode; scoped to one group/producer
/// - [`FanoutError::RemoteUnavailable`]: transport-level failure reaching a node
/// - [`FanoutError::LocalExecution`]: failure inside the in-process operator chain
/// - [`FanoutError::Unsupported`]: invalid combination of plan and delivery mode;
///   fatal to the whole job
/// - [`FanoutError::CleanupFailure`]: closing a remote context failed; logged only
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FanoutError {
    /// Invalid or inconsistent configuration/graph state.
    ///
    /// Examples:
    /// - execution groups and merge specs are not aligned 1:1
    /// - a job context with the same job id is already registered
    /// - unparsable `FANOUT_*` environment values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reply or delivery did not match the agreed protocol.
    ///
    /// Examples:
    /// - direct-response reply without the expected bucket
    /// - inline buckets in a push-mode reply
    /// - delivery for an out-of-range or already drained producer index
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The node could not be reached, or the call failed in transit.
    #[error("node {node} unavailable: {message}")]
    RemoteUnavailable {
        /// Node id the request was addressed to.
        node: String,
        /// Transport error description.
        message: String,
    },

    /// Failure inside the local operator/projector chain.
    #[error("local execution failed: {0}")]
    LocalExecution(String),

    /// Valid request for a plan/mode combination the coordinator refuses to run.
    ///
    /// Examples:
    /// - handler-side collect outside direct-response mode
    /// - a job mixing direct-response and push units
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Closing a remote context failed.
    #[error("closing context of job {job_id} on node {node} failed: {message}")]
    CleanupFailure {
        /// Job the context belonged to.
        job_id: String,
        /// Node the close request was sent to.
        node: String,
        /// Failure description.
        message: String,
    },

    /// Accounting budget exceeded.
    #[error("circuit breaker [{breaker}] tripped: {message}")]
    CircuitBreaking {
        /// Breaker name.
        breaker: String,
        /// Requested/limit description.
        message: String,
    },

    /// Runtime failures after planning succeeded (codec, kernels, dropped slots).
    #[error("execution error: {0}")]
    Execution(String),
}

impl FanoutError {
    /// Short, stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FanoutError::InvalidConfig(_) => "invalid_config",
            FanoutError::ProtocolViolation(_) => "protocol_violation",
            FanoutError::RemoteUnavailable { .. } => "remote_unavailable",
            FanoutError::LocalExecution(_) => "local_execution",
            FanoutError::Unsupported(_) => "unsupported",
            FanoutError::CleanupFailure { .. } => "cleanup_failure",
            FanoutError::CircuitBreaking { .. } => "circuit_breaking",
            FanoutError::Execution(_) => "execution",
        }
    }

    /// Build a [`FanoutError::RemoteUnavailable`] for `node`.
    pub fn remote_unavailable(node: impl ToString, message: impl ToString) -> Self {
        FanoutError::RemoteUnavailable {
            node: node.to_string(),
            message: message.to_string(),
        }
    }
}

/// Standard fanout result alias.
pub type Result<T> = std::result::Result<T, FanoutError>;

#[cfg(test)]
mod tests {
    use super::FanoutError;

    #[test]
    fn remote_unavailable_names_the_node() {
        let err = FanoutError::remote_unavailable("n2", "connection refused");
        assert_eq!(err.to_string(), "node n2 unavailable: connection refused");
        assert_eq!(err.kind(), "remote_unavailable");
    }
}
