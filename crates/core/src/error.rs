/// Final failure outcome of a monitored job, as delivered to callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// Every delivery path failed at the transport level.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend reported the job as failed.
    #[error("Server error: {0}")]
    Server(String),

    /// Polling ran out of attempts before the job reached a terminal state.
    #[error("Timed out after {attempts} status checks")]
    Timeout { attempts: u32 },

    /// A payload could not be decoded, including a completed job whose
    /// track bundle could not be retrieved.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown environment '{0}' (expected development, staging or production)")]
    UnknownEnvironment(String),

    #[error("{var} must be a valid {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}
