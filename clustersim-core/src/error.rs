//! Error taxonomy for the simulator

use thiserror::Error;

/// Result type for simulation operations
pub type SimResult<T> = Result<T, SimError>;

/// Errors that can occur during a simulation run.
///
/// All variants are fatal: the driver logs the reason once and exits
/// non-zero. There is no recovery or partial re-run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dependency violation: {0}")]
    DependencyViolation(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Convenience constructor for configuration failures.
    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = SimError::config("unknown key 'foo'");
        assert_eq!(err.to_string(), "configuration error: unknown key 'foo'");
    }
}
