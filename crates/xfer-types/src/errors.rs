use thiserror::Error;

/// Main error type for the xfer tuner
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Config space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TuneError {
    /// Whether this error must abort the whole run.
    ///
    /// Only static configuration problems are fatal; everything else is
    /// isolated to the trial or suggestion that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Violations of a config space, either in its definition or in a
/// configuration checked against it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    #[error("Parameter {name} has the wrong type: expected {expected}")]
    TypeMismatch { name: String, expected: String },

    #[error("Parameter {name} = {value} is outside [{low}, {high}]")]
    OutOfBounds {
        name: String,
        value: i64,
        low: i64,
        high: i64,
    },

    #[error("Parameter {name} = {value} is not one of the declared choices")]
    NotAChoice { name: String, value: String },

    #[error("Fixed field {name} was changed")]
    FixedFieldChanged { name: String },

    #[error("Invalid domain for {name}: {message}")]
    InvalidDomain { name: String, message: String },

    #[error("Duplicate parameter name: {name}")]
    DuplicateName { name: String },
}

/// Trial lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Trial not found: {trial_id}")]
    NotFound { trial_id: u64 },

    #[error("Invalid transition for trial {trial_id}: {from} -> {to}")]
    InvalidTransition {
        trial_id: u64,
        from: String,
        to: String,
    },

    #[error("Worker failure in trial {trial_id}: {message}")]
    WorkerFailure { trial_id: u64, message: String },
}

/// Checkpoint persistence errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint for trial {trial_id} is corrupted: {message}")]
    Corruption { trial_id: u64, message: String },

    #[error("Checkpoint store failure for key {key}: {message}")]
    Store { key: String, message: String },
}

/// Result type alias for tuner operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SpaceError::OutOfBounds {
            name: "max_concurrency".to_string(),
            value: 2000,
            low: 10,
            high: 1000,
        };

        let text = error.to_string();
        assert!(text.contains("max_concurrency"));
        assert!(text.contains("2000"));
        assert!(text.contains("[10, 1000]"));
    }

    #[test]
    fn test_error_conversion() {
        let trial_error = TrialError::NotFound { trial_id: 7 };
        let tune_error: TuneError = trial_error.into();

        match tune_error {
            TuneError::Trial(TrialError::NotFound { trial_id }) => assert_eq!(trial_id, 7),
            _ => panic!("Expected Trial error"),
        }
    }

    #[test]
    fn test_fatality() {
        assert!(config_error!("quantile {} out of range", 1.5).is_fatal());

        let corrupt: TuneError = CheckpointError::Corruption {
            trial_id: 1,
            message: "truncated".into(),
        }
        .into();
        assert!(!corrupt.is_fatal());
        let missing: TuneError = TrialError::NotFound { trial_id: 3 }.into();
        assert!(!missing.is_fatal());
    }
}
