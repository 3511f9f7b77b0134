//! Error types for confcheck
//!
//! Every fallible operation in the harness returns [`HarnessError`]. The
//! variants line up with how a scenario reacts to them: configuration
//! problems skip work before anything external runs, process and lifecycle
//! failures abort the current step, and verification timeouts are the
//! expected way a connectivity assertion fails.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::session::Ordinal;

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid or missing configuration (script path, port number, ordinal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The fault-injection script could not be run or exited non-zero
    #[error("External command `{command}` failed ({status}): {stderr}")]
    ExternalProcess {
        command: String,
        status: String,
        stderr: String,
    },

    /// A session could not be started, stopped or located
    #[error("Session lifecycle error for {ordinal} participant: {reason}")]
    SessionLifecycle { ordinal: Ordinal, reason: String },

    /// The expected connectivity state was never observed
    #[error(
        "Timed out after {:?} waiting for {} (expected {}, last observed {}): {}",
        .elapsed,
        .assertion,
        display_state(.expected),
        display_observed(.last_observed),
        .cause
    )]
    VerificationTimeout {
        assertion: String,
        expected: bool,
        last_observed: Option<bool>,
        elapsed: Duration,
        cause: TimeoutCause,
    },

    /// Momentary read failure from the automation layer
    #[error("Observation failed: {0}")]
    Observation(String),

    /// Transport-level failure talking to a WebDriver/Appium endpoint
    #[error("Driver error: {0}")]
    Driver(String),

    /// The operator stopped the run before it finished
    #[error("Interrupted before the scenario finished")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a verification gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The poll deadline elapsed without a matching sample
    DeadlineElapsed,
    /// Too many consecutive transient read failures
    TransientReadsExhausted { failures: u32, last_error: String },
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutCause::DeadlineElapsed => write!(f, "deadline elapsed"),
            TimeoutCause::TransientReadsExhausted { failures, last_error } => {
                write!(f, "{} consecutive read failures, last: {}", failures, last_error)
            }
        }
    }
}

fn display_state(connected: &bool) -> &'static str {
    if *connected {
        "connected"
    } else {
        "disconnected"
    }
}

fn display_observed(value: &Option<bool>) -> &'static str {
    value.as_ref().map(display_state).unwrap_or("nothing")
}

impl HarnessError {
    pub fn config(reason: impl Into<String>) -> Self {
        HarnessError::Configuration(reason.into())
    }

    pub fn lifecycle(ordinal: Ordinal, reason: impl Into<String>) -> Self {
        HarnessError::SessionLifecycle {
            ordinal,
            reason: reason.into(),
        }
    }

    /// Failures the verifier may retry within its own budget
    pub fn is_transient(&self) -> bool {
        matches!(self, HarnessError::Observation(_))
    }

    pub fn is_verification_timeout(&self) -> bool {
        matches!(self, HarnessError::VerificationTimeout { .. })
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        HarnessError::Driver(err.to_string())
    }
}

impl From<figment::Error> for HarnessError {
    fn from(err: figment::Error) -> Self {
        HarnessError::Configuration(err.to_string())
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_observation_errors_are_transient() {
        assert!(HarnessError::Observation("not rendered".into()).is_transient());
        assert!(!HarnessError::Driver("refused".into()).is_transient());
        assert!(!HarnessError::config("bad port").is_transient());
    }

    #[test]
    fn test_timeout_message_names_last_observation() {
        let err = HarnessError::VerificationTimeout {
            assertion: "first sees second".into(),
            expected: false,
            last_observed: Some(true),
            elapsed: Duration::from_secs(15),
            cause: TimeoutCause::DeadlineElapsed,
        };
        let message = err.to_string();
        assert!(message.contains("first sees second"));
        assert!(message.contains("expected disconnected, last observed connected"));
        assert!(err.is_verification_timeout());
    }
}
