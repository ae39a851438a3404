// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for xjog-core.
//!
//! Low-level driver errors are wrapped at the store boundary as
//! [`ChartError::Storage`]; domain conditions (missing charts, closed
//! registration, mutex timeouts) are typed variants. Background loops never
//! let these escape; they log and re-arm.

use std::fmt;

use xjog_machine::ChartReference;

/// Result type using ChartError.
pub type Result<T> = std::result::Result<T, ChartError>;

/// Engine errors surfaced to callers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChartError {
    /// No machine with this id is registered.
    MachineNotFound {
        /// The machine id that was not found.
        machine_id: String,
    },

    /// The chart does not exist (or no longer exists).
    ChartNotFound {
        /// The reference that was not found.
        reference: ChartReference,
    },

    /// `register_machine` was called after `start()`.
    RegistrationClosed,

    /// A timed mutex could not be acquired; treated as a fatal liveness
    /// failure and triggers engine shutdown.
    MutexTimeout {
        /// What the mutex guards (chart URI, cache name).
        scope: String,
    },

    /// The evaluator raised during a transition.
    TransitionFailed {
        /// The chart whose transition failed.
        reference: ChartReference,
        /// Evaluator error message.
        reason: String,
    },

    /// An update hook failed; the transition is rolled back.
    HookFailed {
        /// Hook error message.
        reason: String,
    },

    /// A row with the same primary key already exists.
    Conflict {
        /// Description of the colliding row.
        what: String,
    },

    /// An operation targeted a missing row.
    NotFound {
        /// Description of the missing row.
        what: String,
    },

    /// A driver-level storage failure.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A chart URI failed to parse.
    InvalidUri {
        /// Parse error details.
        details: String,
    },

    /// JSON (de)serialization failed.
    Serialization {
        /// Error details.
        details: String,
    },
}

impl ChartError {
    /// Stable code string for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            Self::ChartNotFound { .. } => "CHART_NOT_FOUND",
            Self::RegistrationClosed => "REGISTRATION_CLOSED",
            Self::MutexTimeout { .. } => "MUTEX_TIMEOUT",
            Self::TransitionFailed { .. } => "TRANSITION_FAILED",
            Self::HookFailed { .. } => "HOOK_FAILED",
            Self::Conflict { .. } => "CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage { .. } => "STORAGE",
            Self::InvalidUri { .. } => "INVALID_URI",
            Self::Serialization { .. } => "SERIALIZATION",
        }
    }

    /// Shorthand for a storage failure in `operation`.
    pub fn storage(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for ChartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MachineNotFound { machine_id } => {
                write!(f, "Machine '{}' is not registered", machine_id)
            }
            Self::ChartNotFound { reference } => {
                write!(f, "Chart '{}' not found", reference)
            }
            Self::RegistrationClosed => {
                write!(f, "Machine registration is closed once the engine has started")
            }
            Self::MutexTimeout { scope } => {
                write!(f, "Timed out acquiring mutex for {}", scope)
            }
            Self::TransitionFailed { reference, reason } => {
                write!(f, "Transition failed for chart '{}': {}", reference, reason)
            }
            Self::HookFailed { reason } => {
                write!(f, "Update hook failed: {}", reason)
            }
            Self::Conflict { what } => {
                write!(f, "Conflict: {} already exists", what)
            }
            Self::NotFound { what } => {
                write!(f, "Not found: {}", what)
            }
            Self::Storage { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
            Self::InvalidUri { details } => {
                write!(f, "Invalid chart URI: {}", details)
            }
            Self::Serialization { details } => {
                write!(f, "Serialization error: {}", details)
            }
        }
    }
}

impl std::error::Error for ChartError {}

impl From<sqlx::Error> for ChartError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return ChartError::Conflict {
                    what: "row".to_string(),
                };
            }
        }
        ChartError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChartError {
    fn from(err: serde_json::Error) -> Self {
        ChartError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<xjog_machine::UriError> for ChartError {
    fn from(err: xjog_machine::UriError) -> Self {
        ChartError::InvalidUri {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases: Vec<(ChartError, &str)> = vec![
            (
                ChartError::MachineNotFound {
                    machine_id: "door".into(),
                },
                "MACHINE_NOT_FOUND",
            ),
            (
                ChartError::ChartNotFound {
                    reference: ChartReference::new("door", "main"),
                },
                "CHART_NOT_FOUND",
            ),
            (ChartError::RegistrationClosed, "REGISTRATION_CLOSED"),
            (
                ChartError::MutexTimeout {
                    scope: "xjog+chart:/door/main".into(),
                },
                "MUTEX_TIMEOUT",
            ),
            (
                ChartError::HookFailed {
                    reason: "journal down".into(),
                },
                "HOOK_FAILED",
            ),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn display_messages() {
        let err = ChartError::ChartNotFound {
            reference: ChartReference::new("door", "main"),
        };
        assert_eq!(err.to_string(), "Chart 'xjog+chart:/door/main' not found");

        let err = ChartError::storage("insert", "disk full");
        assert_eq!(err.to_string(), "Storage error during 'insert': disk full");

        let err = ChartError::TransitionFailed {
            reference: ChartReference::new("door", "main"),
            reason: "guard panicked".into(),
        };
        assert_eq!(
            err.to_string(),
            "Transition failed for chart 'xjog+chart:/door/main': guard panicked"
        );
    }

    #[test]
    fn serde_errors_wrap() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ChartError = parse_error.into();
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
