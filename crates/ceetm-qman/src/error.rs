//! Queue-manager status codes and error types.
//!
//! The CEETM driver reports failures as negative errno values. This module
//! converts them into [`QmanError`] so callers can tell resource exhaustion
//! apart from misuse.

use std::fmt;
use thiserror::Error;

/// Status codes returned by the queue-manager driver.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QmanStatus {
    Success = 0,
    NotFound = -2,
    Failure = -5,
    NoMemory = -12,
    Busy = -16,
    NotAvailable = -19,
    InvalidParameter = -22,
    QueueFull = -28,
}

impl QmanStatus {
    /// Creates a status from a raw driver return value.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => QmanStatus::Success,
            -2 => QmanStatus::NotFound,
            -12 => QmanStatus::NoMemory,
            -16 => QmanStatus::Busy,
            -19 => QmanStatus::NotAvailable,
            -22 => QmanStatus::InvalidParameter,
            -28 => QmanStatus::QueueFull,
            _ => QmanStatus::Failure,
        }
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == QmanStatus::Success
    }

    /// Converts to a Result, returning Ok(()) for success.
    pub fn into_result(self) -> QmanResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(QmanError::from_status(self))
        }
    }
}

impl fmt::Display for QmanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QmanStatus::Success => "QMAN_SUCCESS",
            QmanStatus::NotFound => "QMAN_ENOENT",
            QmanStatus::Failure => "QMAN_EIO",
            QmanStatus::NoMemory => "QMAN_ENOMEM",
            QmanStatus::Busy => "QMAN_EBUSY",
            QmanStatus::NotAvailable => "QMAN_ENODEV",
            QmanStatus::InvalidParameter => "QMAN_EINVAL",
            QmanStatus::QueueFull => "QMAN_ENOSPC",
        };
        write!(f, "{}", s)
    }
}

/// Error type for queue-manager operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QmanError {
    /// The requested primitive exists but is already held.
    #[error("{kind} busy: {detail}")]
    Busy { kind: &'static str, detail: String },

    /// No primitive of the requested kind remains.
    #[error("no {kind} available: {detail}")]
    NotAvailable { kind: &'static str, detail: String },

    /// The request was rejected as malformed.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The handle does not name a live primitive.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The frame queue refused the enqueue.
    #[error("frame queue {queue} full")]
    QueueFull { queue: String },

    /// Any other driver failure.
    #[error("queue manager failure: {message}")]
    Failure { message: String },
}

impl QmanError {
    /// Creates an error from a status code.
    pub fn from_status(status: QmanStatus) -> Self {
        match status {
            QmanStatus::Busy => QmanError::busy("object", status.to_string()),
            QmanStatus::NotAvailable | QmanStatus::NoMemory => {
                QmanError::not_available("object", status.to_string())
            }
            QmanStatus::InvalidParameter => QmanError::invalid_parameter(status.to_string()),
            QmanStatus::NotFound => QmanError::not_found("object", "unknown"),
            QmanStatus::QueueFull => QmanError::QueueFull {
                queue: "unknown".to_string(),
            },
            QmanStatus::Success | QmanStatus::Failure => QmanError::Failure {
                message: format!("driver returned {}", status),
            },
        }
    }

    pub fn busy(kind: &'static str, detail: impl Into<String>) -> Self {
        QmanError::Busy {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_available(kind: &'static str, detail: impl Into<String>) -> Self {
        QmanError::NotAvailable {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        QmanError::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        QmanError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns true if the error means the pool of primitives is used up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, QmanError::Busy { .. } | QmanError::NotAvailable { .. })
    }
}

/// Result type for queue-manager operations.
pub type QmanResult<T> = Result<T, QmanError>;
