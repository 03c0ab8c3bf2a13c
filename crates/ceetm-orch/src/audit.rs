//! Structured audit records and logging setup.
//!
//! Configuration changes that claim or give back hardware are recorded as
//! [`AuditRecord`]s and emitted through [`audit_log!`](crate::audit_log) on the
//! `audit` target, carrying the full record as JSON in the `audit_json` field.
//! Packet-path events are never audited.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt as log_fmt, prelude::*, EnvFilter};

/// What kind of change an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// A hierarchy or node was created and bound.
    ResourceCreate,
    /// Rates, weights or filters changed on a bound node.
    ResourceModify,
    /// A node or a whole hierarchy was released.
    ResourceDelete,
    /// Daemon startup and shutdown
    SystemLifecycle,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::ResourceCreate => write!(f, "RESOURCE_CREATE"),
            AuditCategory::ResourceModify => write!(f, "RESOURCE_MODIFY"),
            AuditCategory::ResourceDelete => write!(f, "RESOURCE_DELETE"),
            AuditCategory::SystemLifecycle => write!(f, "SYSTEM_LIFECYCLE"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    /// Refused before any hardware was touched.
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audited configuration event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that produced the record.
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Device, hierarchy handle or node id the action concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// e.g. "hierarchy", "inner", "prio_leaf"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped now, with outcome `InProgress`.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] through [`emit`].
///
/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "CeetmOrch", "create_root")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id("eth0"));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        $crate::audit::emit(&$record)
    };
}

/// Writes `record` on the `audit` target. Failures and refusals go out at
/// warn, completed actions at info.
pub fn emit(record: &AuditRecord) {
    let json = record.to_json();
    let object = record.object_id.as_deref().unwrap_or("-");
    match record.outcome {
        AuditOutcome::Success => info!(
            target: "audit",
            category = %record.category,
            action = %record.action,
            object,
            audit_json = %json,
            "{} {} on {}",
            record.source,
            record.action,
            object
        ),
        AuditOutcome::InProgress => debug!(
            target: "audit",
            category = %record.category,
            action = %record.action,
            object,
            audit_json = %json,
            "{} started {} on {}",
            record.source,
            record.action,
            object
        ),
        AuditOutcome::Failure | AuditOutcome::Denied => warn!(
            target: "audit",
            category = %record.category,
            action = %record.action,
            object,
            outcome = %record.outcome,
            error = record.error.as_deref().unwrap_or(""),
            audit_json = %json,
            "{} {} on {}: {}",
            record.source,
            record.action,
            object,
            record.outcome
        ),
    }
}

/// Installs a JSON subscriber. `RUST_LOG` overrides `log_level`.
pub fn init_logging(log_level: &str) {
    install_subscriber(log_level, false);
}

/// Installs a human-readable subscriber for interactive runs.
pub fn init_logging_pretty(log_level: &str) {
    install_subscriber(log_level, true);
}

fn install_subscriber(log_level: &str, pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let json_layer = (!pretty).then(|| {
        log_fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
    });
    let pretty_layer = pretty.then(|| log_fmt::layer().with_target(true).pretty());

    // a second call keeps the subscriber already installed
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init();
}
