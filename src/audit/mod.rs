//! Tamper-evident audit log.
//!
//! Append-only, hash-chained event store with integrity verification,
//! role-gated reads with meta-audit, rule-based real-time alerting with rate
//! limiting, and a time-based retention sweep. This module contains:
//! - `AuditEvent` and its classification enums
//! - `AuditStore` trait: atomic append with chain computation, queries,
//!   integrity verification
//! - Implementations: in-memory, SQLite (feature `sqlite`)
//! - `RbacAuditReadGuard`: role checks plus meta-audit of every read
//! - `AuditAlertEngine`: rule evaluation with a rolling alert quota
//! - Retention sweep with explicit chain-checkpoint semantics

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod alerts;
pub mod canonical;
pub mod memory;
pub mod rbac;
pub mod retention;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

pub use alerts::{
    AlertEvaluationMode, AuditAlert, AuditAlertEngine, AuditAlertOptions, AuditAlertRule,
    AlertSeverity, NotificationChannel,
};
pub use memory::InMemoryAuditStore;
pub use rbac::{
    ActorProvider, AuditAccessRole, RbacAuditReadGuard, RoleProvider,
};
pub use retention::{
    spawn_retention_sweep, AuditArchiver, AuditRetentionOptions, AuditRetentionService,
    RetentionCheckpointMode, RetentionSweepHandle, RETENTION_JOB_NAME,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditStore;
pub use store::{AuditIntegrityResult, AuditQuery, AuditStore, ChainAnchor};

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors surfaced by the audit subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Audit event '{0}' not found")]
    NotFound(String),

    #[error("Permission denied for role {0:?}")]
    PermissionDenied(AuditAccessRole),

    #[error("Configuration error: {0}")]
    Configuration(&'static str),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Operation cancelled")]
    Cancelled,
}

// ============================================================================
// Classifications
// ============================================================================

/// Broad category of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    System,
    Authentication,
    Authorization,
    DataAccess,
    DataModification,
    ConfigurationChange,
    Security,
    Compliance,
    Administrative,
    Integration,
}

impl AuditEventType {
    /// Stable string form used by the durable stores and the canonical
    /// serialisation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::DataAccess => "data_access",
            Self::DataModification => "data_modification",
            Self::ConfigurationChange => "configuration_change",
            Self::Security => "security",
            Self::Compliance => "compliance",
            Self::Administrative => "administrative",
            Self::Integration => "integration",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "authentication" => Some(Self::Authentication),
            "authorization" => Some(Self::Authorization),
            "data_access" => Some(Self::DataAccess),
            "data_modification" => Some(Self::DataModification),
            "configuration_change" => Some(Self::ConfigurationChange),
            "security" => Some(Self::Security),
            "compliance" => Some(Self::Compliance),
            "administrative" => Some(Self::Administrative),
            "integration" => Some(Self::Integration),
            _ => None,
        }
    }
}

/// How the audited action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Error,
    Pending,
}

impl AuditOutcome {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
            Self::Error => "error",
            Self::Pending => "pending",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "denied" => Some(Self::Denied),
            "error" => Some(Self::Error),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Sensitivity of the touched resource, ordered least to most sensitive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl DataClassification {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "confidential" => Some(Self::Confidential),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// One immutable audit record.
///
/// `sequence_number`, `previous_event_hash`, and `event_hash` are assigned by
/// the store at append time; everything else comes from the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identity.
    pub event_id: String,
    /// Category.
    pub event_type: AuditEventType,
    /// What was done, e.g. `"AuditLog.Query"` or `"Order.Cancel"`.
    pub action: String,
    /// How it ended.
    pub outcome: AuditOutcome,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Who did it.
    pub actor_id: String,
    /// Kind of actor (user, service, ...).
    pub actor_type: Option<String>,
    /// Touched resource id.
    pub resource_id: Option<String>,
    /// Touched resource kind.
    pub resource_type: Option<String>,
    /// Sensitivity of the touched resource.
    pub resource_classification: Option<DataClassification>,
    /// Tenant scope.
    pub tenant_id: Option<String>,
    /// Correlation with the triggering operation.
    pub correlation_id: Option<String>,
    /// Session the action ran in.
    pub session_id: Option<String>,
    /// Caller address.
    pub ip_address: Option<String>,
    /// Caller user agent.
    pub user_agent: Option<String>,
    /// Free-form reason.
    pub reason: Option<String>,
    /// Additional context.
    pub metadata: HashMap<String, String>,
    /// Chain position, assigned by the store. Strictly increasing.
    pub sequence_number: u64,
    /// Hash of the predecessor event; empty for the chain head.
    pub previous_event_hash: String,
    /// Hash over this event's canonical form plus the previous hash.
    pub event_hash: String,
}

impl AuditEvent {
    /// Build an event with a generated id and the current timestamp.
    pub fn new(
        event_type: AuditEventType,
        action: impl Into<String>,
        actor_id: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            action: action.into(),
            outcome,
            timestamp: Utc::now(),
            actor_id: actor_id.into(),
            actor_type: None,
            resource_id: None,
            resource_type: None,
            resource_classification: None,
            tenant_id: None,
            correlation_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            reason: None,
            metadata: HashMap::new(),
            sequence_number: 0,
            previous_event_hash: String::new(),
            event_hash: String::new(),
        }
    }

    /// Set the touched resource.
    pub fn with_resource(
        mut self,
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        self.resource_id = Some(resource_id.into());
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Set the resource classification.
    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.resource_classification = Some(classification);
        self
    }

    /// Set the tenant scope.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the caller address.
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    /// Set a free-form reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a metadata pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Receipt returned by a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventId {
    /// Event identity.
    pub event_id: String,
    /// Hash assigned to the event.
    pub event_hash: String,
    /// Chain position assigned to the event.
    pub sequence_number: u64,
    /// When the store persisted it.
    pub recorded_at: DateTime<Utc>,
}
