//! Role-gated audit reads with meta-audit.
//!
//! Wraps an [`AuditStore`]'s read surface. Every read first resolves the
//! caller's role; an unknown or insufficient role is denied and the denial
//! itself is audited. After the delegated call returns, a meta-audit event
//! records who read what, since reading the audit log is a sensitive action
//! in its own right. Meta-logger failures are swallowed: they must never
//! mask or fail the underlying read.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::store::{AuditIntegrityResult, AuditQuery, AuditStore};
use super::{AuditError, AuditEvent, AuditEventType, AuditOutcome, Result};

/// Caller role for audit log access, least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditAccessRole {
    /// No audit access.
    Unauthorized,
    /// May read individual events.
    Viewer,
    /// May query and verify.
    Auditor,
    /// Full read access.
    Administrator,
}

impl AuditAccessRole {
    /// Display name used for the fallback actor id.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Viewer => "Viewer",
            Self::Auditor => "Auditor",
            Self::Administrator => "Administrator",
        }
    }
}

/// Resolves the caller's role.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Role of the current caller.
    async fn current_role(&self) -> Result<AuditAccessRole>;
}

/// Resolves the caller's actor id for meta-audit.
#[async_trait]
pub trait ActorProvider: Send + Sync {
    /// Actor id of the current caller, if known.
    async fn current_actor_id(&self) -> Result<Option<String>>;
}

/// Fixed-role provider for tests and service accounts.
pub struct StaticRoleProvider(pub AuditAccessRole);

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn current_role(&self) -> Result<AuditAccessRole> {
        Ok(self.0)
    }
}

/// Role-gated wrapper over an audit store's reads.
pub struct RbacAuditReadGuard {
    inner: Arc<dyn AuditStore>,
    meta: Arc<dyn AuditStore>,
    roles: Arc<dyn RoleProvider>,
    actors: Option<Arc<dyn ActorProvider>>,
    required_role: AuditAccessRole,
}

impl RbacAuditReadGuard {
    /// Gate `inner` with `roles`, writing meta-audit through `meta`.
    ///
    /// `meta` is typically a different store (or the same one) dedicated to
    /// security events; the guard never reads from it.
    pub fn new(
        inner: Arc<dyn AuditStore>,
        meta: Arc<dyn AuditStore>,
        roles: Arc<dyn RoleProvider>,
    ) -> Self {
        Self {
            inner,
            meta,
            roles,
            actors: None,
            required_role: AuditAccessRole::Auditor,
        }
    }

    /// Resolve actor ids through `actors` instead of the role fallback.
    pub fn with_actor_provider(mut self, actors: Arc<dyn ActorProvider>) -> Self {
        self.actors = Some(actors);
        self
    }

    /// Override the minimum role (default `Auditor`).
    pub fn with_required_role(mut self, role: AuditAccessRole) -> Self {
        self.required_role = role;
        self
    }

    /// Role-checked `get_by_id`.
    pub async fn get_by_id(&self, event_id: &str) -> Result<Option<AuditEvent>> {
        let (role, actor) = self.authorize("AuditLog.GetById").await?;
        let result = self.inner.get_by_id(event_id).await;
        self.meta_audit(
            "AuditLog.GetById",
            &actor,
            role,
            outcome_of(&result),
            Some(event_id.to_string()),
        )
        .await;
        result
    }

    /// Role-checked `query`.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        query.validate()?;
        let (role, actor) = self.authorize("AuditLog.Query").await?;
        let result = self.inner.query(query).await;
        let detail = result
            .as_ref()
            .ok()
            .map(|events| format!("results={}", events.len()));
        self.meta_audit("AuditLog.Query", &actor, role, outcome_of(&result), detail)
            .await;
        result
    }

    /// Role-checked `verify_chain_integrity`.
    pub async fn verify_chain_integrity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AuditIntegrityResult> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(AuditError::InvalidArgument(
                    "start_date must not be after end_date",
                ));
            }
        }
        let (role, actor) = self.authorize("AuditLog.VerifyIntegrity").await?;
        let result = self.inner.verify_chain_integrity(start, end).await;
        let detail = result.as_ref().ok().map(|r| {
            if r.is_valid() {
                "chain=valid".to_string()
            } else {
                "chain=invalid".to_string()
            }
        });
        self.meta_audit(
            "AuditLog.VerifyIntegrity",
            &actor,
            role,
            outcome_of(&result),
            detail,
        )
        .await;
        result
    }

    /// Resolve role and actor; deny (and audit the denial) when the role is
    /// insufficient.
    async fn authorize(&self, action: &str) -> Result<(AuditAccessRole, String)> {
        let role = match self.roles.current_role().await {
            Ok(role) => role,
            Err(e) => {
                warn!(action = %action, error = %e, "Role resolution failed, denying");
                AuditAccessRole::Unauthorized
            }
        };
        let actor = self.resolve_actor(role).await;

        if role < self.required_role {
            self.meta_audit(action, &actor, role, AuditOutcome::Denied, None)
                .await;
            return Err(AuditError::PermissionDenied(role));
        }
        Ok((role, actor))
    }

    async fn resolve_actor(&self, role: AuditAccessRole) -> String {
        if let Some(ref actors) = self.actors {
            match actors.current_actor_id().await {
                Ok(Some(actor_id)) => return actor_id,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Actor resolution failed, using role fallback");
                }
            }
        }
        format!("role:{}", role.name())
    }

    async fn meta_audit(
        &self,
        action: &str,
        actor: &str,
        role: AuditAccessRole,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) {
        let mut event = AuditEvent::new(AuditEventType::Security, action, actor, outcome)
            .with_metadata("role", role.name());
        if let Some(detail) = detail {
            event = event.with_metadata("detail", detail);
        }
        if let Err(e) = self.meta.store(event).await {
            // Never mask or fail the underlying read.
            warn!(action = %action, error = %e, "Meta-audit write failed, swallowed");
        }
    }
}

fn outcome_of<T>(result: &Result<T>) -> AuditOutcome {
    match result {
        Ok(_) => AuditOutcome::Success,
        Err(_) => AuditOutcome::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::InMemoryAuditStore;

    struct Fixture {
        guard: RbacAuditReadGuard,
        meta: Arc<InMemoryAuditStore>,
        event_id: String,
    }

    async fn fixture(role: AuditAccessRole) -> Fixture {
        let inner = Arc::new(InMemoryAuditStore::default());
        let meta = Arc::new(InMemoryAuditStore::default());
        let receipt = inner
            .store(AuditEvent::new(
                AuditEventType::DataAccess,
                "Patient.Read",
                "user-1",
                AuditOutcome::Success,
            ))
            .await
            .unwrap();
        let guard = RbacAuditReadGuard::new(
            inner,
            meta.clone(),
            Arc::new(StaticRoleProvider(role)),
        );
        Fixture {
            guard,
            meta,
            event_id: receipt.event_id,
        }
    }

    #[tokio::test]
    async fn test_sufficient_role_reads_and_meta_audits() {
        let f = fixture(AuditAccessRole::Auditor).await;

        let event = f.guard.get_by_id(&f.event_id).await.unwrap();
        assert!(event.is_some());

        let meta_events = f.meta.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(meta_events.len(), 1);
        assert_eq!(meta_events[0].action, "AuditLog.GetById");
        assert_eq!(meta_events[0].event_type, AuditEventType::Security);
        assert_eq!(meta_events[0].outcome, AuditOutcome::Success);
        assert_eq!(meta_events[0].actor_id, "role:Auditor");
    }

    #[tokio::test]
    async fn test_insufficient_role_denied_with_meta_audit() {
        let f = fixture(AuditAccessRole::Viewer).await;

        let result = f.guard.query(&AuditQuery::default()).await;
        assert!(matches!(
            result,
            Err(AuditError::PermissionDenied(AuditAccessRole::Viewer))
        ));

        let meta_events = f.meta.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(meta_events.len(), 1);
        assert_eq!(meta_events[0].outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn test_verify_goes_through_guard() {
        let f = fixture(AuditAccessRole::Administrator).await;

        let result = f.guard.verify_chain_integrity(None, None).await.unwrap();
        assert!(result.is_valid());

        let meta_events = f.meta.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(meta_events[0].action, "AuditLog.VerifyIntegrity");
        assert_eq!(
            meta_events[0].metadata.get("detail").map(String::as_str),
            Some("chain=valid")
        );
    }

    #[tokio::test]
    async fn test_actor_provider_overrides_fallback() {
        struct FixedActor;
        #[async_trait]
        impl ActorProvider for FixedActor {
            async fn current_actor_id(&self) -> Result<Option<String>> {
                Ok(Some("alice@example.com".to_string()))
            }
        }

        let inner = Arc::new(InMemoryAuditStore::default());
        let meta = Arc::new(InMemoryAuditStore::default());
        let guard = RbacAuditReadGuard::new(
            inner,
            meta.clone(),
            Arc::new(StaticRoleProvider(AuditAccessRole::Auditor)),
        )
        .with_actor_provider(Arc::new(FixedActor));

        let _ = guard.get_by_id("missing").await.unwrap();
        let meta_events = meta.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(meta_events[0].actor_id, "alice@example.com");
    }

    #[tokio::test]
    async fn test_role_provider_failure_is_denied() {
        struct BrokenRoles;
        #[async_trait]
        impl RoleProvider for BrokenRoles {
            async fn current_role(&self) -> Result<AuditAccessRole> {
                Err(AuditError::Storage("identity service down".to_string()))
            }
        }

        let inner = Arc::new(InMemoryAuditStore::default());
        let meta = Arc::new(InMemoryAuditStore::default());
        let guard = RbacAuditReadGuard::new(inner, meta.clone(), Arc::new(BrokenRoles));

        let result = guard.get_by_id("x").await;
        assert!(matches!(result, Err(AuditError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_meta_failure_never_masks_read() {
        struct BrokenMeta;
        #[async_trait]
        impl AuditStore for BrokenMeta {
            async fn store(&self, _: AuditEvent) -> Result<crate::audit::AuditEventId> {
                Err(AuditError::Storage("meta store down".to_string()))
            }
            async fn get_by_id(&self, _: &str) -> Result<Option<AuditEvent>> {
                unreachable!()
            }
            async fn query(&self, _: &AuditQuery) -> Result<Vec<AuditEvent>> {
                unreachable!()
            }
            async fn verify_chain_integrity(
                &self,
                _: Option<DateTime<Utc>>,
                _: Option<DateTime<Utc>>,
            ) -> Result<AuditIntegrityResult> {
                unreachable!()
            }
            async fn oldest_events(
                &self,
                _: DateTime<Utc>,
                _: usize,
            ) -> Result<Vec<AuditEvent>> {
                unreachable!()
            }
            async fn delete_up_to(
                &self,
                _: u64,
                _: crate::audit::ChainAnchor,
            ) -> Result<usize> {
                unreachable!()
            }
            async fn latest_sequence(&self) -> Result<Option<u64>> {
                unreachable!()
            }
        }

        let inner = Arc::new(InMemoryAuditStore::default());
        let receipt = inner
            .store(AuditEvent::new(
                AuditEventType::System,
                "Boot",
                "system",
                AuditOutcome::Success,
            ))
            .await
            .unwrap();
        let guard = RbacAuditReadGuard::new(
            inner,
            Arc::new(BrokenMeta),
            Arc::new(StaticRoleProvider(AuditAccessRole::Auditor)),
        );

        // The read succeeds even though every meta write fails.
        let event = guard.get_by_id(&receipt.event_id).await.unwrap();
        assert!(event.is_some());
    }
}
