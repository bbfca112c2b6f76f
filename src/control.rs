//! Operational pause switches.
//!
//! An execution control is a pause independent of reputation: an
//! operator (or an automated incident response) can stop traffic for a
//! whole organization, a single instance, or a campaign, optionally
//! until a deadline. Both gates consult these switches before any other
//! check at their scope.
//!
//! Controls are created lazily on first pause; resuming resets the
//! record to ACTIVE and clears the reason and deadline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{EngineError, ExecutionControlRepository};

/// What a control applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlScope {
    /// Every instance of a tenant.
    Organization,
    /// One instance.
    Instance,
    /// One campaign.
    Campaign,
}

impl ControlScope {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlScope::Organization => "ORGANIZATION",
            ControlScope::Instance => "INSTANCE",
            ControlScope::Campaign => "CAMPAIGN",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "ORGANIZATION" => ControlScope::Organization,
            "INSTANCE" => ControlScope::Instance,
            "CAMPAIGN" => ControlScope::Campaign,
            _ => return None,
        })
    }
}

/// Whether the switch is engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStatus {
    /// Traffic flows normally.
    Active,
    /// Traffic is stopped.
    Paused,
}

impl ControlStatus {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlStatus::Active => "ACTIVE",
            ControlStatus::Paused => "PAUSED",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "ACTIVE" => ControlStatus::Active,
            "PAUSED" => ControlStatus::Paused,
            _ => return None,
        })
    }
}

/// A pause switch for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionControl {
    /// What the switch applies to.
    pub scope: ControlScope,

    /// Which organization/instance/campaign.
    pub scope_id: String,

    /// Engaged or not.
    pub status: ControlStatus,

    /// Operator-supplied reason, while paused.
    pub reason: Option<String>,

    /// Deadline after which the pause expires on its own. `None` means
    /// indefinite.
    pub paused_until: Option<DateTime<Utc>>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionControl {
    /// A freshly engaged pause.
    pub fn paused(
        scope: ControlScope,
        scope_id: &str,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scope,
            scope_id: scope_id.to_string(),
            status: ControlStatus::Paused,
            reason,
            paused_until: until,
            updated_at: now,
        }
    }

    /// Whether the pause is in effect at `now`.
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.status == ControlStatus::Paused
            && self.paused_until.is_none_or(|until| now < until)
    }

    /// Disengage the switch, clearing reason and deadline.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.status = ControlStatus::Active;
        self.reason = None;
        self.paused_until = None;
        self.updated_at = now;
    }
}

/// Pause/resume operations and the read queries both gates consume.
#[derive(Clone)]
pub struct ExecutionControlPolicy {
    controls: Arc<dyn ExecutionControlRepository>,
}

impl ExecutionControlPolicy {
    /// Build the policy over a control repository.
    pub fn new(controls: Arc<dyn ExecutionControlRepository>) -> Self {
        Self { controls }
    }

    /// Engage (or refresh) a pause. Idempotent upsert.
    pub async fn pause(
        &self,
        scope: ControlScope,
        scope_id: &str,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let control = ExecutionControl::paused(scope, scope_id, reason, until, now);
        self.controls.upsert(&control).await
    }

    /// Disengage a pause. Idempotent: resuming a scope that was never
    /// paused is a no-op.
    pub async fn resume(
        &self,
        scope: ControlScope,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(mut control) = self.controls.find_by_scope(scope, scope_id).await? else {
            return Ok(());
        };
        control.resume(now);
        self.controls.upsert(&control).await
    }

    /// Pause every instance of an organization.
    pub async fn pause_organization(
        &self,
        organization_id: &str,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.pause(ControlScope::Organization, organization_id, reason, until, now)
            .await
    }

    /// Resume an organization.
    pub async fn resume_organization(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.resume(ControlScope::Organization, organization_id, now)
            .await
    }

    /// Pause one instance.
    pub async fn pause_instance(
        &self,
        instance_id: &str,
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.pause(ControlScope::Instance, instance_id, reason, until, now)
            .await
    }

    /// Resume one instance.
    pub async fn resume_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.resume(ControlScope::Instance, instance_id, now).await
    }

    /// Whether a scope is paused at `now`.
    pub async fn is_paused(
        &self,
        scope: ControlScope,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let control = self.controls.find_by_scope(scope, scope_id).await?;
        Ok(control.is_some_and(|c| c.is_paused(now)))
    }

    /// Whether the organization-scope switch is engaged.
    pub async fn is_organization_paused(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        self.is_paused(ControlScope::Organization, organization_id, now)
            .await
    }

    /// Whether the instance-scope switch is engaged.
    pub async fn is_instance_paused(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        self.is_paused(ControlScope::Instance, instance_id, now).await
    }

    /// Whether traffic may flow for this instance of this organization.
    ///
    /// Short-circuits at the organization level: when the whole tenant
    /// is paused the instance switch is never read.
    pub async fn can_execute(
        &self,
        organization_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if self.is_organization_paused(organization_id, now).await? {
            return Ok(false);
        }
        Ok(!self.is_instance_paused(instance_id, now).await?)
    }
}
