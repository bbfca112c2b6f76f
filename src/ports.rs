//! Ports the engine requires from its collaborators.
//!
//! The engine makes one bounded decision per call and owns no I/O of its
//! own; everything it reads or writes goes through the async traits in
//! this module. Production adapters live in [`crate::storage`] (SQLite)
//! and [`crate::collaborators`] (HTTP, tracing); tests substitute
//! in-memory stands-ins.
//!
//! # Faults vs decisions
//!
//! [`EngineError`] covers faults only: unknown aggregates, tenant
//! mismatches, lost optimistic-concurrency races, and collaborator I/O
//! failures. A collaborator failure is never interpreted as a block;
//! "could not determine" and "denied" stay distinct.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{ControlScope, ExecutionControl};
use crate::instance::{Instance, RiskLevel};
use crate::intent::{IntentEvent, IntentStatus, InvalidTransition, MessageIntent};
use crate::model::RateSnapshot;

/// Faults surfaced to the caller. Policy and rate blocks are not here;
/// those are decision values (see [`crate::model`]).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The referenced intent does not exist.
    #[error("message intent not found: {0}")]
    IntentNotFound(String),

    /// The referenced instance does not exist.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The referenced conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A follow-up dispatch was requested without a conversation id.
    #[error("follow-up dispatch requires a conversation id")]
    ConversationRequired,

    /// The intent belongs to a different tenant than the caller claims.
    #[error("intent {intent_id} does not belong to organization {organization_id}")]
    TenantMismatch {
        intent_id: String,
        organization_id: String,
    },

    /// A concurrent call decided the intent first; the caller should
    /// re-read and take the recorded decision.
    #[error("intent {0} was decided concurrently")]
    ConcurrentDecision(String),

    /// An illegal aggregate transition was attempted.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// A repository, evaluator, or other collaborator failed.
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Collaborator(err.into())
    }
}

/// Why a health evaluation is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckReason {
    /// Immediately before a send.
    PreDispatch,
    /// Triggered by an upstream webhook event.
    Webhook,
    /// Periodic scheduler tick.
    Cron,
}

impl HealthCheckReason {
    /// Stable identifier used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckReason::PreDispatch => "PRE_DISPATCH",
            HealthCheckReason::Webhook => "WEBHOOK",
            HealthCheckReason::Cron => "CRON",
        }
    }
}

/// Actions the health evaluator can prescribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthAction {
    /// Dispatch may proceed.
    AllowDispatch,
    /// Dispatch must not proceed.
    BlockDispatch,
    /// The instance should enter a cooldown window.
    EnterCooldown,
}

/// Verdict returned by the instance health evaluator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthVerdict {
    /// Prescribed actions.
    pub actions: HashSet<HealthAction>,

    /// Evaluator-assigned risk grade, if it computed one.
    pub risk_level: Option<RiskLevel>,

    /// When the evaluator expects the instance to be dispatchable
    /// again, if it prescribed a rest.
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl HealthVerdict {
    /// A verdict that plainly allows dispatch.
    pub fn allow() -> Self {
        Self {
            actions: HashSet::from([HealthAction::AllowDispatch]),
            risk_level: None,
            cooldown_until: None,
        }
    }

    /// Whether the verdict permits a send right now.
    ///
    /// ENTER_COOLDOWN vetoes even when ALLOW_DISPATCH is also present.
    pub fn allows_dispatch(&self) -> bool {
        self.actions.contains(&HealthAction::AllowDispatch)
            && !self.actions.contains(&HealthAction::EnterCooldown)
    }
}

/// SLA verdict on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaStatus {
    /// The response SLA has been breached; follow-up outreach is
    /// authorized.
    Breached,
    /// Still inside the SLA window.
    NotBreached,
}

/// The slice of a conversation the SLA evaluator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation id.
    pub id: String,
    /// Owning tenant.
    pub organization_id: String,
    /// Most recent inbound message, if any.
    pub last_inbound_at: Option<DateTime<Utc>>,
    /// Most recent outbound message, if any.
    pub last_outbound_at: Option<DateTime<Utc>>,
}

/// Tenant-level caps independent of instance-level caps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Per-minute cap across the tenant, if the plan defines one.
    pub max_messages_per_minute: Option<i64>,
    /// Per-hour cap across the tenant, if the plan defines one.
    pub max_messages_per_hour: Option<i64>,
}

/// Presence-style activity an instance can perform without sending a
/// message. Used by the warm-up scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Presence {
    /// Appear online.
    Available,
    /// Show a typing indicator.
    Typing,
    /// Show a recording indicator.
    Recording,
}

impl Presence {
    /// Stable identifier used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Available => "AVAILABLE",
            Presence::Typing => "TYPING",
            Presence::Recording => "RECORDING",
        }
    }
}

/// Read access to the instance fleet.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Look up one instance.
    async fn find_by_id(&self, id: &str) -> Result<Option<Instance>, EngineError>;

    /// All instances owned by a tenant.
    async fn list_by_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<Instance>, EngineError>;
}

/// Persistence for message intents.
#[async_trait]
pub trait MessageIntentRepository: Send + Sync {
    /// Look up one intent.
    async fn find_by_id(&self, id: &str) -> Result<Option<MessageIntent>, EngineError>;

    /// Persist a newly created intent.
    async fn create(&self, intent: &MessageIntent) -> Result<(), EngineError>;

    /// Persist a decided transition, guarded by the status the caller
    /// read. Loses the race with [`EngineError::ConcurrentDecision`]
    /// when another call transitioned the intent first.
    async fn save_transition(
        &self,
        intent: &MessageIntent,
        expected: IntentStatus,
    ) -> Result<(), EngineError>;
}

/// Per-instance send counters as of "now".
#[async_trait]
pub trait RateSnapshotProvider: Send + Sync {
    /// Counters for one instance.
    async fn snapshot(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateSnapshot, EngineError>;
}

/// External instance-health evaluator.
#[async_trait]
pub trait InstanceHealthEvaluator: Send + Sync {
    /// Evaluate the instance's current health.
    async fn evaluate(
        &self,
        instance_id: &str,
        reason: HealthCheckReason,
        now: DateTime<Utc>,
    ) -> Result<HealthVerdict, EngineError>;
}

/// Read access to conversations, for the follow-up path.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Look up one conversation.
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, EngineError>;
}

/// SLA evaluation over a conversation.
#[async_trait]
pub trait SlaEvaluator: Send + Sync {
    /// Whether the conversation's response SLA is breached at `now`.
    async fn evaluate(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Result<SlaStatus, EngineError>;
}

/// Optional tenant plan limits.
#[async_trait]
pub trait PlanPolicy: Send + Sync {
    /// Limits that apply to this intent for this tenant at `now`.
    async fn limits(
        &self,
        organization_id: &str,
        intent: &MessageIntent,
        now: DateTime<Utc>,
    ) -> Result<PlanLimits, EngineError>;
}

/// Persistence for execution controls.
#[async_trait]
pub trait ExecutionControlRepository: Send + Sync {
    /// The control for a scope, if one was ever created.
    async fn find_by_scope(
        &self,
        scope: ControlScope,
        scope_id: &str,
    ) -> Result<Option<ExecutionControl>, EngineError>;

    /// Create or replace the control for its scope.
    async fn upsert(&self, control: &ExecutionControl) -> Result<(), EngineError>;
}

/// Outbound domain-event publication.
///
/// At-least-once, fire-and-forget from the gate's perspective; events
/// from one call are published FIFO.
#[async_trait]
pub trait DomainEventBus: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: &IntentEvent) -> Result<(), EngineError>;

    /// Publish several events in order.
    async fn publish_many(&self, events: &[IntentEvent]) -> Result<(), EngineError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Recipients the warm-up scheduler may contact.
#[async_trait]
pub trait WarmUpTargetsProvider: Send + Sync {
    /// Candidate recipients for warm-up traffic from this instance.
    async fn targets(&self, instance_id: &str) -> Result<Vec<String>, EngineError>;
}

/// Generated content for warm-up traffic.
#[async_trait]
pub trait WarmUpContentProvider: Send + Sync {
    /// A short, innocuous text for this instance to send.
    async fn short_text(&self, instance_id: &str) -> Result<String, EngineError>;
}

/// Physical dispatch of presence changes.
///
/// The gates never call this; only the warm-up scheduler's guarded
/// direct path does, and only after a fresh pre-dispatch health check.
/// Messages themselves are never sent from here: approved intents are
/// handed to the downstream delivery pipeline.
#[async_trait]
pub trait PresenceDispatcher: Send + Sync {
    /// Perform a presence change.
    async fn set_presence(&self, instance_id: &str, presence: Presence)
        -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_verdict_allow() {
        assert!(HealthVerdict::allow().allows_dispatch());
        assert!(!HealthVerdict::default().allows_dispatch());
    }

    #[test]
    fn test_enter_cooldown_vetoes_allow() {
        let verdict = HealthVerdict {
            actions: HashSet::from([HealthAction::AllowDispatch, HealthAction::EnterCooldown]),
            risk_level: None,
            cooldown_until: None,
        };
        assert!(!verdict.allows_dispatch());
    }
}
