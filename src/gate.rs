//! The single-intent gate: one dispatch attempt, one decision.
//!
//! This is the legacy direct-send path: the caller already knows which
//! instance should send and asks whether it may. The gate layers the
//! operational pause switches, live health, the follow-up SLA
//! privilege, the pure policy, and the rate counters on top of each
//! other, short-circuiting on the first block.
//!
//! The gate never sends anything and never mutates state; rate-type
//! blocks carry a `delayed_until` boundary so the caller can schedule a
//! retry instead of polling.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::control::ExecutionControlPolicy;
use crate::model::{BlockReason, DispatchDecision, GateDecision, IntentSource, RateSnapshot};
use crate::intent::IntentPayload;
use crate::policy::DispatchPolicy;
use crate::ports::{
    ConversationRepository, EngineError, HealthCheckReason, InstanceHealthEvaluator,
    InstanceRepository, RateSnapshotProvider, SlaEvaluator, SlaStatus,
};

/// Global cap on sends per instance per minute, stacked on top of the
/// policy-derived hourly cap. Deliberately a single named constant: the
/// value predates this engine and is kept as a safety net.
pub const GLOBAL_MINUTE_CAP: i64 = 2;

/// How long a duplicate recipient+text pair is suppressed, in minutes.
const DUPLICATE_SUPPRESSION_MINUTES: i64 = 2;

/// A direct-send request for a known instance.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The instance that would send.
    pub instance_id: String,

    /// Why the send was requested. FOLLOW_UP takes the privileged SLA
    /// path; WARMUP tightens the policy's media rules.
    pub source: IntentSource,

    /// Recipient address.
    pub to: String,

    /// What would be sent.
    pub payload: IntentPayload,

    /// Required when `source` is FOLLOW_UP.
    pub conversation_id: Option<String>,
}

/// Dependencies of the single-intent gate.
#[derive(Clone)]
pub struct DispatchGateDeps {
    /// Instance fleet reads.
    pub instances: Arc<dyn InstanceRepository>,
    /// Live instance health.
    pub health: Arc<dyn InstanceHealthEvaluator>,
    /// Conversation reads for the follow-up path.
    pub conversations: Arc<dyn ConversationRepository>,
    /// SLA evaluation for the follow-up path.
    pub sla: Arc<dyn SlaEvaluator>,
    /// Per-instance send counters.
    pub rates: Arc<dyn RateSnapshotProvider>,
    /// Operational pause switches.
    pub controls: ExecutionControlPolicy,
}

/// The single-intent admission gate.
#[derive(Clone)]
pub struct DispatchGate {
    deps: DispatchGateDeps,
    policy: DispatchPolicy,
}

impl DispatchGate {
    /// Build the gate.
    pub fn new(deps: DispatchGateDeps, policy: DispatchPolicy) -> Self {
        Self { deps, policy }
    }

    /// Decide one dispatch attempt at `now`.
    ///
    /// Returns a decision value for every policy/rate refusal; errors
    /// are reserved for faults (unknown conversation, collaborator I/O).
    pub async fn execute(
        &self,
        request: &DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<GateDecision, EngineError> {
        let Some(instance) = self.deps.instances.find_by_id(&request.instance_id).await? else {
            return Ok(GateDecision::blocked(BlockReason::InstanceNotActive));
        };

        if !self
            .deps
            .controls
            .can_execute(&instance.organization_id, &instance.id, now)
            .await?
        {
            debug!(instance_id = %instance.id, "pause switch vetoed dispatch");
            return Ok(GateDecision::blocked(BlockReason::OpsPaused));
        }

        let verdict = self
            .deps
            .health
            .evaluate(&instance.id, HealthCheckReason::PreDispatch, now)
            .await?;
        if !verdict.allows_dispatch() {
            debug!(instance_id = %instance.id, "health verdict vetoed dispatch");
            return Ok(GateDecision::blocked(BlockReason::Cooldown));
        }

        // Follow-ups are privileged: only an SLA breach authorizes them.
        if request.source == IntentSource::FollowUp {
            let conversation_id = request
                .conversation_id
                .as_deref()
                .ok_or(EngineError::ConversationRequired)?;
            let conversation = self
                .deps
                .conversations
                .find_by_id(conversation_id)
                .await?
                .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.to_string()))?;

            let status = self.deps.sla.evaluate(&conversation, now).await?;
            if status != SlaStatus::Breached {
                return Ok(GateDecision::blocked(BlockReason::PolicyBlocked));
            }
        }

        let envelope = match self
            .policy
            .evaluate(&instance, request.source, request.payload.kind(), now)
        {
            DispatchDecision::Allow(envelope) => envelope,
            DispatchDecision::Block { reason } => return Ok(GateDecision::blocked(reason)),
        };

        let snapshot = self.deps.rates.snapshot(&instance.id, now).await?;
        Ok(evaluate_rate_windows(
            &snapshot,
            &request.to,
            &request.payload,
            envelope.max_messages,
            envelope.min_interval_seconds,
            now,
        ))
    }
}

/// The gate's rate-window checks.
///
/// Order: duplicate text, minimum interval, hourly cap, global minute
/// cap. Pure over the snapshot.
fn evaluate_rate_windows(
    snapshot: &RateSnapshot,
    to: &str,
    payload: &IntentPayload,
    max_messages: i64,
    min_interval_seconds: i64,
    now: DateTime<Utc>,
) -> GateDecision {
    if let Some(text) = payload.text() {
        if snapshot.has_recent_text(to, text) {
            return GateDecision::delayed(
                BlockReason::RateLimit,
                now + Duration::minutes(DUPLICATE_SUPPRESSION_MINUTES),
            );
        }
    }

    if let Some(last) = snapshot.last_message_at {
        let boundary = last + Duration::seconds(min_interval_seconds);
        if now < boundary {
            return GateDecision::delayed(BlockReason::RateLimit, boundary);
        }
    }

    if snapshot.sent_last_hour >= max_messages {
        return GateDecision::Blocked {
            reason: BlockReason::RateLimit,
            delayed_until: snapshot.oldest_in_hour_at.map(|t| t + Duration::hours(1)),
        };
    }

    if snapshot.sent_last_minute >= GLOBAL_MINUTE_CAP {
        return GateDecision::delayed(BlockReason::RateLimit, now + Duration::minutes(1));
    }

    GateDecision::Allowed
}
