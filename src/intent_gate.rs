//! The multi-instance intent gate.
//!
//! Resolves a pending [`MessageIntent`] against every instance the
//! tenant owns: each instance is evaluated independently as a
//! *candidate* (pure given its own snapshot inputs), the evaluations run
//! concurrently and are joined before selection, and the winning
//! decision is persisted as an intent transition with its domain events
//! published.
//!
//! # Idempotent replay
//!
//! Calling the gate on an already-APPROVED or -BLOCKED intent returns
//! the recorded decision verbatim and writes nothing. QUEUED intents are
//! genuinely re-evaluated. Two concurrent calls on the same intent are
//! arbitrated by the repository's expected-status guard; the loser gets
//! [`EngineError::ConcurrentDecision`] and can re-read the recorded
//! decision.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::control::ExecutionControlPolicy;
use crate::instance::{Instance, InstancePurpose};
use crate::intent::{IntentStatus, MessageIntent};
use crate::model::{BlockReason, DispatchDecision, IntentDecision, IntentSource};
use crate::policy::DispatchPolicy;
use crate::ports::{
    DomainEventBus, EngineError, HealthCheckReason, InstanceHealthEvaluator, InstanceRepository,
    MessageIntentRepository, PlanPolicy, RateSnapshotProvider,
};
use crate::scorer;

/// How long a cooling-down candidate is parked when the cooldown start
/// is unknown.
const COOLDOWN_QUEUE_HOURS: i64 = 1;

/// Dependencies of the intent gate.
///
/// `plan_policy` is an explicit optional capability: tenants without
/// plan limits simply skip that check.
#[derive(Clone)]
pub struct IntentGateDeps {
    /// Intent persistence.
    pub intents: Arc<dyn MessageIntentRepository>,
    /// Instance fleet reads.
    pub instances: Arc<dyn InstanceRepository>,
    /// Per-instance send counters.
    pub rates: Arc<dyn RateSnapshotProvider>,
    /// Live instance health, for the post-selection re-check.
    pub health: Arc<dyn InstanceHealthEvaluator>,
    /// Operational pause switches.
    pub controls: ExecutionControlPolicy,
    /// Domain event publication.
    pub events: Arc<dyn DomainEventBus>,
    /// Tenant plan limits, when the deployment has any.
    pub plan_policy: Option<Arc<dyn PlanPolicy>>,
}

/// Outcome of evaluating one instance as a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CandidateOutcome {
    /// The instance could serve the intent now.
    Allow { score: i32 },
    /// The instance could serve it later.
    Queue {
        reason: BlockReason,
        queued_until: Option<DateTime<Utc>>,
    },
    /// The instance can never serve this intent.
    Block { reason: BlockReason },
}

#[derive(Debug, Clone)]
struct CandidateEvaluation {
    instance_id: String,
    outcome: CandidateOutcome,
}

/// The multi-instance admission gate.
#[derive(Clone)]
pub struct IntentGate {
    deps: IntentGateDeps,
    policy: DispatchPolicy,
}

impl IntentGate {
    /// Build the gate.
    pub fn new(deps: IntentGateDeps, policy: DispatchPolicy) -> Self {
        Self { deps, policy }
    }

    /// Resolve one intent for one tenant at `now`.
    pub async fn execute(
        &self,
        intent_id: &str,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IntentDecision, EngineError> {
        let intent = self
            .deps
            .intents
            .find_by_id(intent_id)
            .await?
            .ok_or_else(|| EngineError::IntentNotFound(intent_id.to_string()))?;

        if intent.organization_id != organization_id {
            return Err(EngineError::TenantMismatch {
                intent_id: intent_id.to_string(),
                organization_id: organization_id.to_string(),
            });
        }

        // Replay: terminal decisions come back verbatim, queued intents
        // get a genuine re-evaluation.
        if !intent.is_pending() && !intent.is_queued() {
            if let Some(decision) = intent.recorded_decision() {
                return Ok(decision);
            }
        }

        let expected = intent.status;

        if self
            .deps
            .controls
            .is_organization_paused(organization_id, now)
            .await?
        {
            return self
                .record_block(intent, expected, BlockReason::OpsPaused, now)
                .await;
        }

        let mut instances = self
            .deps
            .instances
            .list_by_organization(organization_id)
            .await?;
        if instances.is_empty() {
            return self
                .record_block(intent, expected, BlockReason::NoEligibleInstance, now)
                .await;
        }
        // Stable order makes tie-breaks and "first block reason"
        // reproducible regardless of repository ordering.
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        let evaluations = join_all(
            instances
                .iter()
                .map(|instance| self.evaluate_candidate(&intent, instance, now)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        self.select_and_record(intent, expected, evaluations, now)
            .await
    }

    /// Evaluate one instance as a candidate. Pure given its snapshot
    /// inputs; safe to run concurrently with its siblings.
    async fn evaluate_candidate(
        &self,
        intent: &MessageIntent,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> Result<CandidateEvaluation, EngineError> {
        let block = |reason| {
            Ok(CandidateEvaluation {
                instance_id: instance.id.clone(),
                outcome: CandidateOutcome::Block { reason },
            })
        };

        if self
            .deps
            .controls
            .is_instance_paused(&instance.id, now)
            .await?
        {
            return block(BlockReason::OpsPaused);
        }

        if intent.purpose == IntentSource::Warmup {
            if !instance.can_warm_up() {
                return block(BlockReason::InstanceUnhealthy);
            }
        } else {
            // Warm-up-only instances never carry real traffic.
            if instance.purpose == InstancePurpose::Warmup {
                return block(BlockReason::NoEligibleInstance);
            }
            if !instance.reputation.can_dispatch() {
                let queued_until = instance
                    .reputation
                    .cooldown_started_at
                    .map(|start| start + Duration::hours(COOLDOWN_QUEUE_HOURS))
                    .unwrap_or_else(|| now + Duration::hours(COOLDOWN_QUEUE_HOURS));
                return Ok(CandidateEvaluation {
                    instance_id: instance.id.clone(),
                    outcome: CandidateOutcome::Queue {
                        reason: BlockReason::CooldownActive,
                        queued_until: Some(queued_until),
                    },
                });
            }
        }

        let envelope = match self.policy.evaluate(
            instance,
            intent.purpose,
            intent.payload.kind(),
            now,
        ) {
            DispatchDecision::Allow(envelope) => envelope,
            DispatchDecision::Block { reason } => {
                return block(map_policy_reason(reason));
            }
        };

        let snapshot = self.deps.rates.snapshot(&instance.id, now).await?;

        if let Some(text) = intent.payload.text() {
            if snapshot.has_recent_text(&intent.target.value, text) {
                return block(BlockReason::RateLimit);
            }
        }

        let queue = |reason, queued_until| {
            Ok(CandidateEvaluation {
                instance_id: instance.id.clone(),
                outcome: CandidateOutcome::Queue {
                    reason,
                    queued_until,
                },
            })
        };

        if let Some(last) = snapshot.last_message_at {
            let boundary = last + Duration::seconds(envelope.min_interval_seconds);
            if now < boundary {
                return queue(BlockReason::RateLimit, Some(boundary));
            }
        }

        if snapshot.sent_last_hour >= envelope.max_messages {
            let queued_until = snapshot.oldest_in_hour_at.map(|t| t + Duration::hours(1));
            return queue(BlockReason::RateLimit, queued_until);
        }

        if let Some(plan) = &self.deps.plan_policy {
            let limits = plan
                .limits(&intent.organization_id, intent, now)
                .await?;

            if let Some(per_minute) = limits.max_messages_per_minute {
                if snapshot.sent_last_minute >= per_minute {
                    return queue(BlockReason::PlanLimit, Some(now + Duration::minutes(1)));
                }
            }
            if let Some(per_hour) = limits.max_messages_per_hour {
                if snapshot.sent_last_hour >= per_hour {
                    let queued_until = snapshot
                        .oldest_in_hour_at
                        .map(|t| t + Duration::hours(1))
                        .unwrap_or_else(|| now + Duration::hours(1));
                    return queue(BlockReason::PlanLimit, Some(queued_until));
                }
            }
        }

        Ok(CandidateEvaluation {
            instance_id: instance.id.clone(),
            outcome: CandidateOutcome::Allow {
                score: scorer::score(instance, intent.purpose),
            },
        })
    }

    /// Pick the winner among joined candidate evaluations and persist
    /// the corresponding transition.
    async fn select_and_record(
        &self,
        intent: MessageIntent,
        expected: IntentStatus,
        evaluations: Vec<CandidateEvaluation>,
        now: DateTime<Utc>,
    ) -> Result<IntentDecision, EngineError> {
        let mut allows: Vec<(i32, &CandidateEvaluation)> = evaluations
            .iter()
            .filter_map(|e| match e.outcome {
                CandidateOutcome::Allow { score } => Some((score, e)),
                _ => None,
            })
            .collect();

        if !allows.is_empty() {
            // Highest score wins; ties resolve to the smallest id so a
            // re-run reproduces the same winner.
            allows.sort_by(|(sa, a), (sb, b)| {
                sb.cmp(sa).then_with(|| a.instance_id.cmp(&b.instance_id))
            });
            let winner = allows[0].1.instance_id.clone();

            // The winner's verdict may have gone stale while its
            // siblings were being evaluated; re-check before acting.
            let verdict = self
                .deps
                .health
                .evaluate(&winner, HealthCheckReason::PreDispatch, now)
                .await?;
            if !verdict.allows_dispatch() {
                return match verdict.cooldown_until {
                    Some(until) => {
                        self.record_queue(
                            intent,
                            expected,
                            BlockReason::CooldownActive,
                            Some(until),
                            now,
                        )
                        .await
                    }
                    None => {
                        self.record_block(intent, expected, BlockReason::InstanceUnhealthy, now)
                            .await
                    }
                };
            }

            return self.record_approve(intent, expected, &winner, now).await;
        }

        let mut queues: Vec<&CandidateEvaluation> = evaluations
            .iter()
            .filter(|e| matches!(e.outcome, CandidateOutcome::Queue { .. }))
            .collect();

        if !queues.is_empty() {
            // Earliest known boundary first; unknown boundaries last.
            queues.sort_by_key(|e| match e.outcome {
                CandidateOutcome::Queue { queued_until, .. } => {
                    (queued_until.is_none(), queued_until)
                }
                _ => (true, None),
            });
            if let CandidateOutcome::Queue {
                reason,
                queued_until,
            } = queues[0].outcome
            {
                return self
                    .record_queue(intent, expected, reason, queued_until, now)
                    .await;
            }
        }

        let reason = evaluations
            .iter()
            .find_map(|e| match e.outcome {
                CandidateOutcome::Block { reason } => Some(reason),
                _ => None,
            })
            .unwrap_or(BlockReason::NoEligibleInstance);

        self.record_block(intent, expected, reason, now).await
    }

    async fn record_approve(
        &self,
        mut intent: MessageIntent,
        expected: IntentStatus,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IntentDecision, EngineError> {
        let events = intent.approve(instance_id, now)?;
        self.deps.intents.save_transition(&intent, expected).await?;
        self.publish(&events).await;
        info!(intent_id = %intent.id, instance_id, "intent approved");
        Ok(IntentDecision::Approved {
            instance_id: instance_id.to_string(),
        })
    }

    async fn record_queue(
        &self,
        mut intent: MessageIntent,
        expected: IntentStatus,
        reason: BlockReason,
        queued_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IntentDecision, EngineError> {
        let events = intent.queue(queued_until, reason, now)?;
        self.deps.intents.save_transition(&intent, expected).await?;
        self.publish(&events).await;
        info!(
            intent_id = %intent.id,
            reason = reason.as_str(),
            "intent queued"
        );
        Ok(IntentDecision::Queued {
            queued_until,
            reason,
        })
    }

    async fn record_block(
        &self,
        mut intent: MessageIntent,
        expected: IntentStatus,
        reason: BlockReason,
        now: DateTime<Utc>,
    ) -> Result<IntentDecision, EngineError> {
        let events = intent.block(reason, now)?;
        self.deps.intents.save_transition(&intent, expected).await?;
        self.publish(&events).await;
        info!(
            intent_id = %intent.id,
            reason = reason.as_str(),
            "intent blocked"
        );
        Ok(IntentDecision::Blocked { reason })
    }

    /// At-least-once, fire-and-forget: a failed publish is logged, not
    /// surfaced, because the transition is already durably recorded.
    async fn publish(&self, events: &[crate::intent::IntentEvent]) {
        if let Err(e) = self.deps.events.publish_many(events).await {
            warn!(error = %e, "failed to publish intent events");
        }
    }
}

/// Map the policy's reason vocabulary onto the intent gate's.
fn map_policy_reason(reason: BlockReason) -> BlockReason {
    match reason {
        BlockReason::UnsupportedMessageType => BlockReason::UnsupportedMessageType,
        BlockReason::RateLimit => BlockReason::RateLimit,
        BlockReason::Cooldown | BlockReason::Overheated => BlockReason::CooldownActive,
        BlockReason::PolicyBlocked => BlockReason::PolicyBlocked,
        _ => BlockReason::InstanceUnhealthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::control::{ControlScope, ExecutionControl};
    use crate::intent::{IntentEvent, IntentPayload, Target};
    use crate::model::RateSnapshot;
    use crate::ports::{ExecutionControlRepository, HealthVerdict, PlanLimits};

    #[derive(Default)]
    struct MemIntents {
        intents: Mutex<HashMap<String, MessageIntent>>,
        saves: Mutex<u32>,
    }

    #[async_trait]
    impl MessageIntentRepository for MemIntents {
        async fn find_by_id(&self, id: &str) -> Result<Option<MessageIntent>, EngineError> {
            Ok(self.intents.lock().unwrap().get(id).cloned())
        }

        async fn create(&self, intent: &MessageIntent) -> Result<(), EngineError> {
            self.intents
                .lock()
                .unwrap()
                .insert(intent.id.clone(), intent.clone());
            Ok(())
        }

        async fn save_transition(
            &self,
            intent: &MessageIntent,
            expected: IntentStatus,
        ) -> Result<(), EngineError> {
            let mut intents = self.intents.lock().unwrap();
            let stored = intents
                .get(&intent.id)
                .ok_or_else(|| EngineError::IntentNotFound(intent.id.clone()))?;
            if stored.status != expected {
                return Err(EngineError::ConcurrentDecision(intent.id.clone()));
            }
            intents.insert(intent.id.clone(), intent.clone());
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemInstances(Vec<Instance>);

    #[async_trait]
    impl InstanceRepository for MemInstances {
        async fn find_by_id(&self, id: &str) -> Result<Option<Instance>, EngineError> {
            Ok(self.0.iter().find(|i| i.id == id).cloned())
        }

        async fn list_by_organization(
            &self,
            organization_id: &str,
        ) -> Result<Vec<Instance>, EngineError> {
            Ok(self
                .0
                .iter()
                .filter(|i| i.organization_id == organization_id)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct MemControls {
        controls: Mutex<Vec<ExecutionControl>>,
        queried_scopes: Mutex<Vec<ControlScope>>,
    }

    #[async_trait]
    impl ExecutionControlRepository for MemControls {
        async fn find_by_scope(
            &self,
            scope: ControlScope,
            scope_id: &str,
        ) -> Result<Option<ExecutionControl>, EngineError> {
            self.queried_scopes.lock().unwrap().push(scope);
            Ok(self
                .controls
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.scope == scope && c.scope_id == scope_id)
                .cloned())
        }

        async fn upsert(&self, control: &ExecutionControl) -> Result<(), EngineError> {
            let mut controls = self.controls.lock().unwrap();
            controls.retain(|c| !(c.scope == control.scope && c.scope_id == control.scope_id));
            controls.push(control.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemRates(Mutex<HashMap<String, RateSnapshot>>);

    #[async_trait]
    impl RateSnapshotProvider for MemRates {
        async fn snapshot(
            &self,
            instance_id: &str,
            _now: DateTime<Utc>,
        ) -> Result<RateSnapshot, EngineError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .get(instance_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct MemHealth {
        verdicts: Mutex<HashMap<String, HealthVerdict>>,
    }

    #[async_trait]
    impl InstanceHealthEvaluator for MemHealth {
        async fn evaluate(
            &self,
            instance_id: &str,
            _reason: HealthCheckReason,
            _now: DateTime<Utc>,
        ) -> Result<HealthVerdict, EngineError> {
            Ok(self
                .verdicts
                .lock()
                .unwrap()
                .get(instance_id)
                .cloned()
                .unwrap_or_else(HealthVerdict::allow))
        }
    }

    #[derive(Default)]
    struct MemBus(Mutex<Vec<IntentEvent>>);

    #[async_trait]
    impl DomainEventBus for MemBus {
        async fn publish(&self, event: &IntentEvent) -> Result<(), EngineError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FixedPlan(PlanLimits);

    #[async_trait]
    impl PlanPolicy for FixedPlan {
        async fn limits(
            &self,
            _organization_id: &str,
            _intent: &MessageIntent,
            _now: DateTime<Utc>,
        ) -> Result<PlanLimits, EngineError> {
            Ok(self.0)
        }
    }

    struct Harness {
        gate: IntentGate,
        intents: Arc<MemIntents>,
        controls: Arc<MemControls>,
        health: Arc<MemHealth>,
        rates: Arc<MemRates>,
        bus: Arc<MemBus>,
    }

    fn harness(instances: Vec<Instance>, plan: Option<PlanLimits>) -> Harness {
        let intents = Arc::new(MemIntents::default());
        let controls = Arc::new(MemControls::default());
        let health = Arc::new(MemHealth::default());
        let rates = Arc::new(MemRates::default());
        let bus = Arc::new(MemBus::default());

        let gate = IntentGate::new(
            IntentGateDeps {
                intents: intents.clone(),
                instances: Arc::new(MemInstances(instances)),
                rates: rates.clone(),
                health: health.clone(),
                controls: ExecutionControlPolicy::new(controls.clone()),
                events: bus.clone(),
                plan_policy: plan.map(|l| Arc::new(FixedPlan(l)) as Arc<dyn PlanPolicy>),
            },
            DispatchPolicy::default(),
        );

        Harness {
            gate,
            intents,
            controls,
            health,
            rates,
            bus,
        }
    }

    fn ready_instance(id: &str, now: DateTime<Utc>) -> Instance {
        let mut inst = Instance::new(id, "org-1", InstancePurpose::Mixed, now - Duration::days(60));
        inst.record_connected();
        inst
    }

    fn text_intent(now: DateTime<Utc>) -> MessageIntent {
        MessageIntent::new(
            "intent-1",
            "org-1",
            Target::phone("+15550001"),
            IntentSource::Schedule,
            IntentPayload::Text {
                text: "hello".to_string(),
            },
            now,
        )
    }

    async fn seed(h: &Harness, intent: &MessageIntent) {
        h.intents.create(intent).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_intent_is_a_fault() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);

        assert!(matches!(
            h.gate.execute("missing", "org-1", now).await,
            Err(EngineError::IntentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tenant_mismatch_is_a_fault() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;

        assert!(matches!(
            h.gate.execute("intent-1", "org-2", now).await,
            Err(EngineError::TenantMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_instances_blocks_and_persists() {
        let now = Utc::now();
        let h = harness(vec![], None);
        seed(&h, &text_intent(now)).await;

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Blocked {
                reason: BlockReason::NoEligibleInstance
            }
        );
        let stored = h.intents.find_by_id("intent-1").await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Blocked);
        assert_eq!(
            stored.blocked_reason,
            Some(BlockReason::NoEligibleInstance)
        );
        assert_eq!(h.bus.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_org_pause_blocks_before_instance_checks() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        h.controls
            .upsert(&ExecutionControl::paused(
                ControlScope::Organization,
                "org-1",
                Some("maintenance".to_string()),
                None,
                now,
            ))
            .await
            .unwrap();
        h.controls.queried_scopes.lock().unwrap().clear();

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Blocked {
                reason: BlockReason::OpsPaused
            }
        );
        // Only the organization switch was ever consulted.
        let scopes = h.controls.queried_scopes.lock().unwrap().clone();
        assert_eq!(scopes, vec![ControlScope::Organization]);
    }

    #[tokio::test]
    async fn test_idempotent_replay_writes_nothing() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;

        let first = h.gate.execute("intent-1", "org-1", now).await.unwrap();
        let saves_after_first = *h.intents.saves.lock().unwrap();

        let second = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(*h.intents.saves.lock().unwrap(), saves_after_first);
        // Events were published exactly once.
        assert_eq!(h.bus.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_highest_score_wins_with_deterministic_ties() {
        let now = Utc::now();
        // inst-b carries risk flags; inst-a and inst-c tie at the top.
        let mut risky = ready_instance("inst-b", now);
        risky.reputation.risk_flags = 4;
        let h = harness(
            vec![
                ready_instance("inst-c", now),
                risky,
                ready_instance("inst-a", now),
            ],
            None,
        );
        seed(&h, &text_intent(now)).await;

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Approved {
                instance_id: "inst-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stale_health_downgrades_to_queue() {
        let now = Utc::now();
        let until = now + Duration::minutes(30);
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        h.health.verdicts.lock().unwrap().insert(
            "inst-a".to_string(),
            HealthVerdict {
                cooldown_until: Some(until),
                ..HealthVerdict::default()
            },
        );

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Queued {
                queued_until: Some(until),
                reason: BlockReason::CooldownActive
            }
        );
    }

    #[tokio::test]
    async fn test_stale_health_without_horizon_blocks_unhealthy() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        h.health
            .verdicts
            .lock()
            .unwrap()
            .insert("inst-a".to_string(), HealthVerdict::default());

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Blocked {
                reason: BlockReason::InstanceUnhealthy
            }
        );
    }

    #[tokio::test]
    async fn test_cooldown_candidate_queues_until_cooldown_plus_hour() {
        let now = Utc::now();
        let mut inst = ready_instance("inst-a", now);
        let started = now - Duration::minutes(10);
        inst.ingest_risk_signal(crate::instance::RiskSignal::SpamReport, started);
        let h = harness(vec![inst], None);
        seed(&h, &text_intent(now)).await;

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Queued {
                queued_until: Some(started + Duration::hours(1)),
                reason: BlockReason::CooldownActive
            }
        );
        let stored = h.intents.find_by_id("intent-1").await.unwrap().unwrap();
        assert!(stored.is_queued());
    }

    #[tokio::test]
    async fn test_queued_intent_is_genuinely_reevaluated() {
        let now = Utc::now();
        let mut inst = ready_instance("inst-a", now);
        let started = now - Duration::minutes(10);
        inst.ingest_risk_signal(crate::instance::RiskSignal::SpamReport, started);
        let healthy_later = {
            let mut i = inst.clone();
            i.ingest_risk_signal(crate::instance::RiskSignal::Cleared, now);
            i
        };

        // First pass: queued because of cooldown.
        let h = harness(vec![inst], None);
        seed(&h, &text_intent(now)).await;
        let first = h.gate.execute("intent-1", "org-1", now).await.unwrap();
        assert!(matches!(first, IntentDecision::Queued { .. }));

        // Second pass against a recovered fleet: the queued intent is
        // re-run, not replayed.
        let queued = h.intents.find_by_id("intent-1").await.unwrap().unwrap();
        let h2 = harness(vec![healthy_later], None);
        h2.intents.create(&queued).await.unwrap();
        let second = h2.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            second,
            IntentDecision::Approved {
                instance_id: "inst-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_recent_duplicate_text_blocks_rate_limit() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        let mut snapshot = RateSnapshot::default();
        snapshot
            .recent_text_signatures
            .insert(RateSnapshot::text_signature("+15550001", "hello"));
        h.rates
            .0
            .lock()
            .unwrap()
            .insert("inst-a".to_string(), snapshot);

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Blocked {
                reason: BlockReason::RateLimit
            }
        );
        let stored = h.intents.find_by_id("intent-1").await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Blocked);
    }

    #[tokio::test]
    async fn test_min_interval_queues_to_boundary() {
        // Ready phase, low risk: 12/hour with a 60s minimum interval.
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        let last = now - Duration::seconds(30);
        h.rates.0.lock().unwrap().insert(
            "inst-a".to_string(),
            RateSnapshot {
                sent_last_hour: 1,
                last_message_at: Some(last),
                ..RateSnapshot::default()
            },
        );

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Queued {
                queued_until: Some(last + Duration::seconds(60)),
                reason: BlockReason::RateLimit
            }
        );
    }

    #[tokio::test]
    async fn test_hourly_cap_queues_until_window_frees() {
        let now = Utc::now();
        let h = harness(vec![ready_instance("inst-a", now)], None);
        seed(&h, &text_intent(now)).await;
        let oldest = now - Duration::minutes(50);
        h.rates.0.lock().unwrap().insert(
            "inst-a".to_string(),
            RateSnapshot {
                sent_last_hour: 12,
                last_message_at: Some(now - Duration::minutes(5)),
                oldest_in_hour_at: Some(oldest),
                ..RateSnapshot::default()
            },
        );

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Queued {
                queued_until: Some(oldest + Duration::hours(1)),
                reason: BlockReason::RateLimit
            }
        );
        let stored = h.intents.find_by_id("intent-1").await.unwrap().unwrap();
        assert!(stored.is_queued());
    }

    #[tokio::test]
    async fn test_warmup_only_instance_rejected_for_real_traffic() {
        let now = Utc::now();
        let mut inst = ready_instance("inst-a", now);
        inst.purpose = InstancePurpose::Warmup;
        let h = harness(vec![inst], None);
        seed(&h, &text_intent(now)).await;

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Blocked {
                reason: BlockReason::NoEligibleInstance
            }
        );
    }

    #[tokio::test]
    async fn test_plan_limit_queues() {
        let now = Utc::now();
        let h = harness(
            vec![ready_instance("inst-a", now)],
            Some(PlanLimits {
                max_messages_per_minute: Some(0),
                max_messages_per_hour: None,
            }),
        );
        seed(&h, &text_intent(now)).await;

        let decision = h.gate.execute("intent-1", "org-1", now).await.unwrap();

        assert_eq!(
            decision,
            IntentDecision::Queued {
                queued_until: Some(now + Duration::minutes(1)),
                reason: BlockReason::PlanLimit
            }
        );
    }
}
