//! The warm-up scheduler ("heater").
//!
//! A young instance earns sending volume by behaving like a human
//! account: appearing online, typing, and sending the occasional short
//! text. On each tick the heater checks the instance's health
//! (reason=CRON), derives its warm-up phase, and asks the configured
//! strategy for a small plan of low-risk actions.
//!
//! Text actions are converted into [`MessageIntent`]s and routed through
//! the multi-instance gate, so warm-up traffic obeys the same admission
//! rules as anything else; once approved, the fleet's normal dispatch
//! pipeline picks the intent up. Presence actions go through a guarded
//! direct path: a fresh PRE_DISPATCH health check and a reputation check
//! immediately before the call. The plan stops on the first action that
//! fails or is not admitted.
//!
//! Ticking is the caller's job; the heater runs one instance per call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::instance::{Instance, WarmUpPhase, WarmUpTimeline};
use crate::intent::{IntentPayload, MessageIntent, Target};
use crate::intent_gate::IntentGate;
use crate::model::{IntentDecision, IntentSource};
use crate::ports::{
    EngineError, HealthCheckReason, InstanceHealthEvaluator, InstanceRepository,
    MessageIntentRepository, Presence, PresenceDispatcher, WarmUpContentProvider,
    WarmUpTargetsProvider,
};

/// One low-risk action in a warm-up plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmUpAction {
    /// Change the instance's presence.
    Presence(Presence),
    /// Send one short text to a warm-up recipient.
    ShortText { to: String, text: String },
}

/// Produces the ordered action plan for an instance in a given phase.
#[async_trait]
pub trait WarmUpStrategy: Send + Sync {
    /// The plan for this tick. An empty plan is a valid answer.
    async fn plan(
        &self,
        instance: &Instance,
        phase: WarmUpPhase,
    ) -> Result<Vec<WarmUpAction>, EngineError>;
}

/// The default phase plan: presence-only while the account merely
/// observes, a single short text once it starts interacting, nothing
/// once it is social or ready (real traffic takes over from there).
pub struct PhasedWarmUpStrategy {
    targets: Arc<dyn WarmUpTargetsProvider>,
    content: Arc<dyn WarmUpContentProvider>,
}

impl PhasedWarmUpStrategy {
    /// Build the strategy over its target and content sources.
    pub fn new(
        targets: Arc<dyn WarmUpTargetsProvider>,
        content: Arc<dyn WarmUpContentProvider>,
    ) -> Self {
        Self { targets, content }
    }
}

#[async_trait]
impl WarmUpStrategy for PhasedWarmUpStrategy {
    async fn plan(
        &self,
        instance: &Instance,
        phase: WarmUpPhase,
    ) -> Result<Vec<WarmUpAction>, EngineError> {
        match phase {
            WarmUpPhase::Newborn => Ok(vec![WarmUpAction::Presence(Presence::Available)]),
            WarmUpPhase::Observer => Ok(vec![
                WarmUpAction::Presence(Presence::Available),
                WarmUpAction::Presence(Presence::Typing),
            ]),
            WarmUpPhase::Interacting => {
                let Some(to) = self.targets.targets(&instance.id).await?.into_iter().next()
                else {
                    return Ok(vec![]);
                };
                let text = self.content.short_text(&instance.id).await?;
                Ok(vec![WarmUpAction::ShortText { to, text }])
            }
            WarmUpPhase::Social | WarmUpPhase::Ready => Ok(vec![]),
        }
    }
}

/// What one heater tick did.
#[derive(Debug, Clone, Serialize)]
pub struct HeaterReport {
    /// The instance that was ticked.
    pub instance_id: String,
    /// The phase the plan was derived from.
    pub phase: WarmUpPhase,
    /// Actions the strategy planned.
    pub planned: usize,
    /// Actions that completed (or were admitted) before any stop.
    pub completed: usize,
    /// Whether the plan was cut short.
    pub stopped: bool,
}

/// Dependencies of the heater.
#[derive(Clone)]
pub struct HeaterDeps {
    /// Instance fleet reads.
    pub instances: Arc<dyn InstanceRepository>,
    /// Health checks, both CRON and PRE_DISPATCH.
    pub health: Arc<dyn InstanceHealthEvaluator>,
    /// Intent persistence, for created warm-up intents.
    pub intents: Arc<dyn MessageIntentRepository>,
    /// The admission gate warm-up texts go through.
    pub gate: IntentGate,
    /// Direct dispatch for presence actions.
    pub dispatcher: Arc<dyn PresenceDispatcher>,
    /// Plan source.
    pub strategy: Arc<dyn WarmUpStrategy>,
}

/// Runs one warm-up tick for one instance.
pub struct HeaterUseCase {
    deps: HeaterDeps,
    timeline: WarmUpTimeline,
}

impl HeaterUseCase {
    /// Build the heater.
    pub fn new(deps: HeaterDeps, timeline: WarmUpTimeline) -> Self {
        Self { deps, timeline }
    }

    /// Tick one instance at `now`.
    pub async fn execute(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<HeaterReport, EngineError> {
        let instance = self
            .deps
            .instances
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;

        let phase = instance.reputation.warm_up_phase(now, &self.timeline);

        let verdict = self
            .deps
            .health
            .evaluate(instance_id, HealthCheckReason::Cron, now)
            .await?;
        if !verdict.allows_dispatch() || !instance.can_warm_up() {
            info!(instance_id, "warm-up tick skipped, instance not healthy");
            return Ok(HeaterReport {
                instance_id: instance_id.to_string(),
                phase,
                planned: 0,
                completed: 0,
                stopped: true,
            });
        }

        let plan = self.deps.strategy.plan(&instance, phase).await?;
        let planned = plan.len();
        let mut completed = 0;

        for (index, action) in plan.into_iter().enumerate() {
            let done = match action {
                WarmUpAction::Presence(presence) => {
                    self.guarded_presence(&instance, presence, now).await?
                }
                WarmUpAction::ShortText { to, text } => {
                    self.admit_text(&instance, &to, text, index, now).await?
                }
            };
            if !done {
                return Ok(HeaterReport {
                    instance_id: instance_id.to_string(),
                    phase,
                    planned,
                    completed,
                    stopped: true,
                });
            }
            completed += 1;
        }

        info!(instance_id, phase = phase.as_str(), completed, "warm-up tick done");
        Ok(HeaterReport {
            instance_id: instance_id.to_string(),
            phase,
            planned,
            completed,
            stopped: false,
        })
    }

    /// Presence change with a fresh pre-dispatch guard. Returns whether
    /// the action completed.
    async fn guarded_presence(
        &self,
        instance: &Instance,
        presence: Presence,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let verdict = self
            .deps
            .health
            .evaluate(&instance.id, HealthCheckReason::PreDispatch, now)
            .await?;
        if !verdict.allows_dispatch() || !instance.reputation.can_dispatch() {
            warn!(
                instance_id = %instance.id,
                presence = presence.as_str(),
                "presence action refused by pre-dispatch guard"
            );
            return Ok(false);
        }

        if let Err(e) = self
            .deps
            .dispatcher
            .set_presence(&instance.id, presence)
            .await
        {
            warn!(instance_id = %instance.id, error = %e, "presence dispatch failed");
            return Ok(false);
        }
        Ok(true)
    }

    /// Create a warm-up intent and run it through the admission gate.
    /// The action counts as completed only when the gate approves.
    async fn admit_text(
        &self,
        instance: &Instance,
        to: &str,
        text: String,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let intent_id = format!(
            "warmup-{}-{}-{}",
            instance.id,
            now.timestamp_millis(),
            index
        );
        let intent = MessageIntent::new(
            &intent_id,
            &instance.organization_id,
            Target::phone(to),
            IntentSource::Warmup,
            IntentPayload::Text { text },
            now,
        );
        self.deps.intents.create(&intent).await?;

        let decision = self
            .deps
            .gate
            .execute(&intent_id, &instance.organization_id, now)
            .await?;

        match decision {
            IntentDecision::Approved { .. } => Ok(true),
            IntentDecision::Queued { reason, .. } | IntentDecision::Blocked { reason } => {
                info!(
                    instance_id = %instance.id,
                    intent_id,
                    reason = reason.as_str(),
                    "warm-up text not admitted"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Duration;

    use crate::control::{ControlScope, ExecutionControl, ExecutionControlPolicy};
    use crate::instance::InstancePurpose;
    use crate::intent::IntentStatus;
    use crate::intent_gate::IntentGateDeps;
    use crate::model::RateSnapshot;
    use crate::policy::DispatchPolicy;
    use crate::ports::{
        DomainEventBus, ExecutionControlRepository, HealthVerdict, RateSnapshotProvider,
    };
    use crate::intent::IntentEvent;

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
    struct MemIntents(Mutex<HashMap<String, MessageIntent>>);

    #[async_trait]
    impl MessageIntentRepository for MemIntents {
        async fn find_by_id(&self, id: &str) -> Result<Option<MessageIntent>, EngineError> {
            Ok(self.0.lock().unwrap().get(id).cloned())
        }

        async fn create(&self, intent: &MessageIntent) -> Result<(), EngineError> {
            self.0
                .lock()
                .unwrap()
                .insert(intent.id.clone(), intent.clone());
            Ok(())
        }

        async fn save_transition(
            &self,
            intent: &MessageIntent,
            _expected: IntentStatus,
        ) -> Result<(), EngineError> {
            self.0
                .lock()
                .unwrap()
                .insert(intent.id.clone(), intent.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemControls(Mutex<Vec<ExecutionControl>>);

    #[async_trait]
    impl ExecutionControlRepository for MemControls {
        async fn find_by_scope(
            &self,
            scope: ControlScope,
            scope_id: &str,
        ) -> Result<Option<ExecutionControl>, EngineError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.scope == scope && c.scope_id == scope_id)
                .cloned())
        }

        async fn upsert(&self, control: &ExecutionControl) -> Result<(), EngineError> {
            self.0.lock().unwrap().push(control.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemRates;

    #[async_trait]
    impl RateSnapshotProvider for MemRates {
        async fn snapshot(
            &self,
            _instance_id: &str,
            _now: DateTime<Utc>,
        ) -> Result<RateSnapshot, EngineError> {
            Ok(RateSnapshot::default())
        }
    }

    struct FixedHealth {
        cron: HealthVerdict,
        pre_dispatch: HealthVerdict,
        calls: Mutex<Vec<HealthCheckReason>>,
    }

    impl FixedHealth {
        fn allowing() -> Self {
            Self {
                cron: HealthVerdict::allow(),
                pre_dispatch: HealthVerdict::allow(),
                calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl InstanceHealthEvaluator for FixedHealth {
        async fn evaluate(
            &self,
            _instance_id: &str,
            reason: HealthCheckReason,
            _now: DateTime<Utc>,
        ) -> Result<HealthVerdict, EngineError> {
            self.calls.lock().unwrap().push(reason);
            Ok(match reason {
                HealthCheckReason::Cron => self.cron.clone(),
                _ => self.pre_dispatch.clone(),
            })
        }
    }

    #[derive(Default)]
    struct NullBus;

    #[async_trait]
    impl DomainEventBus for NullBus {
        async fn publish(&self, _event: &IntentEvent) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        presences: Mutex<Vec<Presence>>,
        fail: bool,
    }

    #[async_trait]
    impl PresenceDispatcher for RecordingDispatcher {
        async fn set_presence(
            &self,
            _instance_id: &str,
            presence: Presence,
        ) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::Collaborator(anyhow::anyhow!("gateway down")));
            }
            self.presences.lock().unwrap().push(presence);
            Ok(())
        }
    }

    struct FixedTargets(Vec<String>);

    #[async_trait]
    impl WarmUpTargetsProvider for FixedTargets {
        async fn targets(&self, _instance_id: &str) -> Result<Vec<String>, EngineError> {
            Ok(self.0.clone())
        }
    }

    struct FixedContent;

    #[async_trait]
    impl WarmUpContentProvider for FixedContent {
        async fn short_text(&self, _instance_id: &str) -> Result<String, EngineError> {
            Ok("hey, how's it going?".to_string())
        }
    }

    struct Harness {
        heater: HeaterUseCase,
        health: Arc<FixedHealth>,
        dispatcher: Arc<RecordingDispatcher>,
        intents: Arc<MemIntents>,
    }

    fn harness(instances: Vec<Instance>, health: FixedHealth, fail_dispatch: bool) -> Harness {
        let instances = Arc::new(MemInstances(instances));
        let intents = Arc::new(MemIntents::default());
        let health = Arc::new(health);
        let dispatcher = Arc::new(RecordingDispatcher {
            presences: Mutex::new(vec![]),
            fail: fail_dispatch,
        });

        let gate = IntentGate::new(
            IntentGateDeps {
                intents: intents.clone(),
                instances: instances.clone(),
                rates: Arc::new(MemRates),
                health: health.clone(),
                controls: ExecutionControlPolicy::new(Arc::new(MemControls::default())),
                events: Arc::new(NullBus),
                plan_policy: None,
            },
            DispatchPolicy::default(),
        );

        let strategy = Arc::new(PhasedWarmUpStrategy::new(
            Arc::new(FixedTargets(vec!["+15550002".to_string()])),
            Arc::new(FixedContent),
        ));

        let heater = HeaterUseCase::new(
            HeaterDeps {
                instances,
                health: health.clone(),
                intents: intents.clone(),
                gate,
                dispatcher: dispatcher.clone(),
                strategy,
            },
            WarmUpTimeline::default(),
        );

        Harness {
            heater,
            health,
            dispatcher,
            intents,
        }
    }

    fn instance_aged(days: i64, now: DateTime<Utc>) -> Instance {
        let mut inst = Instance::new(
            "inst-1",
            "org-1",
            InstancePurpose::Warmup,
            now - Duration::days(days),
        );
        inst.record_connected();
        inst
    }

    #[tokio::test]
    async fn test_unknown_instance_is_a_fault() {
        let now = Utc::now();
        let h = harness(vec![], FixedHealth::allowing(), false);

        assert!(matches!(
            h.heater.execute("missing", now).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cron_veto_skips_the_plan() {
        let now = Utc::now();
        let health = FixedHealth {
            cron: HealthVerdict::default(),
            pre_dispatch: HealthVerdict::allow(),
            calls: Mutex::new(vec![]),
        };
        let h = harness(vec![instance_aged(1, now)], health, false);

        let report = h.heater.execute("inst-1", now).await.unwrap();

        assert!(report.stopped);
        assert_eq!(report.planned, 0);
        assert!(h.dispatcher.presences.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_newborn_runs_presence_with_guard() {
        let now = Utc::now();
        let h = harness(vec![instance_aged(1, now)], FixedHealth::allowing(), false);

        let report = h.heater.execute("inst-1", now).await.unwrap();

        assert_eq!(report.phase, WarmUpPhase::Newborn);
        assert_eq!(report.completed, 1);
        assert!(!report.stopped);
        assert_eq!(
            *h.dispatcher.presences.lock().unwrap(),
            vec![Presence::Available]
        );
        // One CRON check, then one PRE_DISPATCH guard per presence action.
        assert_eq!(
            *h.health.calls.lock().unwrap(),
            vec![HealthCheckReason::Cron, HealthCheckReason::PreDispatch]
        );
    }

    #[tokio::test]
    async fn test_interacting_text_goes_through_the_gate() {
        let now = Utc::now();
        let h = harness(vec![instance_aged(8, now)], FixedHealth::allowing(), false);

        let report = h.heater.execute("inst-1", now).await.unwrap();

        assert_eq!(report.phase, WarmUpPhase::Interacting);
        assert_eq!(report.planned, 1);
        assert_eq!(report.completed, 1);
        let intents = h.intents.0.lock().unwrap();
        let intent = intents.values().next().unwrap();
        assert_eq!(intent.purpose, IntentSource::Warmup);
        assert_eq!(intent.status, IntentStatus::Approved);
    }

    #[tokio::test]
    async fn test_dispatch_failure_stops_the_plan() {
        let now = Utc::now();
        // OBSERVER plans two presence actions; the first fails.
        let h = harness(vec![instance_aged(4, now)], FixedHealth::allowing(), true);

        let report = h.heater.execute("inst-1", now).await.unwrap();

        assert_eq!(report.planned, 2);
        assert_eq!(report.completed, 0);
        assert!(report.stopped);
    }

    #[tokio::test]
    async fn test_mature_instance_gets_an_empty_plan() {
        let now = Utc::now();
        let h = harness(vec![instance_aged(40, now)], FixedHealth::allowing(), false);

        let report = h.heater.execute("inst-1", now).await.unwrap();

        assert_eq!(report.phase, WarmUpPhase::Ready);
        assert_eq!(report.planned, 0);
        assert!(!report.stopped);
    }
}
