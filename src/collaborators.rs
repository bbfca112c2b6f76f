//! Adapters for the engine's external collaborators.
//!
//! HTTP clients (reqwest) for the instance-health service and the
//! physical message gateway, plus the in-process collaborators: a
//! permissive static health evaluator for deployments without a health
//! service, a response-time SLA evaluator, a tracing-backed event bus,
//! and fixed warm-up target/content providers.
//!
//! All HTTP clients take a base-URL override for testing, like the rest
//! of the outbound clients in this codebase.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::intent::IntentEvent;
use crate::ports::{
    Conversation, DomainEventBus, EngineError, HealthCheckReason, HealthVerdict,
    InstanceHealthEvaluator, Presence, PresenceDispatcher, SlaStatus, SlaEvaluator,
    WarmUpContentProvider, WarmUpTargetsProvider,
};

/// Hours an inbound message may sit unanswered before follow-up
/// outreach is authorized.
const DEFAULT_SLA_HOURS: i64 = 24;

/// Client for an external instance-health service.
///
/// `POST {base}/evaluations` with the instance id and check reason; the
/// service answers with a [`HealthVerdict`].
#[derive(Clone)]
pub struct HttpHealthEvaluator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    instance_id: &'a str,
    reason: &'a str,
    at: DateTime<Utc>,
}

impl HttpHealthEvaluator {
    /// Create a client against the given service base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InstanceHealthEvaluator for HttpHealthEvaluator {
    async fn evaluate(
        &self,
        instance_id: &str,
        reason: HealthCheckReason,
        now: DateTime<Utc>,
    ) -> Result<HealthVerdict, EngineError> {
        let url = format!("{}/evaluations", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&EvaluationRequest {
                instance_id,
                reason: reason.as_str(),
                at: now,
            })
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?;

        let verdict = response
            .json::<HealthVerdict>()
            .await
            .map_err(anyhow::Error::from)?;
        Ok(verdict)
    }
}

/// Permissive evaluator for deployments without a health service.
///
/// Always allows; the policy's own reputation checks remain in force.
#[derive(Clone, Default)]
pub struct StaticHealthEvaluator;

#[async_trait]
impl InstanceHealthEvaluator for StaticHealthEvaluator {
    async fn evaluate(
        &self,
        _instance_id: &str,
        _reason: HealthCheckReason,
        _now: DateTime<Utc>,
    ) -> Result<HealthVerdict, EngineError> {
        Ok(HealthVerdict::allow())
    }
}

/// Client for the message gateway's presence endpoint.
#[derive(Clone)]
pub struct HttpPresenceDispatcher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct PresenceRequest<'a> {
    instance_id: &'a str,
    presence: &'a str,
}

impl HttpPresenceDispatcher {
    /// Create a client against the given gateway base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PresenceDispatcher for HttpPresenceDispatcher {
    async fn set_presence(
        &self,
        instance_id: &str,
        presence: Presence,
    ) -> Result<(), EngineError> {
        let url = format!("{}/presence", self.base_url);

        self.client
            .post(&url)
            .json(&PresenceRequest {
                instance_id,
                presence: presence.as_str(),
            })
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?;

        Ok(())
    }
}

/// Response-time SLA: breached iff the conversation has an inbound
/// message that has waited longer than the threshold without an answer.
#[derive(Clone)]
pub struct ResponseTimeSla {
    threshold: Duration,
}

impl Default for ResponseTimeSla {
    fn default() -> Self {
        Self {
            threshold: Duration::hours(DEFAULT_SLA_HOURS),
        }
    }
}

impl ResponseTimeSla {
    /// Build an evaluator with a custom threshold.
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl SlaEvaluator for ResponseTimeSla {
    async fn evaluate(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Result<SlaStatus, EngineError> {
        let Some(inbound_at) = conversation.last_inbound_at else {
            // Nothing to answer; no breach, no follow-up privilege.
            return Ok(SlaStatus::NotBreached);
        };

        // An outbound sent after the inbound counts as the answer.
        let answered = conversation
            .last_outbound_at
            .is_some_and(|outbound_at| outbound_at >= inbound_at);
        if answered {
            return Ok(SlaStatus::NotBreached);
        }

        if now - inbound_at > self.threshold {
            Ok(SlaStatus::Breached)
        } else {
            Ok(SlaStatus::NotBreached)
        }
    }
}

/// Dispatcher for deployments without a message gateway configured.
///
/// Logs the presence change and succeeds. Keeps the warm-up scheduler
/// runnable in development.
#[derive(Clone, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl PresenceDispatcher for TracingDispatcher {
    async fn set_presence(
        &self,
        instance_id: &str,
        presence: Presence,
    ) -> Result<(), EngineError> {
        info!(instance_id, presence = presence.as_str(), "presence (dry run)");
        Ok(())
    }
}

/// Event bus that publishes domain events as structured log records.
///
/// Production wiring uses storage as the bus (events land in the audit
/// table); this one serves tests and log-only deployments.
#[derive(Clone, Default)]
pub struct TracingEventBus;

#[async_trait]
impl DomainEventBus for TracingEventBus {
    async fn publish(&self, event: &IntentEvent) -> Result<(), EngineError> {
        info!(
            event = event.name(),
            intent_id = event.intent_id(),
            "domain event"
        );
        Ok(())
    }
}

/// Fixed warm-up recipients, configured at startup.
#[derive(Clone)]
pub struct StaticWarmUpTargets {
    targets: Arc<Vec<String>>,
}

impl StaticWarmUpTargets {
    /// Build from the configured recipient list.
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets: Arc::new(targets),
        }
    }
}

#[async_trait]
impl WarmUpTargetsProvider for StaticWarmUpTargets {
    async fn targets(&self, _instance_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.targets.as_ref().clone())
    }
}

/// Rotating short texts for warm-up traffic.
///
/// Deterministic rotation keyed on the instance id keeps consecutive
/// ticks from tripping the duplicate-text suppression while staying
/// reproducible in tests.
#[derive(Clone)]
pub struct RotatingWarmUpContent {
    phrases: Arc<Vec<String>>,
}

impl Default for RotatingWarmUpContent {
    fn default() -> Self {
        Self {
            phrases: Arc::new(
                [
                    "hey, how's your week going?",
                    "good morning!",
                    "did you catch the game yesterday?",
                    "thinking of grabbing coffee later",
                    "hope you're doing well",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
        }
    }
}

#[async_trait]
impl WarmUpContentProvider for RotatingWarmUpContent {
    async fn short_text(&self, instance_id: &str) -> Result<String, EngineError> {
        let seed = instance_id
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_add(usize::from(b)))
            .wrapping_add(Utc::now().timestamp() as usize / 3600);
        let index = seed % self.phrases.len();
        Ok(self.phrases[index].clone())
    }
}
