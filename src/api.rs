//! HTTP API handlers for embergate.
//!
//! The handlers are a thin shell over the gates: deserialize, call,
//! record the decision in the log, serialize. Decision recording lives
//! here rather than inside the gates because it is observability, not
//! admission control; a failed log write degrades metrics, never a
//! decision.
//!
//! # Endpoints
//!
//! - `POST /dispatch` - Single-intent gate: may this instance send now?
//! - `POST /intents` - Create a pending message intent
//! - `POST /intents/{id}/resolve` - Multi-instance gate decision
//! - `POST /controls/pause` / `POST /controls/resume` - Pause switches
//! - `POST /heater/{instance_id}/tick` - One warm-up tick
//! - `GET /metrics/decisions` - Decision counts over a lookback window
//! - `GET /health` - Health check

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::control::{ControlScope, ExecutionControlPolicy};
use crate::gate::{DispatchGate, DispatchRequest};
use crate::heater::{HeaterReport, HeaterUseCase};
use crate::intent::{IntentPayload, MessageIntent, Target, TargetKind};
use crate::intent_gate::IntentGate;
use crate::metrics::{self, DEFAULT_LOOKBACK_MINUTES, DecisionSummary};
use crate::model::{GateDecision, IntentDecision, IntentSource};
use crate::ports::EngineError;
use crate::storage::{DecisionRecord, Storage};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub dispatch_gate: DispatchGate,
    pub intent_gate: IntentGate,
    pub controls: ExecutionControlPolicy,
    pub heater: Arc<HeaterUseCase>,
}

/// Map engine faults onto HTTP statuses. Decision values never come
/// through here; they serialize as 200 bodies.
fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::IntentNotFound(_)
        | EngineError::InstanceNotFound(_)
        | EngineError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::ConversationRequired => StatusCode::BAD_REQUEST,
        EngineError::TenantMismatch { .. } => StatusCode::FORBIDDEN,
        EngineError::ConcurrentDecision(_) => StatusCode::CONFLICT,
        EngineError::Transition(_) => StatusCode::CONFLICT,
        EngineError::Collaborator(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
pub struct DispatchBody {
    pub instance_id: String,
    pub source: IntentSource,
    pub to: String,
    pub payload: IntentPayload,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// POST /dispatch - Run the single-intent gate for a known instance.
///
/// Returns the gate decision as a value; a refusal is a 200 with a
/// `blocked` outcome, not an error status.
#[instrument(skip(state, body), fields(instance_id = %body.instance_id))]
pub async fn post_dispatch(
    State(state): State<AppState>,
    Json(body): Json<DispatchBody>,
) -> Result<Json<GateDecision>, StatusCode> {
    let now = Utc::now();
    let request = DispatchRequest {
        instance_id: body.instance_id.clone(),
        source: body.source,
        to: body.to,
        payload: body.payload,
        conversation_id: body.conversation_id,
    };

    match state.dispatch_gate.execute(&request, now).await {
        Ok(decision) => {
            record_gate_decision(&state, &body.instance_id, &decision, now).await;
            info!(
                instance_id = %body.instance_id,
                allowed = decision.is_allowed(),
                "dispatch decided"
            );
            Ok(Json(decision))
        }
        Err(e) => {
            warn!(instance_id = %body.instance_id, error = %e, "dispatch failed");
            Err(status_for(&e))
        }
    }
}

async fn record_gate_decision(
    state: &AppState,
    instance_id: &str,
    decision: &GateDecision,
    now: DateTime<Utc>,
) {
    let (outcome, reason) = match decision {
        GateDecision::Allowed => ("ALLOWED", None),
        GateDecision::Blocked {
            reason,
            delayed_until: Some(_),
        } => ("DELAYED", Some(*reason)),
        GateDecision::Blocked {
            reason,
            delayed_until: None,
        } => ("BLOCKED", Some(*reason)),
    };

    let record = DecisionRecord {
        organization_id: None,
        instance_id: Some(instance_id.to_string()),
        outcome: outcome.to_string(),
        reason,
        at: now,
    };
    if let Err(e) = state.storage.record_decision(&record).await {
        warn!(error = %e, "failed to record gate decision");
    }
}

#[derive(Deserialize)]
pub struct CreateIntentBody {
    pub id: String,
    pub organization_id: String,
    pub target_kind: TargetKind,
    pub target_value: String,
    pub purpose: IntentSource,
    pub payload: IntentPayload,
}

/// POST /intents - Create a pending message intent.
///
/// Returns `201 Created`; resolution is a separate call.
#[instrument(skip(state, body), fields(intent_id = %body.id))]
pub async fn post_intent(
    State(state): State<AppState>,
    Json(body): Json<CreateIntentBody>,
) -> Result<StatusCode, StatusCode> {
    use crate::ports::MessageIntentRepository;

    let intent = MessageIntent::new(
        &body.id,
        &body.organization_id,
        Target {
            kind: body.target_kind,
            value: body.target_value,
        },
        body.purpose,
        body.payload,
        Utc::now(),
    );

    match state.storage.create(&intent).await {
        Ok(()) => {
            info!(intent_id = %intent.id, organization_id = %intent.organization_id, "intent created");
            Ok(StatusCode::CREATED)
        }
        Err(e) => {
            warn!(intent_id = %body.id, error = %e, "failed to create intent");
            Err(status_for(&e))
        }
    }
}

#[derive(Deserialize)]
pub struct ResolveIntentBody {
    pub organization_id: String,
}

/// POST /intents/{id}/resolve - Resolve an intent through the
/// multi-instance gate.
#[instrument(skip(state, body), fields(intent_id = %intent_id))]
pub async fn post_resolve_intent(
    State(state): State<AppState>,
    Path(intent_id): Path<String>,
    Json(body): Json<ResolveIntentBody>,
) -> Result<Json<IntentDecision>, StatusCode> {
    let now = Utc::now();

    match state
        .intent_gate
        .execute(&intent_id, &body.organization_id, now)
        .await
    {
        Ok(decision) => {
            record_intent_decision(&state, &body.organization_id, &decision, now).await;
            Ok(Json(decision))
        }
        Err(e) => {
            warn!(intent_id = %intent_id, error = %e, "intent resolution failed");
            Err(status_for(&e))
        }
    }
}

async fn record_intent_decision(
    state: &AppState,
    organization_id: &str,
    decision: &IntentDecision,
    now: DateTime<Utc>,
) {
    let (outcome, instance_id, reason) = match decision {
        IntentDecision::Approved { instance_id } => {
            ("APPROVED", Some(instance_id.clone()), None)
        }
        IntentDecision::Queued { reason, .. } => ("QUEUED", None, Some(*reason)),
        IntentDecision::Blocked { reason } => ("BLOCKED", None, Some(*reason)),
    };

    let record = DecisionRecord {
        organization_id: Some(organization_id.to_string()),
        instance_id,
        outcome: outcome.to_string(),
        reason,
        at: now,
    };
    if let Err(e) = state.storage.record_decision(&record).await {
        warn!(error = %e, "failed to record intent decision");
    }
}

#[derive(Deserialize)]
pub struct PauseBody {
    pub scope: ControlScope,
    pub scope_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// POST /controls/pause - Engage a pause switch.
#[instrument(skip(state, body), fields(scope = body.scope.as_str(), scope_id = %body.scope_id))]
pub async fn post_pause(
    State(state): State<AppState>,
    Json(body): Json<PauseBody>,
) -> impl IntoResponse {
    match state
        .controls
        .pause(body.scope, &body.scope_id, body.reason, body.until, Utc::now())
        .await
    {
        Ok(()) => {
            info!(scope = body.scope.as_str(), scope_id = %body.scope_id, "paused");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(scope_id = %body.scope_id, error = %e, "pause failed");
            status_for(&e)
        }
    }
}

#[derive(Deserialize)]
pub struct ResumeBody {
    pub scope: ControlScope,
    pub scope_id: String,
}

/// POST /controls/resume - Disengage a pause switch. Idempotent.
#[instrument(skip(state, body), fields(scope = body.scope.as_str(), scope_id = %body.scope_id))]
pub async fn post_resume(
    State(state): State<AppState>,
    Json(body): Json<ResumeBody>,
) -> impl IntoResponse {
    match state
        .controls
        .resume(body.scope, &body.scope_id, Utc::now())
        .await
    {
        Ok(()) => {
            info!(scope = body.scope.as_str(), scope_id = %body.scope_id, "resumed");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(scope_id = %body.scope_id, error = %e, "resume failed");
            status_for(&e)
        }
    }
}

/// POST /heater/{instance_id}/tick - Run one warm-up tick.
#[instrument(skip(state), fields(instance_id = %instance_id))]
pub async fn post_heater_tick(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<HeaterReport>, StatusCode> {
    match state.heater.execute(&instance_id, Utc::now()).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            warn!(instance_id = %instance_id, error = %e, "heater tick failed");
            Err(status_for(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub lookback_minutes: Option<i64>,
}

/// GET /metrics/decisions - Decision counts over a lookback window.
///
/// # Query Parameters
///
/// - `lookback_minutes` (optional): window size (default: 60)
#[instrument(skip(state))]
pub async fn get_decision_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<DecisionSummary>, StatusCode> {
    let lookback = query.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);

    match metrics::summarize_decisions(&state.storage, lookback, Utc::now()).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            warn!(error = %e, "failed to summarize decisions");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Health check.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
