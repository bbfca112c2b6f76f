//! Embergate - admission control for multi-tenant messaging fleets.
//!
//! Wires the engine from environment variables and serves the HTTP
//! surface.
//!
//! # Configuration
//!
//! - `EMBERGATE_PORT` - listen port (default: 3000)
//! - `EMBERGATE_DATABASE_URL` - SQLite URL (default: sqlite:embergate.db?mode=rwc)
//! - `EMBERGATE_HEALTH_URL` - instance-health service base URL
//!   (unset: permissive static evaluator)
//! - `EMBERGATE_DISPATCH_URL` - message gateway base URL
//!   (unset: dry-run dispatcher that only logs)
//! - `EMBERGATE_WARMUP_TARGETS` - comma-separated warm-up recipients
//! - `EMBERGATE_WARMUP_OBSERVER_DAYS` / `_INTERACTING_DAYS` /
//!   `_SOCIAL_DAYS` / `_READY_DAYS` - warm-up phase thresholds
//!   (defaults: 3 / 7 / 14 / 30)
//! - `EMBERGATE_SLA_HOURS` - follow-up SLA threshold (default: 24)

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use chrono::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use embergate::api::{
    AppState, get_decision_metrics, health_check, post_dispatch, post_heater_tick, post_intent,
    post_pause, post_resolve_intent, post_resume,
};
use embergate::collaborators::{
    HttpHealthEvaluator, HttpPresenceDispatcher, ResponseTimeSla, RotatingWarmUpContent,
    StaticHealthEvaluator, StaticWarmUpTargets, TracingDispatcher,
};
use embergate::control::ExecutionControlPolicy;
use embergate::gate::{DispatchGate, DispatchGateDeps};
use embergate::heater::{HeaterDeps, HeaterUseCase, PhasedWarmUpStrategy};
use embergate::instance::WarmUpTimeline;
use embergate::intent_gate::{IntentGate, IntentGateDeps};
use embergate::policy::DispatchPolicy;
use embergate::ports::{InstanceHealthEvaluator, PresenceDispatcher};
use embergate::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:embergate.db?mode=rwc";

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn timeline_from_env() -> WarmUpTimeline {
    let defaults = WarmUpTimeline::default();
    WarmUpTimeline {
        observer_after_days: env_i64("EMBERGATE_WARMUP_OBSERVER_DAYS", defaults.observer_after_days),
        interacting_after_days: env_i64(
            "EMBERGATE_WARMUP_INTERACTING_DAYS",
            defaults.interacting_after_days,
        ),
        social_after_days: env_i64("EMBERGATE_WARMUP_SOCIAL_DAYS", defaults.social_after_days),
        ready_after_days: env_i64("EMBERGATE_WARMUP_READY_DAYS", defaults.ready_after_days),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("embergate=info".parse()?))
        .init();

    let port: u16 = env::var("EMBERGATE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url =
        env::var("EMBERGATE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    info!(port, db_url = %db_url, "Starting embergate");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let health: Arc<dyn InstanceHealthEvaluator> = match env::var("EMBERGATE_HEALTH_URL") {
        Ok(url) => {
            info!(url = %url, "Using HTTP health evaluator");
            Arc::new(HttpHealthEvaluator::new(&url))
        }
        Err(_) => {
            info!("No health service configured; using permissive evaluator");
            Arc::new(StaticHealthEvaluator)
        }
    };

    let dispatcher: Arc<dyn PresenceDispatcher> = match env::var("EMBERGATE_DISPATCH_URL") {
        Ok(url) => {
            info!(url = %url, "Using HTTP presence dispatcher");
            Arc::new(HttpPresenceDispatcher::new(&url))
        }
        Err(_) => {
            info!("No message gateway configured; presence is a dry run");
            Arc::new(TracingDispatcher)
        }
    };

    let timeline = timeline_from_env();
    let policy = DispatchPolicy::new(timeline);
    let sla = ResponseTimeSla::new(Duration::hours(env_i64("EMBERGATE_SLA_HOURS", 24)));

    let controls = ExecutionControlPolicy::new(Arc::new(storage.clone()));

    let dispatch_gate = DispatchGate::new(
        DispatchGateDeps {
            instances: Arc::new(storage.clone()),
            health: health.clone(),
            conversations: Arc::new(storage.clone()),
            sla: Arc::new(sla),
            rates: Arc::new(storage.clone()),
            controls: controls.clone(),
        },
        policy.clone(),
    );

    let intent_gate = IntentGate::new(
        IntentGateDeps {
            intents: Arc::new(storage.clone()),
            instances: Arc::new(storage.clone()),
            rates: Arc::new(storage.clone()),
            health: health.clone(),
            controls: controls.clone(),
            events: Arc::new(storage.clone()),
            plan_policy: None,
        },
        policy,
    );

    let warmup_targets: Vec<String> = env::var("EMBERGATE_WARMUP_TARGETS")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let heater = Arc::new(HeaterUseCase::new(
        HeaterDeps {
            instances: Arc::new(storage.clone()),
            health,
            intents: Arc::new(storage.clone()),
            gate: intent_gate.clone(),
            dispatcher,
            strategy: Arc::new(PhasedWarmUpStrategy::new(
                Arc::new(StaticWarmUpTargets::new(warmup_targets)),
                Arc::new(RotatingWarmUpContent::default()),
            )),
        },
        timeline,
    ));

    let state = AppState {
        storage,
        dispatch_gate,
        intent_gate,
        controls,
        heater,
    };

    let app = Router::new()
        .route("/dispatch", post(post_dispatch))
        .route("/intents", post(post_intent))
        .route("/intents/:id/resolve", post(post_resolve_intent))
        .route("/controls/pause", post(post_pause))
        .route("/controls/resume", post(post_resume))
        .route("/heater/:instance_id/tick", post(post_heater_tick))
        .route("/metrics/decisions", get(get_decision_metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "embergate is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
