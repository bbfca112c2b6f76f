//! The sending instance aggregate and its embedded reputation.
//!
//! An instance is one sending identity owned by one tenant. Its
//! [`Reputation`] accumulates risk signals and derives two things the
//! policy cares about:
//!
//! - a **temperature** gating whether the instance may dispatch at all,
//! - a **warm-up phase** controlling which message kinds and volumes a
//!   still-maturing instance is allowed.
//!
//! Reputation is mutated only through instance lifecycle transitions
//! (`record_connected`, `record_disconnected`, `ingest_risk_signal`).
//! Each transition returns the domain events to publish; the caller
//! persists the new state and dispatches the events. The gates read the
//! aggregate but never write it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Risk flags at or above this count push the instance to OVERHEATED.
const OVERHEAT_FLAG_THRESHOLD: u32 = 6;

/// Lifecycle of a sending instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    /// Usable for traffic, subject to the rest of the policy.
    Active,
    /// Banned by the upstream network; permanently out of rotation.
    Banned,
    /// Administratively disabled by the tenant or an operator.
    Disabled,
}

impl LifecycleStatus {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Active => "ACTIVE",
            LifecycleStatus::Banned => "BANNED",
            LifecycleStatus::Disabled => "DISABLED",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "ACTIVE" => LifecycleStatus::Active,
            "BANNED" => LifecycleStatus::Banned,
            "DISABLED" => LifecycleStatus::Disabled,
            _ => return None,
        })
    }
}

/// Connection state against the upstream network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Session established; sends can physically go out.
    Connected,
    /// No session.
    Disconnected,
    /// Session handshake in progress.
    Connecting,
}

impl ConnectionStatus {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "CONNECTED" => ConnectionStatus::Connected,
            "DISCONNECTED" => ConnectionStatus::Disconnected,
            "CONNECTING" => ConnectionStatus::Connecting,
            _ => return None,
        })
    }
}

/// What the instance exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstancePurpose {
    /// Dedicated to warm-up traffic only.
    Warmup,
    /// Dedicated to real outbound traffic only.
    Dispatch,
    /// Serves both.
    Mixed,
}

impl InstancePurpose {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstancePurpose::Warmup => "WARMUP",
            InstancePurpose::Dispatch => "DISPATCH",
            InstancePurpose::Mixed => "MIXED",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "WARMUP" => InstancePurpose::Warmup,
            "DISPATCH" => InstancePurpose::Dispatch,
            "MIXED" => InstancePurpose::Mixed,
            _ => return None,
        })
    }
}

/// Coarse reputation temperature.
///
/// COOLDOWN and OVERHEATED veto dispatch entirely; the others are
/// informational grades of accumulated trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Temperature {
    /// Fresh identity with no sending history.
    Cold,
    /// Some healthy history.
    Warm,
    /// Established, trusted sender.
    Hot,
    /// Deliberately resting after a risk signal.
    Cooldown,
    /// Too many risk signals; dispatch vetoed until explicitly cleared.
    Overheated,
}

impl Temperature {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Temperature::Cold => "COLD",
            Temperature::Warm => "WARM",
            Temperature::Hot => "HOT",
            Temperature::Cooldown => "COOLDOWN",
            Temperature::Overheated => "OVERHEATED",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "COLD" => Temperature::Cold,
            "WARM" => Temperature::Warm,
            "HOT" => Temperature::Hot,
            "COOLDOWN" => Temperature::Cooldown,
            "OVERHEATED" => Temperature::Overheated,
            _ => return None,
        })
    }
}

/// Warm-up maturity stage, derived from elapsed time since creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarmUpPhase {
    /// Just created; presence only, minimal text.
    Newborn,
    /// Watching traffic, still very limited.
    Observer,
    /// Light two-way texting allowed.
    Interacting,
    /// Media unlocked, near-normal volumes.
    Social,
    /// Fully matured.
    Ready,
}

impl WarmUpPhase {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmUpPhase::Newborn => "NEWBORN",
            WarmUpPhase::Observer => "OBSERVER",
            WarmUpPhase::Interacting => "INTERACTING",
            WarmUpPhase::Social => "SOCIAL",
            WarmUpPhase::Ready => "READY",
        }
    }
}

/// Derived risk grade from accumulated flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Fewer than 3 flags.
    Low,
    /// 3 to 5 flags.
    Medium,
    /// 6 or more flags.
    High,
}

/// Days after creation at which each warm-up phase begins.
///
/// The exact durations were never documented upstream, so they are
/// configuration rather than constants; `main.rs` reads overrides from
/// the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmUpTimeline {
    /// Days until NEWBORN becomes OBSERVER.
    pub observer_after_days: i64,
    /// Days until OBSERVER becomes INTERACTING.
    pub interacting_after_days: i64,
    /// Days until INTERACTING becomes SOCIAL.
    pub social_after_days: i64,
    /// Days until SOCIAL becomes READY.
    pub ready_after_days: i64,
}

impl Default for WarmUpTimeline {
    fn default() -> Self {
        Self {
            observer_after_days: 3,
            interacting_after_days: 7,
            social_after_days: 14,
            ready_after_days: 30,
        }
    }
}

impl WarmUpTimeline {
    /// Phase implied by elapsed time alone (no temperature override).
    pub fn phase_at(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> WarmUpPhase {
        let elapsed_days = (now - created_at).num_days();

        if elapsed_days >= self.ready_after_days {
            WarmUpPhase::Ready
        } else if elapsed_days >= self.social_after_days {
            WarmUpPhase::Social
        } else if elapsed_days >= self.interacting_after_days {
            WarmUpPhase::Interacting
        } else if elapsed_days >= self.observer_after_days {
            WarmUpPhase::Observer
        } else {
            WarmUpPhase::Newborn
        }
    }
}

/// A normalized risk signal ingested from upstream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskSignal {
    /// A recipient reported the sender as spam. Triggers a cooldown.
    SpamReport,
    /// The upstream network rejected or failed a delivery.
    DeliveryFailure,
    /// A soft warning from the upstream network.
    UpstreamWarning,
    /// An operator or the health evaluator cleared the accumulated risk.
    Cleared,
}

/// Domain events emitted by instance lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// The instance established a session.
    Connected { instance_id: String },
    /// The instance lost its session.
    Disconnected { instance_id: String },
    /// Risk flags changed.
    RiskFlagged { instance_id: String, flags: u32 },
    /// The instance entered a cooldown window.
    CooldownEntered {
        instance_id: String,
        at: DateTime<Utc>,
    },
    /// The instance crossed the overheat threshold.
    Overheated { instance_id: String },
    /// Accumulated risk was cleared.
    RiskCleared { instance_id: String },
}

/// Mutable reputation state, owned exclusively by its instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reputation {
    /// Coarse temperature grade.
    pub temperature: Temperature,

    /// When the current cooldown window started, if one is active.
    pub cooldown_started_at: Option<DateTime<Utc>>,

    /// Accumulated risk flags; drives [`Reputation::risk_level`].
    pub risk_flags: u32,

    /// When the identity was created; drives the warm-up phase.
    pub created_at: DateTime<Utc>,
}

impl Reputation {
    /// A fresh, cold reputation created at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            temperature: Temperature::Cold,
            cooldown_started_at: None,
            risk_flags: 0,
            created_at: now,
        }
    }

    /// Whether the temperature permits dispatch at all.
    ///
    /// COOLDOWN and OVERHEATED are hard vetoes. Exit happens through an
    /// explicit signal (health evaluator or operator), never by the mere
    /// passage of time.
    pub fn can_dispatch(&self) -> bool {
        !matches!(
            self.temperature,
            Temperature::Cooldown | Temperature::Overheated
        )
    }

    /// Risk grade derived from accumulated flags.
    pub fn risk_level(&self) -> RiskLevel {
        match self.risk_flags {
            0..=2 => RiskLevel::Low,
            3..=5 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }

    /// Current warm-up phase.
    ///
    /// Derived from elapsed time since creation, except that an active
    /// cooldown caps the phase at INTERACTING: a resting instance never
    /// regains media privileges just because the calendar advanced.
    pub fn warm_up_phase(&self, now: DateTime<Utc>, timeline: &WarmUpTimeline) -> WarmUpPhase {
        let phase = timeline.phase_at(self.created_at, now);

        if !self.can_dispatch() && phase > WarmUpPhase::Interacting {
            WarmUpPhase::Interacting
        } else {
            phase
        }
    }
}

/// A sending identity owned by one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance id.
    pub id: String,

    /// Owning tenant.
    pub organization_id: String,

    /// Lifecycle status.
    pub lifecycle: LifecycleStatus,

    /// Connection status.
    pub connection: ConnectionStatus,

    /// What this instance exists for.
    pub purpose: InstancePurpose,

    /// Embedded reputation; mutated only through methods on `self`.
    pub reputation: Reputation,

    /// When the instance record was created.
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// A new, active, disconnected instance with a fresh reputation.
    pub fn new(id: &str, organization_id: &str, purpose: InstancePurpose, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            organization_id: organization_id.to_string(),
            lifecycle: LifecycleStatus::Active,
            connection: ConnectionStatus::Disconnected,
            purpose,
            reputation: Reputation::new(now),
            created_at: now,
        }
    }

    /// Whether non-warm-up traffic may ever be dispatched from here.
    ///
    /// Invariant: requires ACTIVE lifecycle and a CONNECTED session.
    /// Reputation and rate state are layered on top by the policy.
    pub fn can_dispatch_traffic(&self) -> bool {
        self.lifecycle == LifecycleStatus::Active && self.connection == ConnectionStatus::Connected
    }

    /// Whether the instance may carry warm-up traffic.
    ///
    /// Only the lifecycle matters here; a disconnected instance still
    /// fails the policy's connection check before anything is sent.
    pub fn can_warm_up(&self) -> bool {
        self.lifecycle == LifecycleStatus::Active
    }

    /// Record an established session.
    ///
    /// A cold instance that manages to connect is considered warm: it
    /// has a live session history from this point on.
    pub fn record_connected(&mut self) -> Vec<InstanceEvent> {
        self.connection = ConnectionStatus::Connected;
        if self.reputation.temperature == Temperature::Cold {
            self.reputation.temperature = Temperature::Warm;
        }

        vec![InstanceEvent::Connected {
            instance_id: self.id.clone(),
        }]
    }

    /// Record a lost session.
    pub fn record_disconnected(&mut self) -> Vec<InstanceEvent> {
        self.connection = ConnectionStatus::Disconnected;

        vec![InstanceEvent::Disconnected {
            instance_id: self.id.clone(),
        }]
    }

    /// Fold a normalized risk signal into the reputation.
    ///
    /// Spam reports start a cooldown immediately. Accumulating flags
    /// past the overheat threshold marks the instance OVERHEATED.
    /// `Cleared` resets flags and restores a dispatchable temperature.
    pub fn ingest_risk_signal(
        &mut self,
        signal: RiskSignal,
        now: DateTime<Utc>,
    ) -> Vec<InstanceEvent> {
        let mut events = Vec::new();

        match signal {
            RiskSignal::Cleared => {
                self.reputation.risk_flags = 0;
                self.reputation.cooldown_started_at = None;
                self.reputation.temperature = Temperature::Warm;
                events.push(InstanceEvent::RiskCleared {
                    instance_id: self.id.clone(),
                });
                return events;
            }
            RiskSignal::SpamReport => {
                self.reputation.risk_flags += 2;
            }
            RiskSignal::DeliveryFailure | RiskSignal::UpstreamWarning => {
                self.reputation.risk_flags += 1;
            }
        }

        events.push(InstanceEvent::RiskFlagged {
            instance_id: self.id.clone(),
            flags: self.reputation.risk_flags,
        });

        if self.reputation.risk_flags >= OVERHEAT_FLAG_THRESHOLD {
            self.reputation.temperature = Temperature::Overheated;
            events.push(InstanceEvent::Overheated {
                instance_id: self.id.clone(),
            });
        } else if signal == RiskSignal::SpamReport
            && self.reputation.temperature != Temperature::Cooldown
        {
            self.reputation.temperature = Temperature::Cooldown;
            self.reputation.cooldown_started_at = Some(now);
            events.push(InstanceEvent::CooldownEntered {
                instance_id: self.id.clone(),
                at: now,
            });
        }

        events
    }

    /// Elapsed age of the instance at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(now: DateTime<Utc>) -> Instance {
        Instance::new("inst-1", "org-1", InstancePurpose::Mixed, now)
    }

    #[test]
    fn test_phase_progression() {
        let timeline = WarmUpTimeline::default();
        let created = Utc::now();
        let rep = Reputation::new(created);

        let cases = [
            (0, WarmUpPhase::Newborn),
            (2, WarmUpPhase::Newborn),
            (3, WarmUpPhase::Observer),
            (6, WarmUpPhase::Observer),
            (7, WarmUpPhase::Interacting),
            (13, WarmUpPhase::Interacting),
            (14, WarmUpPhase::Social),
            (29, WarmUpPhase::Social),
            (30, WarmUpPhase::Ready),
            (365, WarmUpPhase::Ready),
        ];

        for (days, expected) in cases {
            let now = created + Duration::days(days);
            assert_eq!(rep.warm_up_phase(now, &timeline), expected, "day {days}");
        }
    }

    #[test]
    fn test_cooldown_caps_phase_at_interacting() {
        let timeline = WarmUpTimeline::default();
        let created = Utc::now();
        let now = created + Duration::days(60);

        let mut rep = Reputation::new(created);
        assert_eq!(rep.warm_up_phase(now, &timeline), WarmUpPhase::Ready);

        rep.temperature = Temperature::Cooldown;
        rep.cooldown_started_at = Some(now);
        assert_eq!(rep.warm_up_phase(now, &timeline), WarmUpPhase::Interacting);
    }

    #[test]
    fn test_can_dispatch_vetoed_by_temperature() {
        let mut rep = Reputation::new(Utc::now());
        assert!(rep.can_dispatch());

        rep.temperature = Temperature::Cooldown;
        assert!(!rep.can_dispatch());

        rep.temperature = Temperature::Overheated;
        assert!(!rep.can_dispatch());

        rep.temperature = Temperature::Hot;
        assert!(rep.can_dispatch());
    }

    #[test]
    fn test_risk_level_thresholds() {
        let mut rep = Reputation::new(Utc::now());
        assert_eq!(rep.risk_level(), RiskLevel::Low);

        rep.risk_flags = 2;
        assert_eq!(rep.risk_level(), RiskLevel::Low);

        rep.risk_flags = 3;
        assert_eq!(rep.risk_level(), RiskLevel::Medium);

        rep.risk_flags = 5;
        assert_eq!(rep.risk_level(), RiskLevel::Medium);

        rep.risk_flags = 6;
        assert_eq!(rep.risk_level(), RiskLevel::High);
    }

    #[test]
    fn test_spam_report_enters_cooldown() {
        let now = Utc::now();
        let mut inst = instance(now);

        let events = inst.ingest_risk_signal(RiskSignal::SpamReport, now);

        assert_eq!(inst.reputation.temperature, Temperature::Cooldown);
        assert_eq!(inst.reputation.cooldown_started_at, Some(now));
        assert!(events.iter().any(|e| matches!(
            e,
            InstanceEvent::CooldownEntered { .. }
        )));
    }

    #[test]
    fn test_flag_accumulation_overheats() {
        let now = Utc::now();
        let mut inst = instance(now);

        for _ in 0..5 {
            inst.ingest_risk_signal(RiskSignal::DeliveryFailure, now);
        }
        assert_ne!(inst.reputation.temperature, Temperature::Overheated);

        let events = inst.ingest_risk_signal(RiskSignal::DeliveryFailure, now);

        assert_eq!(inst.reputation.temperature, Temperature::Overheated);
        assert!(events
            .iter()
            .any(|e| matches!(e, InstanceEvent::Overheated { .. })));
    }

    #[test]
    fn test_cleared_resets_risk() {
        let now = Utc::now();
        let mut inst = instance(now);

        inst.ingest_risk_signal(RiskSignal::SpamReport, now);
        let events = inst.ingest_risk_signal(RiskSignal::Cleared, now);

        assert_eq!(inst.reputation.risk_flags, 0);
        assert_eq!(inst.reputation.temperature, Temperature::Warm);
        assert!(inst.reputation.cooldown_started_at.is_none());
        assert!(events
            .iter()
            .any(|e| matches!(e, InstanceEvent::RiskCleared { .. })));
    }

    #[test]
    fn test_dispatch_invariant_needs_active_and_connected() {
        let now = Utc::now();
        let mut inst = instance(now);

        assert!(!inst.can_dispatch_traffic());

        inst.record_connected();
        assert!(inst.can_dispatch_traffic());

        inst.lifecycle = LifecycleStatus::Banned;
        assert!(!inst.can_dispatch_traffic());
        assert!(!inst.can_warm_up());
    }

    #[test]
    fn test_connect_warms_a_cold_instance() {
        let now = Utc::now();
        let mut inst = instance(now);
        assert_eq!(inst.reputation.temperature, Temperature::Cold);

        inst.record_connected();
        assert_eq!(inst.reputation.temperature, Temperature::Warm);
    }
}
