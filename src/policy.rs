//! The dispatch policy: instance state in, rate envelope or block out.
//!
//! This is a pure function over the instance aggregate, the intent's
//! source, the message kind, and "now". No I/O, no clocks of its own.
//! Check order is fixed and the first failing check wins:
//!
//! 1. lifecycle, 2. connection, 3. temperature veto, then the warm-up
//! phase decides which message kinds are allowed, and finally the risk
//! level (or, at low risk, the phase) decides the rate envelope.
//!
//! The gates layer live counters and health on top; the policy itself
//! never looks at a rate snapshot.

use chrono::{DateTime, Utc};

use crate::instance::{
    Instance, InstancePurpose, RiskLevel, Temperature, WarmUpPhase, WarmUpTimeline,
};
use crate::model::{BlockReason, DispatchDecision, IntentSource, MessageKind, RateEnvelope};

/// Hourly cap / minimum interval at HIGH risk: 1 message per 10 minutes.
const HIGH_RISK_LIMITS: (i64, i64) = (1, 600);

/// Hourly cap / minimum interval at MEDIUM risk: 3 messages, 3 minutes apart.
const MEDIUM_RISK_LIMITS: (i64, i64) = (3, 180);

/// Low-risk limits for NEWBORN and OBSERVER phases.
const EARLY_PHASE_LIMITS: (i64, i64) = (2, 300);

/// Low-risk limits for the INTERACTING phase.
const INTERACTING_LIMITS: (i64, i64) = (6, 120);

/// Low-risk limits once the instance is SOCIAL or READY.
const MATURE_LIMITS: (i64, i64) = (12, 60);

/// The stateless dispatch policy, parameterized by the warm-up timeline.
#[derive(Debug, Clone, Default)]
pub struct DispatchPolicy {
    timeline: WarmUpTimeline,
}

impl DispatchPolicy {
    /// Build a policy over a warm-up timeline.
    pub fn new(timeline: WarmUpTimeline) -> Self {
        Self { timeline }
    }

    /// The timeline this policy derives phases from.
    pub fn timeline(&self) -> &WarmUpTimeline {
        &self.timeline
    }

    /// Message kinds the phase permits.
    ///
    /// Pre-SOCIAL phases are limited to text and reactions; SOCIAL
    /// unlocks media.
    pub fn allowed_kinds(phase: WarmUpPhase) -> Vec<MessageKind> {
        match phase {
            WarmUpPhase::Newborn | WarmUpPhase::Observer | WarmUpPhase::Interacting => {
                vec![MessageKind::Text, MessageKind::Reaction]
            }
            WarmUpPhase::Social | WarmUpPhase::Ready => vec![
                MessageKind::Text,
                MessageKind::Reaction,
                MessageKind::Sticker,
                MessageKind::Image,
                MessageKind::Audio,
            ],
        }
    }

    /// Evaluate one prospective send.
    pub fn evaluate(
        &self,
        instance: &Instance,
        source: IntentSource,
        kind: MessageKind,
        now: DateTime<Utc>,
    ) -> DispatchDecision {
        if instance.lifecycle != crate::instance::LifecycleStatus::Active {
            return DispatchDecision::Block {
                reason: BlockReason::InstanceNotActive,
            };
        }

        if instance.connection != crate::instance::ConnectionStatus::Connected {
            return DispatchDecision::Block {
                reason: BlockReason::InstanceNotConnected,
            };
        }

        if !instance.reputation.can_dispatch() {
            let reason = match instance.reputation.temperature {
                Temperature::Cooldown => BlockReason::Cooldown,
                Temperature::Overheated => BlockReason::Overheated,
                _ => BlockReason::PolicyBlocked,
            };
            return DispatchDecision::Block { reason };
        }

        let phase = instance.reputation.warm_up_phase(now, &self.timeline);
        let risk = instance.reputation.risk_level();
        let allowed = Self::allowed_kinds(phase);

        // Media is categorically forbidden for warm-up-like traffic
        // before SOCIAL, independent of the generic allow-set.
        let warm_up_like =
            source == IntentSource::Warmup || instance.purpose == InstancePurpose::Warmup;
        if warm_up_like
            && matches!(kind, MessageKind::Image | MessageKind::Audio)
            && phase < WarmUpPhase::Social
        {
            return DispatchDecision::Block {
                reason: BlockReason::UnsupportedMessageType,
            };
        }

        if !allowed.contains(&kind) {
            return DispatchDecision::Block {
                reason: BlockReason::UnsupportedMessageType,
            };
        }

        // Risk level wins over phase when deriving volumes.
        let (max_messages, min_interval_seconds) = match risk {
            RiskLevel::High => HIGH_RISK_LIMITS,
            RiskLevel::Medium => MEDIUM_RISK_LIMITS,
            RiskLevel::Low => match phase {
                WarmUpPhase::Newborn | WarmUpPhase::Observer => EARLY_PHASE_LIMITS,
                WarmUpPhase::Interacting => INTERACTING_LIMITS,
                WarmUpPhase::Social | WarmUpPhase::Ready => MATURE_LIMITS,
            },
        };

        DispatchDecision::Allow(RateEnvelope {
            max_messages,
            min_interval_seconds,
            allowed_kinds: allowed,
        })
    }
}
