//! Shared vocabulary for the admission-control engine.
//!
//! # Decisions are values
//!
//! A refused send is **not an error**. Every refusal carries a
//! [`BlockReason`] and, where the refusal is time-bound, a `delayed_until`
//! boundary the caller can schedule against. Errors are reserved for
//! faults: unknown aggregates, tenant mismatches, and collaborator I/O
//! failures (see [`crate::ports::EngineError`]).
//!
//! The types here are plain data. They carry no behavior beyond small
//! pure helpers and are shared by the policy, both gates, storage, and
//! the HTTP surface.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of message a send would put on the wire.
///
/// This is the dispatch-side vocabulary: what the upstream network sees.
/// The intent payload union maps onto it at exactly one boundary
/// ([`crate::intent::IntentPayload::kind`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Plain text message.
    Text,
    /// Emoji reaction to an existing message.
    Reaction,
    /// Sticker.
    Sticker,
    /// Image with optional caption.
    Image,
    /// Voice note / audio clip.
    Audio,
}

impl MessageKind {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Reaction => "REACTION",
            MessageKind::Sticker => "STICKER",
            MessageKind::Image => "IMAGE",
            MessageKind::Audio => "AUDIO",
        }
    }
}

/// Why a send was requested.
///
/// The source changes what the policy will tolerate: warm-up traffic is
/// deliberately low-risk, and follow-ups are a privileged path that only
/// opens once an SLA breach authorizes outreach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentSource {
    /// Synthetic traffic produced by the warm-up scheduler.
    Warmup,
    /// A scheduled campaign or broadcast send.
    Schedule,
    /// Direct reply inside an active conversation.
    Reply,
    /// Outreach authorized by an SLA breach on a conversation.
    FollowUp,
    /// Operator-initiated one-off send.
    Manual,
}

impl IntentSource {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentSource::Warmup => "WARMUP",
            IntentSource::Schedule => "SCHEDULE",
            IntentSource::Reply => "REPLY",
            IntentSource::FollowUp => "FOLLOW_UP",
            IntentSource::Manual => "MANUAL",
        }
    }

    /// Parse a stored identifier back into a source.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "WARMUP" => IntentSource::Warmup,
            "SCHEDULE" => IntentSource::Schedule,
            "REPLY" => IntentSource::Reply,
            "FOLLOW_UP" => IntentSource::FollowUp,
            "MANUAL" => IntentSource::Manual,
            _ => return None,
        })
    }
}

/// Reason codes attached to every refused or delayed decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    /// Instance lifecycle is not ACTIVE (banned, disabled, unknown).
    InstanceNotActive,
    /// Instance is not currently connected to the upstream network.
    InstanceNotConnected,
    /// Reputation temperature is in a cooldown window.
    Cooldown,
    /// Reputation temperature is overheated.
    Overheated,
    /// The message kind is not allowed for the instance's warm-up phase.
    UnsupportedMessageType,
    /// An instance- or window-level rate boundary was hit.
    RateLimit,
    /// A non-rate policy rule refused the send (e.g. SLA not breached).
    PolicyBlocked,
    /// No instance of the tenant could serve the intent.
    NoEligibleInstance,
    /// The selected or evaluated instance failed a health check.
    InstanceUnhealthy,
    /// An operational pause switch is engaged.
    OpsPaused,
    /// A tenant plan limit was hit.
    PlanLimit,
    /// Intent-gate vocabulary for an instance inside an active cooldown
    /// window (maps COOLDOWN/OVERHEATED policy blocks).
    CooldownActive,
}

impl BlockReason {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::InstanceNotActive => "INSTANCE_NOT_ACTIVE",
            BlockReason::InstanceNotConnected => "INSTANCE_NOT_CONNECTED",
            BlockReason::Cooldown => "COOLDOWN",
            BlockReason::Overheated => "OVERHEATED",
            BlockReason::UnsupportedMessageType => "UNSUPPORTED_MESSAGE_TYPE",
            BlockReason::RateLimit => "RATE_LIMIT",
            BlockReason::PolicyBlocked => "POLICY_BLOCKED",
            BlockReason::NoEligibleInstance => "NO_ELIGIBLE_INSTANCE",
            BlockReason::InstanceUnhealthy => "INSTANCE_UNHEALTHY",
            BlockReason::OpsPaused => "OPS_PAUSED",
            BlockReason::PlanLimit => "PLAN_LIMIT",
            BlockReason::CooldownActive => "COOLDOWN_ACTIVE",
        }
    }

    /// Parse a stored identifier back into a reason.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "INSTANCE_NOT_ACTIVE" => BlockReason::InstanceNotActive,
            "INSTANCE_NOT_CONNECTED" => BlockReason::InstanceNotConnected,
            "COOLDOWN" => BlockReason::Cooldown,
            "OVERHEATED" => BlockReason::Overheated,
            "UNSUPPORTED_MESSAGE_TYPE" => BlockReason::UnsupportedMessageType,
            "RATE_LIMIT" => BlockReason::RateLimit,
            "POLICY_BLOCKED" => BlockReason::PolicyBlocked,
            "NO_ELIGIBLE_INSTANCE" => BlockReason::NoEligibleInstance,
            "INSTANCE_UNHEALTHY" => BlockReason::InstanceUnhealthy,
            "OPS_PAUSED" => BlockReason::OpsPaused,
            "PLAN_LIMIT" => BlockReason::PlanLimit,
            "COOLDOWN_ACTIVE" => BlockReason::CooldownActive,
            _ => return None,
        })
    }
}

/// The rate envelope the policy grants an instance for the current send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEnvelope {
    /// Maximum messages the instance may send per rolling hour.
    pub max_messages: i64,

    /// Minimum seconds between consecutive sends.
    pub min_interval_seconds: i64,

    /// Message kinds the instance may send right now.
    pub allowed_kinds: Vec<MessageKind>,
}

/// Output of the pure dispatch policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DispatchDecision {
    /// The send fits policy; the envelope bounds the caller's behavior.
    Allow(RateEnvelope),
    /// The send is refused outright.
    Block {
        /// Why the policy refused.
        reason: BlockReason,
    },
}

impl DispatchDecision {
    /// Whether the policy allowed the send.
    pub fn is_allowed(&self) -> bool {
        matches!(self, DispatchDecision::Allow(_))
    }
}

/// Output of the single-intent gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateDecision {
    /// The send may proceed now.
    Allowed,
    /// The send is refused, possibly until a known boundary.
    Blocked {
        /// Why the gate refused.
        reason: BlockReason,
        /// For rate-type blocks, when the refusal expires.
        delayed_until: Option<DateTime<Utc>>,
    },
}

impl GateDecision {
    /// Whether the send may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }

    /// A block with no known boundary.
    pub fn blocked(reason: BlockReason) -> Self {
        GateDecision::Blocked {
            reason,
            delayed_until: None,
        }
    }

    /// A block that expires at a known time.
    pub fn delayed(reason: BlockReason, until: DateTime<Utc>) -> Self {
        GateDecision::Blocked {
            reason,
            delayed_until: Some(until),
        }
    }
}

/// Output of the multi-instance intent gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntentDecision {
    /// The intent was admitted and assigned to an instance.
    Approved {
        /// The instance that will serve the intent.
        instance_id: String,
    },
    /// The intent should be retried at or after `queued_until`.
    Queued {
        /// Earliest time a retry can succeed, when known.
        queued_until: Option<DateTime<Utc>>,
        /// Why the intent was deferred.
        reason: BlockReason,
    },
    /// The intent was terminally refused.
    Blocked {
        /// Why the intent was refused.
        reason: BlockReason,
    },
}

/// Per-instance send counters as of "now".
///
/// Supplied by a [`crate::ports::RateSnapshotProvider`]; in production the
/// SQLite outbound log derives it with window queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateSnapshot {
    /// Messages sent in the last rolling minute.
    pub sent_last_minute: i64,

    /// Messages sent in the last rolling hour.
    pub sent_last_hour: i64,

    /// Timestamp of the most recent sent message, if any.
    pub last_message_at: Option<DateTime<Utc>>,

    /// Timestamp of the oldest message inside the last-hour window.
    ///
    /// Used to compute when the hourly window frees a slot.
    pub oldest_in_hour_at: Option<DateTime<Utc>>,

    /// Signatures of recent outbound texts, for duplicate suppression.
    pub recent_text_signatures: HashSet<String>,
}

impl RateSnapshot {
    /// Signature under which an outbound text is remembered.
    ///
    /// Recipient and body together: the same text to two recipients is
    /// not a duplicate, and neither are two different texts to one
    /// recipient.
    pub fn text_signature(to: &str, text: &str) -> String {
        format!("{to}:{text}")
    }

    /// Whether this exact recipient+text pair was sent recently.
    pub fn has_recent_text(&self, to: &str, text: &str) -> bool {
        self.recent_text_signatures
            .contains(&Self::text_signature(to, text))
    }
}
