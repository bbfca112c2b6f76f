//! The message intent aggregate.
//!
//! A `MessageIntent` is a requested send that has not yet been admitted.
//! The multi-instance gate resolves it into exactly one of three
//! recorded decisions: APPROVED (assigned to an instance), QUEUED (retry
//! later), or BLOCKED (terminal refusal).
//!
//! # Transition discipline
//!
//! [`MessageIntent::approve`], [`MessageIntent::queue`], and
//! [`MessageIntent::block`] are the **only** legal mutators. Each checks
//! the current status, applies the transition, and returns the domain
//! events to publish; the caller persists the new state and dispatches
//! the events. APPROVED and BLOCKED are terminal. QUEUED intents may be
//! re-decided on a later gate call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BlockReason, IntentDecision, IntentSource, MessageKind};

/// What kind of address the intent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    /// A phone number in E.164 form.
    Phone,
    /// A group chat id.
    Group,
}

impl TargetKind {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Phone => "PHONE",
            TargetKind::Group => "GROUP",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PHONE" => TargetKind::Phone,
            "GROUP" => TargetKind::Group,
            _ => return None,
        })
    }
}

/// Where the message should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Address kind.
    pub kind: TargetKind,
    /// Address value (phone number or group id).
    pub value: String,
}

impl Target {
    /// A phone-number target.
    pub fn phone(value: &str) -> Self {
        Self {
            kind: TargetKind::Phone,
            value: value.to_string(),
        }
    }
}

/// The payload union carried by an intent.
///
/// Exhaustively matched at the one boundary where intents become wire
/// messages: [`IntentPayload::kind`] (policy vocabulary) and the
/// dispatcher adapter (wire shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentPayload {
    /// Plain text.
    Text {
        /// Message body.
        text: String,
    },
    /// Emoji reaction to an existing message.
    Reaction {
        /// The emoji to react with.
        emoji: String,
        /// The message being reacted to.
        message_id: String,
    },
    /// Voice note.
    Audio {
        /// Where the audio asset lives.
        url: String,
    },
    /// Image or other visual media.
    Media {
        /// Where the media asset lives.
        url: String,
        /// Optional caption.
        caption: Option<String>,
    },
}

impl IntentPayload {
    /// The dispatch-side message kind this payload produces.
    pub fn kind(&self) -> MessageKind {
        match self {
            IntentPayload::Text { .. } => MessageKind::Text,
            IntentPayload::Reaction { .. } => MessageKind::Reaction,
            IntentPayload::Audio { .. } => MessageKind::Audio,
            IntentPayload::Media { .. } => MessageKind::Image,
        }
    }

    /// The text body, when the payload is a text message.
    pub fn text(&self) -> Option<&str> {
        match self {
            IntentPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Lifecycle of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    /// Awaiting a first decision.
    Pending,
    /// Admitted and assigned to an instance. Terminal.
    Approved,
    /// Deferred; the gate will genuinely re-evaluate on the next call.
    Queued,
    /// Terminally refused.
    Blocked,
}

impl IntentStatus {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "PENDING",
            IntentStatus::Approved => "APPROVED",
            IntentStatus::Queued => "QUEUED",
            IntentStatus::Blocked => "BLOCKED",
        }
    }

    /// Parse a stored identifier.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PENDING" => IntentStatus::Pending,
            "APPROVED" => IntentStatus::Approved,
            "QUEUED" => IntentStatus::Queued,
            "BLOCKED" => IntentStatus::Blocked,
            _ => return None,
        })
    }
}

/// Attempted transition out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal intent transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    /// Status the intent was in.
    pub from: IntentStatus,
    /// Status the transition would have produced.
    pub to: IntentStatus,
}

/// Domain events published when an intent changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IntentEvent {
    /// The intent was admitted.
    Approved {
        intent_id: String,
        organization_id: String,
        instance_id: String,
        at: DateTime<Utc>,
    },
    /// The intent was deferred.
    Queued {
        intent_id: String,
        organization_id: String,
        queued_until: Option<DateTime<Utc>>,
        reason: BlockReason,
        at: DateTime<Utc>,
    },
    /// The intent was terminally refused.
    Blocked {
        intent_id: String,
        organization_id: String,
        reason: BlockReason,
        at: DateTime<Utc>,
    },
}

impl IntentEvent {
    /// The intent this event belongs to.
    pub fn intent_id(&self) -> &str {
        match self {
            IntentEvent::Approved { intent_id, .. }
            | IntentEvent::Queued { intent_id, .. }
            | IntentEvent::Blocked { intent_id, .. } => intent_id,
        }
    }

    /// When the transition happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            IntentEvent::Approved { at, .. }
            | IntentEvent::Queued { at, .. }
            | IntentEvent::Blocked { at, .. } => *at,
        }
    }

    /// Stable event name used in the audit log.
    pub fn name(&self) -> &'static str {
        match self {
            IntentEvent::Approved { .. } => "intent_approved",
            IntentEvent::Queued { .. } => "intent_queued",
            IntentEvent::Blocked { .. } => "intent_blocked",
        }
    }
}

/// The unit of work the multi-instance gate resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIntent {
    /// Unique intent id.
    pub id: String,

    /// Owning tenant.
    pub organization_id: String,

    /// Where the message should go.
    pub target: Target,

    /// Why the send was requested.
    pub purpose: IntentSource,

    /// What would be sent.
    pub payload: IntentPayload,

    /// Current status.
    pub status: IntentStatus,

    /// Set only when APPROVED: the instance that will serve the intent.
    pub decided_by_instance_id: Option<String>,

    /// Set when QUEUED: earliest time a retry can succeed, if known.
    pub queued_until: Option<DateTime<Utc>>,

    /// Set when QUEUED or BLOCKED: why.
    pub blocked_reason: Option<BlockReason>,

    /// When the intent was created.
    pub created_at: DateTime<Utc>,

    /// When the latest decision was recorded.
    pub decided_at: Option<DateTime<Utc>>,
}

impl MessageIntent {
    /// A new PENDING intent.
    pub fn new(
        id: &str,
        organization_id: &str,
        target: Target,
        purpose: IntentSource,
        payload: IntentPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            organization_id: organization_id.to_string(),
            target,
            purpose,
            payload,
            status: IntentStatus::Pending,
            decided_by_instance_id: None,
            queued_until: None,
            blocked_reason: None,
            created_at: now,
            decided_at: None,
        }
    }

    /// Whether the gate still owes this intent a first decision.
    pub fn is_pending(&self) -> bool {
        self.status == IntentStatus::Pending
    }

    /// Whether the intent is parked awaiting re-evaluation.
    pub fn is_queued(&self) -> bool {
        self.status == IntentStatus::Queued
    }

    /// The previously recorded decision, for idempotent replay.
    ///
    /// Returns `None` while PENDING. A QUEUED intent's recorded decision
    /// is only returned to callers when the gate chooses not to re-run
    /// it; the gate itself re-evaluates queued intents.
    pub fn recorded_decision(&self) -> Option<IntentDecision> {
        match self.status {
            IntentStatus::Pending => None,
            IntentStatus::Approved => {
                let instance_id = self.decided_by_instance_id.clone().unwrap_or_default();
                Some(IntentDecision::Approved { instance_id })
            }
            IntentStatus::Queued => Some(IntentDecision::Queued {
                queued_until: self.queued_until,
                reason: self.blocked_reason.unwrap_or(BlockReason::RateLimit),
            }),
            IntentStatus::Blocked => Some(IntentDecision::Blocked {
                reason: self.blocked_reason.unwrap_or(BlockReason::PolicyBlocked),
            }),
        }
    }

    fn guard(&self, to: IntentStatus) -> Result<(), InvalidTransition> {
        match self.status {
            IntentStatus::Pending | IntentStatus::Queued => Ok(()),
            from => Err(InvalidTransition { from, to }),
        }
    }

    /// Admit the intent and assign it to `instance_id`. Terminal.
    pub fn approve(
        &mut self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntentEvent>, InvalidTransition> {
        self.guard(IntentStatus::Approved)?;

        self.status = IntentStatus::Approved;
        self.decided_by_instance_id = Some(instance_id.to_string());
        self.queued_until = None;
        self.blocked_reason = None;
        self.decided_at = Some(now);

        Ok(vec![IntentEvent::Approved {
            intent_id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            instance_id: instance_id.to_string(),
            at: now,
        }])
    }

    /// Defer the intent until `queued_until` (if known).
    pub fn queue(
        &mut self,
        queued_until: Option<DateTime<Utc>>,
        reason: BlockReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntentEvent>, InvalidTransition> {
        self.guard(IntentStatus::Queued)?;

        self.status = IntentStatus::Queued;
        self.decided_by_instance_id = None;
        self.queued_until = queued_until;
        self.blocked_reason = Some(reason);
        self.decided_at = Some(now);

        Ok(vec![IntentEvent::Queued {
            intent_id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            queued_until,
            reason,
            at: now,
        }])
    }

    /// Terminally refuse the intent.
    pub fn block(
        &mut self,
        reason: BlockReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntentEvent>, InvalidTransition> {
        self.guard(IntentStatus::Blocked)?;

        self.status = IntentStatus::Blocked;
        self.decided_by_instance_id = None;
        self.queued_until = None;
        self.blocked_reason = Some(reason);
        self.decided_at = Some(now);

        Ok(vec![IntentEvent::Blocked {
            intent_id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            reason,
            at: now,
        }])
    }
}
