//! SQLite storage layer for embergate.
//!
//! One pool wrapper owns the whole schema: the instance fleet, message
//! intents, execution controls, conversations, the outbound send log
//! (from which rate snapshots are derived), the intent-event audit log,
//! and the gate-decision log the metrics endpoint reads.
//!
//! Enums are stored as their stable string identifiers and payloads as
//! JSON; timestamps are unix seconds. The intent transition write is
//! guarded by the status the caller read, which is what arbitrates two
//! concurrent decisions on the same intent.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use async_trait::async_trait;

use crate::control::{ControlScope, ControlStatus, ExecutionControl};
use crate::instance::{
    ConnectionStatus, Instance, InstancePurpose, LifecycleStatus, Reputation, Temperature,
};
use crate::intent::{
    IntentEvent, IntentPayload, IntentStatus, MessageIntent, Target, TargetKind,
};
use crate::model::{BlockReason, IntentSource, RateSnapshot};
use crate::ports::{
    Conversation, ConversationRepository, EngineError, ExecutionControlRepository,
    InstanceRepository, MessageIntentRepository, RateSnapshotProvider,
};

/// How far back outbound text signatures count as "recent" for
/// duplicate suppression.
const SIGNATURE_LOOKBACK_SECONDS: i64 = 600;

/// One row in the gate-decision log.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    /// Tenant the decision was made for, when known.
    pub organization_id: Option<String>,
    /// Instance the decision concerned, when known.
    pub instance_id: Option<String>,
    /// ALLOWED / BLOCKED / DELAYED / APPROVED / QUEUED.
    pub outcome: String,
    /// Block or queue reason, when the outcome carries one.
    pub reason: Option<BlockReason>,
    /// When the decision was made.
    pub at: DateTime<Utc>,
}

/// One aggregated row out of the decision log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionCount {
    /// Decision outcome.
    pub outcome: String,
    /// Reason, for outcomes that carry one.
    pub reason: Option<String>,
    /// How many decisions matched.
    pub count: i64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:embergate.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                lifecycle TEXT NOT NULL,
                connection TEXT NOT NULL,
                purpose TEXT NOT NULL,
                temperature TEXT NOT NULL,
                cooldown_started_at INTEGER,
                risk_flags INTEGER NOT NULL,
                reputation_created_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_instances_organization
            ON instances(organization_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_intents (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target_value TEXT NOT NULL,
                purpose TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                decided_by_instance_id TEXT,
                queued_until INTEGER,
                blocked_reason TEXT,
                created_at INTEGER NOT NULL,
                decided_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_controls (
                scope TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                paused_until INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (scope, scope_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                last_inbound_at INTEGER,
                last_outbound_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                text_signature TEXT,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for the rate-snapshot window queries.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbound_log_instance_ts
            ON outbound_log(instance_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intent_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gate_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id TEXT,
                instance_id TEXT,
                outcome TEXT NOT NULL,
                reason TEXT,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_gate_decisions_ts
            ON gate_decisions(ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace an instance record.
    pub async fn upsert_instance(&self, instance: &Instance) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO instances
                (id, organization_id, lifecycle, connection, purpose,
                 temperature, cooldown_started_at, risk_flags,
                 reputation_created_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.organization_id)
        .bind(instance.lifecycle.as_str())
        .bind(instance.connection.as_str())
        .bind(instance.purpose.as_str())
        .bind(instance.reputation.temperature.as_str())
        .bind(instance.reputation.cooldown_started_at.map(|t| t.timestamp()))
        .bind(i64::from(instance.reputation.risk_flags))
        .bind(instance.reputation.created_at.timestamp())
        .bind(instance.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a conversation record.
    pub async fn upsert_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO conversations
                (id, organization_id, last_inbound_at, last_outbound_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.organization_id)
        .bind(conversation.last_inbound_at.map(|t| t.timestamp()))
        .bind(conversation.last_outbound_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record one physically sent message in the outbound log.
    ///
    /// `text` feeds the duplicate-suppression signature; non-text
    /// payloads pass `None`.
    pub async fn record_outbound(
        &self,
        instance_id: &str,
        recipient: &str,
        text: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let signature = text.map(|t| RateSnapshot::text_signature(recipient, t));

        sqlx::query(
            r#"
            INSERT INTO outbound_log (instance_id, recipient, text_signature, ts)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(instance_id)
        .bind(recipient)
        .bind(signature)
        .bind(at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one row to the gate-decision log.
    pub async fn record_decision(&self, record: &DecisionRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO gate_decisions (organization_id, instance_id, outcome, reason, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.organization_id)
        .bind(&record.instance_id)
        .bind(&record.outcome)
        .bind(record.reason.map(|r| r.as_str()))
        .bind(record.at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append published intent events to the audit log, in order.
    pub async fn append_intent_events(
        &self,
        events: &[IntentEvent],
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        for event in events {
            let payload = serde_json::to_string(event)
                .map_err(|e| EngineError::Collaborator(e.into()))?;

            sqlx::query(
                r#"
                INSERT INTO intent_events (intent_id, name, payload, ts)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(event.intent_id())
            .bind(event.name())
            .bind(payload)
            .bind(at.timestamp())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Decision counts grouped by outcome and reason over a lookback
    /// window ending at `now`.
    pub async fn decision_counts(
        &self,
        lookback_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DecisionCount>, EngineError> {
        let start_ts = now.timestamp() - lookback_minutes * 60;

        let rows = sqlx::query(
            r#"
            SELECT outcome, reason, COUNT(*) as count
            FROM gate_decisions
            WHERE ts >= ? AND ts <= ?
            GROUP BY outcome, reason
            ORDER BY count DESC
            "#,
        )
        .bind(start_ts)
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DecisionCount {
                outcome: row.get("outcome"),
                reason: row.get("reason"),
                count: row.get("count"),
            })
            .collect())
    }

    fn instance_from_row(row: &SqliteRow) -> Result<Instance, EngineError> {
        let lifecycle: String = row.get("lifecycle");
        let connection: String = row.get("connection");
        let purpose: String = row.get("purpose");
        let temperature: String = row.get("temperature");
        let cooldown_ts: Option<i64> = row.get("cooldown_started_at");
        let risk_flags: i64 = row.get("risk_flags");

        Ok(Instance {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            lifecycle: parse_stored(&lifecycle, LifecycleStatus::parse, "lifecycle")?,
            connection: parse_stored(&connection, ConnectionStatus::parse, "connection")?,
            purpose: parse_stored(&purpose, InstancePurpose::parse, "purpose")?,
            reputation: Reputation {
                temperature: parse_stored(&temperature, Temperature::parse, "temperature")?,
                cooldown_started_at: cooldown_ts.map(from_ts).transpose()?,
                risk_flags: risk_flags.try_into().unwrap_or(0),
                created_at: from_ts(row.get("reputation_created_at"))?,
            },
            created_at: from_ts(row.get("created_at"))?,
        })
    }

    fn intent_from_row(row: &SqliteRow) -> Result<MessageIntent, EngineError> {
        let target_kind: String = row.get("target_kind");
        let purpose: String = row.get("purpose");
        let payload: String = row.get("payload");
        let status: String = row.get("status");
        let blocked_reason: Option<String> = row.get("blocked_reason");
        let queued_until: Option<i64> = row.get("queued_until");
        let decided_at: Option<i64> = row.get("decided_at");

        Ok(MessageIntent {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            target: Target {
                kind: parse_stored(&target_kind, TargetKind::parse, "target kind")?,
                value: row.get("target_value"),
            },
            purpose: parse_stored(&purpose, IntentSource::parse, "intent purpose")?,
            payload: serde_json::from_str::<IntentPayload>(&payload)
                .map_err(|e| EngineError::Collaborator(e.into()))?,
            status: parse_stored(&status, IntentStatus::parse, "intent status")?,
            decided_by_instance_id: row.get("decided_by_instance_id"),
            queued_until: queued_until.map(from_ts).transpose()?,
            blocked_reason: blocked_reason
                .as_deref()
                .map(|r| parse_stored(r, BlockReason::parse, "block reason"))
                .transpose()?,
            created_at: from_ts(row.get("created_at"))?,
            decided_at: decided_at.map(from_ts).transpose()?,
        })
    }
}

/// Map a stored enum identifier back to its type; a miss means the
/// database holds something this build does not understand.
fn parse_stored<T>(
    value: &str,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> Result<T, EngineError> {
    parse(value).ok_or_else(|| {
        EngineError::Collaborator(anyhow::anyhow!("unrecognized stored {what}: {value}"))
    })
}

fn from_ts(ts: i64) -> Result<DateTime<Utc>, EngineError> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| EngineError::Collaborator(anyhow::anyhow!("timestamp out of range: {ts}")))
}

#[async_trait]
impl InstanceRepository for Storage {
    async fn find_by_id(&self, id: &str) -> Result<Option<Instance>, EngineError> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::instance_from_row).transpose()
    }

    async fn list_by_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<Instance>, EngineError> {
        let rows = sqlx::query("SELECT * FROM instances WHERE organization_id = ? ORDER BY id")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::instance_from_row).collect()
    }
}

#[async_trait]
impl MessageIntentRepository for Storage {
    async fn find_by_id(&self, id: &str) -> Result<Option<MessageIntent>, EngineError> {
        let row = sqlx::query("SELECT * FROM message_intents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::intent_from_row).transpose()
    }

    async fn create(&self, intent: &MessageIntent) -> Result<(), EngineError> {
        let payload = serde_json::to_string(&intent.payload)
            .map_err(|e| EngineError::Collaborator(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO message_intents
                (id, organization_id, target_kind, target_value, purpose,
                 payload, status, decided_by_instance_id, queued_until,
                 blocked_reason, created_at, decided_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.organization_id)
        .bind(intent.target.kind.as_str())
        .bind(&intent.target.value)
        .bind(intent.purpose.as_str())
        .bind(payload)
        .bind(intent.status.as_str())
        .bind(&intent.decided_by_instance_id)
        .bind(intent.queued_until.map(|t| t.timestamp()))
        .bind(intent.blocked_reason.map(|r| r.as_str()))
        .bind(intent.created_at.timestamp())
        .bind(intent.decided_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_transition(
        &self,
        intent: &MessageIntent,
        expected: IntentStatus,
    ) -> Result<(), EngineError> {
        // Guarded by the status the caller read: zero rows affected
        // means another call transitioned the intent first.
        let result = sqlx::query(
            r#"
            UPDATE message_intents
            SET status = ?,
                decided_by_instance_id = ?,
                queued_until = ?,
                blocked_reason = ?,
                decided_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(intent.status.as_str())
        .bind(&intent.decided_by_instance_id)
        .bind(intent.queued_until.map(|t| t.timestamp()))
        .bind(intent.blocked_reason.map(|r| r.as_str()))
        .bind(intent.decided_at.map(|t| t.timestamp()))
        .bind(&intent.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ConcurrentDecision(intent.id.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl ExecutionControlRepository for Storage {
    async fn find_by_scope(
        &self,
        scope: ControlScope,
        scope_id: &str,
    ) -> Result<Option<ExecutionControl>, EngineError> {
        let row = sqlx::query("SELECT * FROM execution_controls WHERE scope = ? AND scope_id = ?")
            .bind(scope.as_str())
            .bind(scope_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let paused_until: Option<i64> = row.get("paused_until");

        Ok(Some(ExecutionControl {
            scope,
            scope_id: row.get("scope_id"),
            status: parse_stored(&status, ControlStatus::parse, "control status")?,
            reason: row.get("reason"),
            paused_until: paused_until.map(from_ts).transpose()?,
            updated_at: from_ts(row.get("updated_at"))?,
        }))
    }

    async fn upsert(&self, control: &ExecutionControl) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO execution_controls
                (scope, scope_id, status, reason, paused_until, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(control.scope.as_str())
        .bind(&control.scope_id)
        .bind(control.status.as_str())
        .bind(&control.reason)
        .bind(control.paused_until.map(|t| t.timestamp()))
        .bind(control.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for Storage {
    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, EngineError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_inbound: Option<i64> = row.get("last_inbound_at");
        let last_outbound: Option<i64> = row.get("last_outbound_at");

        Ok(Some(Conversation {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            last_inbound_at: last_inbound.map(from_ts).transpose()?,
            last_outbound_at: last_outbound.map(from_ts).transpose()?,
        }))
    }
}

#[async_trait]
impl RateSnapshotProvider for Storage {
    async fn snapshot(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateSnapshot, EngineError> {
        let now_ts = now.timestamp();
        let minute_start = now_ts - 60;
        let hour_start = now_ts - 3600;
        let signature_start = now_ts - SIGNATURE_LOOKBACK_SECONDS;

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN ts > ? THEN 1 ELSE 0 END), 0) as last_minute,
                COUNT(*) as last_hour,
                MIN(ts) as oldest_ts
            FROM outbound_log
            WHERE instance_id = ? AND ts > ? AND ts <= ?
            "#,
        )
        .bind(minute_start)
        .bind(instance_id)
        .bind(hour_start)
        .bind(now_ts)
        .fetch_one(&self.pool)
        .await?;

        let sent_last_minute: i64 = row.get("last_minute");
        let sent_last_hour: i64 = row.get("last_hour");
        let oldest_ts: Option<i64> = row.get("oldest_ts");

        // Last send overall, not bounded to the hour window.
        let last_row = sqlx::query(
            r#"
            SELECT MAX(ts) as last_ts FROM outbound_log WHERE instance_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        let last_ts: Option<i64> = last_row.get("last_ts");

        let signature_rows = sqlx::query(
            r#"
            SELECT DISTINCT text_signature
            FROM outbound_log
            WHERE instance_id = ? AND ts > ? AND text_signature IS NOT NULL
            "#,
        )
        .bind(instance_id)
        .bind(signature_start)
        .fetch_all(&self.pool)
        .await?;

        Ok(RateSnapshot {
            sent_last_minute,
            sent_last_hour,
            last_message_at: last_ts.map(from_ts).transpose()?,
            oldest_in_hour_at: oldest_ts.map(from_ts).transpose()?,
            recent_text_signatures: signature_rows
                .iter()
                .map(|r| r.get("text_signature"))
                .collect(),
        })
    }
}

#[async_trait]
impl crate::ports::DomainEventBus for Storage {
    /// Publishing to storage appends to the audit log; ordering within
    /// one call is preserved by the autoincrement key.
    async fn publish(&self, event: &IntentEvent) -> Result<(), EngineError> {
        self.append_intent_events(std::slice::from_ref(event), event.at())
            .await
    }
}
