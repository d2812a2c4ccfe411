use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{AttachmentJobKind, ConversationId, DeviceId, JobId, MessageDirection, MessageId, UserId},
    model::{AttachmentDownloadJob, Conversation, ForwardRef, Message, ReadPosition},
};

/// Addressing mode for message range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRange {
    /// Inclusive sequence-id window.
    Sequence { start: i64, end: i64 },
    /// Server timestamps in `(after, until]`.
    ServerTimestamp { after: i64, until: i64 },
}

/// Durable state consumed by the sync core.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;
    /// Ascending by the range's ordering key.
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        range: MessageRange,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn save_messages(&self, messages: &[Message]) -> Result<()>;

    /// Positions with `begin <= max_server_timestamp <= end`, ascending.
    async fn get_read_positions(
        &self,
        conversation_id: ConversationId,
        begin: i64,
        end: i64,
        limit: Option<u32>,
    ) -> Result<Vec<ReadPosition>>;
    async fn save_read_position(&self, position: &ReadPosition) -> Result<()>;
    /// Incoming messages with a server timestamp in `(after, until]`.
    async fn get_unread_message_count(
        &self,
        conversation_id: ConversationId,
        after: i64,
        until: i64,
    ) -> Result<u32>;

    async fn save_job(&self, job: &AttachmentDownloadJob) -> Result<()>;
    /// Non-pending jobs due at `now`, oldest schedule first.
    async fn get_next_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttachmentDownloadJob>>;
    async fn set_job_pending(&self, id: JobId, pending: bool) -> Result<()>;
    async fn remove_job(&self, id: JobId) -> Result<()>;
    async fn reset_all_pending_flags(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `sqlite::memory:` would open its own database.
        let max_connections = if sqlite_path(database_url).is_none() { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Every job regardless of schedule or pending flag.
    pub async fn list_jobs(&self) -> Result<Vec<AttachmentDownloadJob>> {
        let rows = sqlx::query(
            "SELECT id, message_id, kind, slot_index, attempts, pending, scheduled_at_ms, forward_id, attachment_json
             FROM attachment_download_jobs
             ORDER BY scheduled_at_ms ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list attachment jobs")?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl SyncStore for Storage {
    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT json FROM conversations WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load conversation {id}"))?;
        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>(0))
                .with_context(|| format!("corrupt conversation json for {id}"))
        })
        .transpose()
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let json = serde_json::to_string(conversation)?;
        sqlx::query(
            "INSERT INTO conversations (id, json, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET json = excluded.json, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(conversation.id.0)
        .bind(json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save conversation {}", conversation.id))?;
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT json FROM messages WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load message {id}"))?;
        row.map(|r| message_from_json(&r.get::<String, _>(0))).transpose()
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        range: MessageRange,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let rows = match range {
            MessageRange::Sequence { start, end } => {
                sqlx::query(
                    "SELECT json FROM messages
                     WHERE conversation_id = ? AND sequence_id BETWEEN ? AND ?
                     ORDER BY sequence_id ASC
                     LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(start)
                .bind(end)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            MessageRange::ServerTimestamp { after, until } => {
                sqlx::query(
                    "SELECT json FROM messages
                     WHERE conversation_id = ? AND server_timestamp > ? AND server_timestamp <= ?
                     ORDER BY server_timestamp ASC
                     LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(after)
                .bind(until)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .with_context(|| format!("failed to query messages for conversation {conversation_id}"))?;

        rows.iter()
            .map(|r| message_from_json(&r.get::<String, _>(0)))
            .collect()
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sequence_id, server_timestamp, direction, json)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    conversation_id = excluded.conversation_id,
                    sequence_id = excluded.sequence_id,
                    server_timestamp = excluded.server_timestamp,
                    direction = excluded.direction,
                    json = excluded.json",
            )
            .bind(message.id.0)
            .bind(message.conversation_id.0)
            .bind(message.sequence_id)
            .bind(message.server_timestamp)
            .bind(direction_str(message.direction))
            .bind(serde_json::to_string(message)?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to save message {}", message.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_read_positions(
        &self,
        conversation_id: ConversationId,
        begin: i64,
        end: i64,
        limit: Option<u32>,
    ) -> Result<Vec<ReadPosition>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT source_device, conversation_id, sender, sent_at, read_at, max_server_timestamp, max_notify_sequence_id, group_id
             FROM read_positions
             WHERE conversation_id = ? AND max_server_timestamp BETWEEN ? AND ?
             ORDER BY max_server_timestamp ASC, source_device ASC
             LIMIT ?",
        )
        .bind(conversation_id.0)
        .bind(begin)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to query read positions for conversation {conversation_id}"))?;

        Ok(rows
            .into_iter()
            .map(|r| ReadPosition {
                source_device: DeviceId(r.get::<i64, _>(0)),
                conversation_id: ConversationId(r.get::<i64, _>(1)),
                sender: r.get::<Option<i64>, _>(2).map(UserId),
                sent_at: r.get::<i64, _>(3),
                read_at: r.get::<i64, _>(4),
                max_server_timestamp: r.get::<i64, _>(5),
                max_notify_sequence_id: r.get::<i64, _>(6),
                group_id: r.get::<Option<String>, _>(7),
            })
            .collect())
    }

    async fn save_read_position(&self, position: &ReadPosition) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_positions (source_device, conversation_id, max_server_timestamp, sender, sent_at, read_at, max_notify_sequence_id, group_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_device, conversation_id, max_server_timestamp) DO NOTHING",
        )
        .bind(position.source_device.0)
        .bind(position.conversation_id.0)
        .bind(position.max_server_timestamp)
        .bind(position.sender.map(|s| s.0))
        .bind(position.sent_at)
        .bind(position.read_at)
        .bind(position.max_notify_sequence_id)
        .bind(position.group_id.as_deref())
        .execute(&self.pool)
        .await
        .context("failed to save read position")?;
        Ok(())
    }

    async fn get_unread_message_count(
        &self,
        conversation_id: ConversationId,
        after: i64,
        until: i64,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND direction = 'incoming'
               AND server_timestamp > ? AND server_timestamp <= ?",
        )
        .bind(conversation_id.0)
        .bind(after)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to count unread messages for conversation {conversation_id}"))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn save_job(&self, job: &AttachmentDownloadJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO attachment_download_jobs (id, message_id, kind, slot_index, attempts, pending, scheduled_at_ms, forward_id, attachment_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                attempts = excluded.attempts,
                pending = excluded.pending,
                scheduled_at_ms = excluded.scheduled_at_ms,
                attachment_json = excluded.attachment_json",
        )
        .bind(job.id.to_string())
        .bind(job.message_id.0)
        .bind(job.kind.as_str())
        .bind(i64::try_from(job.index).unwrap_or(i64::MAX))
        .bind(i64::from(job.attempts))
        .bind(job.pending)
        .bind(job.scheduled_at.timestamp_millis())
        .bind(job.forward_ref.as_ref().map(|f| f.forward_id.as_str()))
        .bind(serde_json::to_string(&job.attachment)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save attachment job {}", job.id))?;
        Ok(())
    }

    async fn get_next_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttachmentDownloadJob>> {
        let rows = sqlx::query(
            "SELECT id, message_id, kind, slot_index, attempts, pending, scheduled_at_ms, forward_id, attachment_json
             FROM attachment_download_jobs
             WHERE pending = 0 AND scheduled_at_ms <= ?
             ORDER BY scheduled_at_ms ASC
             LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch next attachment jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    async fn set_job_pending(&self, id: JobId, pending: bool) -> Result<()> {
        sqlx::query("UPDATE attachment_download_jobs SET pending = ? WHERE id = ?")
            .bind(pending)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to flag attachment job {id}"))?;
        Ok(())
    }

    async fn remove_job(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM attachment_download_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove attachment job {id}"))?;
        Ok(())
    }

    async fn reset_all_pending_flags(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE attachment_download_jobs SET pending = 0 WHERE pending = 1")
            .execute(&self.pool)
            .await
            .context("failed to reset pending attachment jobs")?;
        Ok(result.rows_affected())
    }
}

fn direction_str(direction: MessageDirection) -> &'static str {
    match direction {
        MessageDirection::Incoming => "incoming",
        MessageDirection::Outgoing => "outgoing",
    }
}

fn message_from_json(raw: &str) -> Result<Message> {
    serde_json::from_str(raw).context("corrupt message json")
}

fn job_from_row(r: &SqliteRow) -> Result<AttachmentDownloadJob> {
    let id = Uuid::parse_str(&r.get::<String, _>(0)).context("corrupt attachment job id")?;
    let kind_raw = r.get::<String, _>(2);
    let kind = AttachmentJobKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("unknown attachment job kind '{kind_raw}'"))?;
    let scheduled_at_ms = r.get::<i64, _>(6);
    let scheduled_at = DateTime::<Utc>::from_timestamp_millis(scheduled_at_ms)
        .ok_or_else(|| anyhow!("attachment job schedule out of range: {scheduled_at_ms}"))?;

    Ok(AttachmentDownloadJob {
        id: JobId(id),
        message_id: MessageId(r.get::<i64, _>(1)),
        kind,
        index: usize::try_from(r.get::<i64, _>(3)).unwrap_or_default(),
        attempts: u32::try_from(r.get::<i64, _>(4)).unwrap_or_default(),
        pending: r.get::<bool, _>(5),
        scheduled_at,
        forward_ref: r
            .get::<Option<String>, _>(7)
            .map(|forward_id| ForwardRef { forward_id }),
        attachment: serde_json::from_str(&r.get::<String, _>(8))
            .context("corrupt attachment job descriptor")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
