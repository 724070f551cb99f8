use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::broadcast;
use tracing::debug;

use shared::domain::{MessageKind, MessageStatus};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Durable local store for conversations, messages, participants and the
/// profile cache. Single source of truth for readers; every mutation emits a
/// [`StoreChange`] so observers can re-query without polling.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<StoreChange>,
}

/// Notification that a logical table changed. Carries just enough for a
/// reader to decide whether its query is affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Conversations,
    Messages { chat_id: String },
    Participants { user_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub chat_id: String,
    pub last_message: Option<String>,
    pub last_message_timestamp: Option<String>,
    pub unread_counts: HashMap<String, i64>,
    pub participants: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: String,
    pub status: MessageStatus,
    pub kind: MessageKind,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredParticipant {
    pub user_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<i64>,
    pub last_updated: i64,
}

impl StoredParticipant {
    /// A participant we know only by id, pending a profile fetch.
    pub fn placeholder(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: "User".to_string(),
            avatar_url: None,
            is_online: false,
            last_seen: None,
            last_updated: now_millis(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.name == "User" || self.avatar_url.as_deref().unwrap_or("").is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConversationWithParticipants {
    pub conversation: StoredConversation,
    pub participants: Vec<StoredParticipant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedProfile {
    pub user_id: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<i64>,
    pub cached_at: i64,
    pub last_updated: i64,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine; notifications are best effort.
        let _ = self.changes.send(change);
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or updates a conversation together with its participants and
    /// membership rows as one transaction, so readers never observe a
    /// conversation without its participant set.
    pub async fn upsert_conversation_with_participants(
        &self,
        conversation: &StoredConversation,
        participants: &[StoredParticipant],
    ) -> Result<()> {
        let unread_json = serde_json::to_string(&conversation.unread_counts)?;
        let participants_json = serde_json::to_string(&conversation.participants)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (chat_id, last_message, last_message_timestamp, unread_counts, participants, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                last_message = excluded.last_message,
                last_message_timestamp = excluded.last_message_timestamp,
                unread_counts = excluded.unread_counts,
                participants = excluded.participants,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.chat_id)
        .bind(&conversation.last_message)
        .bind(&conversation.last_message_timestamp)
        .bind(&unread_json)
        .bind(&participants_json)
        .bind(&conversation.updated_at)
        .execute(&mut *tx)
        .await?;

        for participant in participants {
            upsert_participant_tx(&mut tx, participant).await?;
            sqlx::query(
                "INSERT INTO conversation_participants (chat_id, user_id) VALUES (?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(&conversation.chat_id)
            .bind(&participant.user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.notify(StoreChange::Conversations);
        for participant in participants {
            self.notify(StoreChange::Participants {
                user_id: participant.user_id.clone(),
            });
        }
        Ok(())
    }

    pub async fn upsert_participant(&self, participant: &StoredParticipant) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_participant_tx(&mut tx, participant).await?;
        tx.commit().await?;
        self.notify(StoreChange::Participants {
            user_id: participant.user_id.clone(),
        });
        Ok(())
    }

    /// Idempotent message upsert. Re-upserting a known message refreshes its
    /// fields but never moves the status backwards, so a stale history page
    /// cannot demote a message that was already read.
    pub async fn upsert_message(&self, message: &StoredMessage) -> Result<()> {
        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT status FROM messages WHERE message_id = ?")
                .bind(&message.message_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = match existing.as_deref().and_then(MessageStatus::parse) {
            Some(current) if !current.can_transition(message.status) => current,
            _ => message.status,
        };

        sqlx::query(
            "INSERT INTO messages (message_id, chat_id, sender_id, recipient_id, content, timestamp, status, kind, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET
                chat_id = excluded.chat_id,
                sender_id = excluded.sender_id,
                recipient_id = excluded.recipient_id,
                content = excluded.content,
                timestamp = excluded.timestamp,
                status = excluded.status,
                kind = excluded.kind,
                metadata = excluded.metadata",
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(&message.recipient_id)
        .bind(&message.content)
        .bind(&message.timestamp)
        .bind(status.as_str())
        .bind(message.kind.as_str())
        .bind(&metadata_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify(StoreChange::Messages {
            chat_id: message.chat_id.clone(),
        });
        Ok(())
    }

    /// Applies a status update if it is a legal forward transition. Returns
    /// whether anything changed.
    pub async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT chat_id, status FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            debug!(message_id, "status update for unknown message ignored");
            return Ok(false);
        };

        let chat_id: String = row.get(0);
        let current = MessageStatus::parse(&row.get::<String, _>(1))
            .ok_or_else(|| anyhow!("corrupt status for message {message_id}"))?;
        if !current.can_transition(status) {
            debug!(
                message_id,
                from = current.as_str(),
                to = status.as_str(),
                "ignoring non-monotonic status update"
            );
            return Ok(false);
        }

        sqlx::query("UPDATE messages SET status = ? WHERE message_id = ?")
            .bind(status.as_str())
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notify(StoreChange::Messages { chat_id });
        Ok(true)
    }

    /// Marks every unread message from the other party as read and zeroes the
    /// reader's unread counter, atomically.
    pub async fn mark_messages_read(&self, chat_id: &str, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE messages SET status = 'READ'
             WHERE chat_id = ? AND sender_id != ? AND status NOT IN ('READ', 'DELETED', 'FAILED')",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let counts_json: Option<String> =
            sqlx::query_scalar("SELECT unread_counts FROM conversations WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(counts_json) = counts_json {
            let mut counts: HashMap<String, i64> =
                serde_json::from_str(&counts_json).unwrap_or_default();
            counts.insert(user_id.to_string(), 0);
            sqlx::query("UPDATE conversations SET unread_counts = ? WHERE chat_id = ?")
                .bind(serde_json::to_string(&counts)?)
                .bind(chat_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.notify(StoreChange::Messages {
            chat_id: chat_id.to_string(),
        });
        self.notify(StoreChange::Conversations);
        Ok(())
    }

    pub async fn update_conversation_snippet(
        &self,
        chat_id: &str,
        last_message: &str,
        timestamp: &str,
        unread_counts: &HashMap<String, i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message = ?, last_message_timestamp = ?, unread_counts = ?, updated_at = ?
             WHERE chat_id = ?",
        )
        .bind(last_message)
        .bind(timestamp)
        .bind(serde_json::to_string(unread_counts)?)
        .bind(timestamp)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        self.notify(StoreChange::Conversations);
        Ok(())
    }

    pub async fn update_unread_counts(
        &self,
        chat_id: &str,
        unread_counts: &HashMap<String, i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE conversations SET unread_counts = ? WHERE chat_id = ?")
            .bind(serde_json::to_string(unread_counts)?)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        self.notify(StoreChange::Conversations);
        Ok(())
    }

    pub async fn update_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE participants SET is_online = ?, last_seen = ? WHERE user_id = ?")
            .bind(is_online)
            .bind(last_seen)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.notify(StoreChange::Participants {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    pub async fn conversation(&self, chat_id: &str) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT chat_id, last_message, last_message_timestamp, unread_counts, participants, updated_at
             FROM conversations WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(conversation_from_row).transpose()
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationWithParticipants>> {
        let rows = sqlx::query(
            "SELECT chat_id, last_message, last_message_timestamp, unread_counts, participants, updated_at
             FROM conversations
             ORDER BY last_message_timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        self.attach_participants(rows).await
    }

    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationWithParticipants>> {
        let rows = sqlx::query(
            "SELECT c.chat_id, c.last_message, c.last_message_timestamp, c.unread_counts, c.participants, c.updated_at
             FROM conversations c
             INNER JOIN conversation_participants cp ON c.chat_id = cp.chat_id
             WHERE cp.user_id = ?
             ORDER BY c.last_message_timestamp DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        self.attach_participants(rows).await
    }

    async fn attach_participants(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<ConversationWithParticipants>> {
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = conversation_from_row(row)?;
            let participants = sqlx::query(
                "SELECT p.user_id, p.name, p.avatar_url, p.is_online, p.last_seen, p.last_updated
                 FROM participants p
                 INNER JOIN conversation_participants cp ON p.user_id = cp.user_id
                 WHERE cp.chat_id = ?",
            )
            .bind(&conversation.chat_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(participant_from_row)
            .collect();
            result.push(ConversationWithParticipants {
                conversation,
                participants,
            });
        }
        Ok(result)
    }

    pub async fn message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT message_id, chat_id, sender_id, recipient_id, content, timestamp, status, kind, metadata
             FROM messages WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    pub async fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, sender_id, recipient_id, content, timestamp, status, kind, metadata
             FROM messages WHERE chat_id = ? ORDER BY timestamp ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    /// Inbound messages in a chat the given user has not read yet.
    pub async fn unread_messages(&self, chat_id: &str, user_id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, sender_id, recipient_id, content, timestamp, status, kind, metadata
             FROM messages
             WHERE chat_id = ? AND sender_id != ? AND status NOT IN ('READ', 'DELETED', 'FAILED')
             ORDER BY timestamp ASC",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    pub async fn participant(&self, user_id: &str) -> Result<Option<StoredParticipant>> {
        let row = sqlx::query(
            "SELECT user_id, name, avatar_url, is_online, last_seen, last_updated
             FROM participants WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(participant_from_row))
    }

    /// Full local wipe for account switch or logout: conversations, messages,
    /// participants, memberships and the profile cache go in one transaction.
    pub async fn clear_all_chat_data(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM conversation_participants")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM participants")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM profile_cache")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.notify(StoreChange::Conversations);
        Ok(())
    }

    pub async fn cached_profile(&self, user_id: &str) -> Result<Option<CachedProfile>> {
        let row = sqlx::query(
            "SELECT user_id, username, avatar_url, is_online, last_seen, cached_at, last_updated
             FROM profile_cache WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CachedProfile {
            user_id: r.get(0),
            username: r.get(1),
            avatar_url: r.get(2),
            is_online: r.get(3),
            last_seen: r.get(4),
            cached_at: r.get(5),
            last_updated: r.get(6),
        }))
    }

    pub async fn upsert_profile(&self, profile: &CachedProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO profile_cache (user_id, username, avatar_url, is_online, last_seen, cached_at, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                avatar_url = excluded.avatar_url,
                is_online = excluded.is_online,
                last_seen = excluded.last_seen,
                cached_at = excluded.cached_at,
                last_updated = excluded.last_updated",
        )
        .bind(&profile.user_id)
        .bind(&profile.username)
        .bind(&profile.avatar_url)
        .bind(profile.is_online)
        .bind(profile.last_seen)
        .bind(profile.cached_at)
        .bind(profile.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_expired_profiles(&self, expire_before: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM profile_cache WHERE cached_at < ?")
            .bind(expire_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn profile_cache_size(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profile_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_oldest_profiles(&self, count: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM profile_cache WHERE user_id IN (
                SELECT user_id FROM profile_cache ORDER BY cached_at ASC LIMIT ?
             )",
        )
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn upsert_participant_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    participant: &StoredParticipant,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO participants (user_id, name, avatar_url, is_online, last_seen, last_updated)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
            name = excluded.name,
            avatar_url = excluded.avatar_url,
            is_online = excluded.is_online,
            last_seen = excluded.last_seen,
            last_updated = excluded.last_updated",
    )
    .bind(&participant.user_id)
    .bind(&participant.name)
    .bind(&participant.avatar_url)
    .bind(participant.is_online)
    .bind(participant.last_seen)
    .bind(participant.last_updated)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn conversation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredConversation> {
    let unread_counts: HashMap<String, i64> =
        serde_json::from_str(&row.get::<String, _>(3)).unwrap_or_default();
    let participants: Vec<String> =
        serde_json::from_str(&row.get::<String, _>(4)).unwrap_or_default();
    Ok(StoredConversation {
        chat_id: row.get(0),
        last_message: row.get(1),
        last_message_timestamp: row.get(2),
        unread_counts,
        participants,
        updated_at: row.get(5),
    })
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let status_raw: String = row.get(6);
    let kind_raw: String = row.get(7);
    let metadata = row
        .get::<Option<String>, _>(8)
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .unwrap_or_default();
    Ok(StoredMessage {
        message_id: row.get(0),
        chat_id: row.get(1),
        sender_id: row.get(2),
        recipient_id: row.get(3),
        content: row.get(4),
        timestamp: row.get(5),
        status: MessageStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("corrupt message status: {status_raw}"))?,
        kind: MessageKind::parse(&kind_raw).unwrap_or_default(),
        metadata,
    })
}

fn participant_from_row(row: sqlx::sqlite::SqliteRow) -> StoredParticipant {
    StoredParticipant {
        user_id: row.get(0),
        name: row.get(1),
        avatar_url: row.get(2),
        is_online: row.get(3),
        last_seen: row.get(4),
        last_updated: row.get(5),
    }
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
