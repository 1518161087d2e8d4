use crate::chat::{Conversation, ConversationSummary, Cursor, Message, MessagePage, SortOrder};
use crate::error::CourierError;
use crate::identity::Profile;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Largest message page a single `list_messages` call will return.
pub const MAX_PAGE_SIZE: u32 = 200;

const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// In-memory store, used by the test suites. A single connection keeps
    /// every query on the same ephemeral database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                last_message_at DATETIME NOT NULL,
                UNIQUE (participant_a, participant_b)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_a_recency
                ON conversations(participant_a, last_message_at DESC);
            CREATE INDEX IF NOT EXISTS idx_conversations_b_recency
                ON conversations(participant_b, last_message_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                read_by_recipient BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
                ON messages(conversation_id, created_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages(recipient_id, read_by_recipient);

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Conversation directory
    // -------------------------------------------------------------------------

    /// Resolve the canonical conversation for a pair of users, creating it on
    /// first contact.
    ///
    /// The pair is normalized before lookup, so `(a, b)` and `(b, a)` always
    /// resolve to the same row. Concurrent first contact is settled by the
    /// uniqueness constraint: the losing insert is a no-op and the re-select
    /// returns the winner.
    pub async fn resolve_or_create_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> Result<Conversation, CourierError> {
        if user_a == user_b {
            return Err(CourierError::InvalidParticipants);
        }
        let (first, second) = normalize_pair(user_a, user_b);
        self.with_retries(|| self.try_resolve_or_create(first, second))
            .await
    }

    async fn try_resolve_or_create(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> Result<Conversation, CourierError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, created_at, last_message_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(participant_a, participant_b) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(first)
        .bind(second)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at, last_message_at
            FROM conversations
            WHERE participant_a = ? AND participant_b = ?
            "#,
        )
        .bind(first)
        .bind(second)
        .fetch_one(&self.pool)
        .await?;

        Ok(conversation_from_row(&row)?)
    }

    /// Fetch a conversation by id.
    pub async fn conversation(&self, id: Uuid) -> Result<Conversation, CourierError> {
        let row = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at, last_message_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(conversation_from_row(&row)?),
            None => Err(CourierError::ConversationNotFound(id)),
        }
    }

    // -------------------------------------------------------------------------
    // Message log
    // -------------------------------------------------------------------------

    /// Append a message to a conversation.
    ///
    /// The timestamp comes from the server clock, clamped so ordering within
    /// the conversation never regresses, and `last_message_at` is bumped in
    /// the same transaction as the insert.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> Result<Message, CourierError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CourierError::EmptyMessage);
        }
        self.with_retries(|| self.try_append(conversation_id, sender_id, content))
            .await
    }

    async fn try_append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> Result<Message, CourierError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at, last_message_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let conversation = match row {
            Some(row) => conversation_from_row(&row)?,
            None => return Err(CourierError::ConversationNotFound(conversation_id)),
        };

        let recipient_id = conversation
            .other_participant(sender_id)
            .ok_or(CourierError::NotAParticipant(sender_id))?;

        // Strictly after the previous message, even if the clock stalls or
        // steps backwards, so the (created_at, id) order matches commit order.
        let created_at =
            Utc::now().max(conversation.last_message_at + chrono::Duration::microseconds(1));
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            recipient_id,
            content: content.to_string(),
            created_at,
            read_by_recipient: false,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, recipient_id, content, created_at, read_by_recipient)
            VALUES (?, ?, ?, ?, ?, ?, FALSE)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.recipient_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        // MAX keeps the recency marker monotonic under concurrent appends.
        sqlx::query(
            r#"
            UPDATE conversations SET last_message_at = MAX(last_message_at, ?) WHERE id = ?
            "#,
        )
        .bind(message.created_at)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(message)
    }

    /// One page of a conversation's messages, restartable via cursor.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        cursor: Option<Cursor>,
        limit: u32,
        order: SortOrder,
    ) -> Result<MessagePage, CourierError> {
        // Existence check so an unknown conversation is a 404, not an empty page.
        self.conversation(conversation_id).await?;

        let limit = limit.clamp(1, MAX_PAGE_SIZE) as i64;
        let query = match order {
            SortOrder::Desc => {
                r#"
                SELECT id, conversation_id, sender_id, recipient_id, content, created_at, read_by_recipient
                FROM messages
                WHERE conversation_id = ?
                  AND (? IS NULL OR created_at < ? OR (created_at = ? AND id < ?))
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#
            }
            SortOrder::Asc => {
                r#"
                SELECT id, conversation_id, sender_id, recipient_id, content, created_at, read_by_recipient
                FROM messages
                WHERE conversation_id = ?
                  AND (? IS NULL OR created_at > ? OR (created_at = ? AND id > ?))
                ORDER BY created_at ASC, id ASC
                LIMIT ?
                "#
            }
        };

        let rows = sqlx::query(query)
            .bind(conversation_id)
            .bind(cursor.map(|c| c.created_at))
            .bind(cursor.map(|c| c.created_at))
            .bind(cursor.map(|c| c.created_at))
            .bind(cursor.map(|c| c.id))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(message_from_row(&row)?);
        }

        let next_cursor = if messages.len() as i64 == limit {
            messages.last().map(|m| Cursor {
                created_at: m.created_at,
                id: m.id,
            })
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Most recent message of a conversation, if any.
    pub async fn latest_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Message>, CourierError> {
        let row = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, recipient_id, content, created_at, read_by_recipient
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(message_from_row(&row)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Read-state tracker
    // -------------------------------------------------------------------------

    /// Mark every message addressed to `reader_id` in the conversation as
    /// read. Returns the number of messages that transitioned; calling again
    /// with no new messages returns zero.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<u64, CourierError> {
        let conversation = self.conversation(conversation_id).await?;
        if !conversation.involves(reader_id) {
            return Err(CourierError::NotAParticipant(reader_id));
        }

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read_by_recipient = TRUE
            WHERE conversation_id = ? AND recipient_id = ? AND read_by_recipient = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Messages addressed to `user_id` that have not been read, across all
    /// conversations. Always counted from the rows themselves.
    pub async fn unread_count_for(&self, user_id: Uuid) -> Result<i64, CourierError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM messages
            WHERE recipient_id = ? AND read_by_recipient = FALSE
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    /// Unread count scoped to a single conversation.
    pub async fn unread_count_in(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<i64, CourierError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM messages
            WHERE conversation_id = ? AND recipient_id = ? AND read_by_recipient = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Conversation index
    // -------------------------------------------------------------------------

    /// Every conversation `user_id` participates in, most recent first, each
    /// annotated with the other participant, the latest message, and the
    /// unread count.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, CourierError> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at, last_message_at
            FROM conversations
            WHERE participant_a = ? OR participant_b = ?
            ORDER BY last_message_at DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = conversation_from_row(&row)?;
            let Some(other_id) = conversation.other_participant(user_id) else {
                continue;
            };
            let other_participant = self
                .get_profile(other_id)
                .await?
                .unwrap_or_else(|| Profile::unknown(other_id));
            let last_message = self.latest_message(conversation.id).await?;
            let unread_count = self.unread_count_in(user_id, conversation.id).await?;

            summaries.push(ConversationSummary {
                conversation_id: conversation.id,
                other_participant,
                last_message,
                last_message_at: conversation.last_message_at,
                unread_count,
            });
        }

        Ok(summaries)
    }

    // -------------------------------------------------------------------------
    // Profiles
    // -------------------------------------------------------------------------

    /// Save or update a user profile. Blank display names are rejected so the
    /// conversation index never renders an empty label.
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<(), CourierError> {
        let display_name = profile.display_name.trim();
        if display_name.is_empty() {
            return Err(CourierError::EmptyDisplayName);
        }

        sqlx::query(
            r#"
            INSERT INTO profiles (id, display_name)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name
            "#,
        )
        .bind(profile.id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>, CourierError> {
        let row = sqlx::query("SELECT id, display_name FROM profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Profile {
            id: row.get("id"),
            display_name: row.get("display_name"),
        }))
    }

    // -------------------------------------------------------------------------
    // Retry policy
    // -------------------------------------------------------------------------

    /// Run a write, retrying transient failures with doubling backoff.
    /// Validation errors pass through untouched.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, CourierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CourierError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::warn!("transient store error (attempt {attempt}): {err}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn normalize_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        participant_a: row.try_get("participant_a")?,
        participant_b: row.try_get("participant_b")?,
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        recipient_id: row.try_get("recipient_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        read_by_recipient: row.try_get("read_by_recipient")?,
    })
}
