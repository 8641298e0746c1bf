use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::core::errors::{ApiError, FieldErrors};

const SCHEMA_VERSION: i64 = 1;
const MAX_THREAD_ID_LEN: usize = 255;
const DEFAULT_PER_PAGE: i64 = 10;
const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Raw message payload as received over the wire. Role stays a plain string
/// until validation so that bad values produce field errors instead of a
/// deserialization failure.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInput {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatThread {
    pub id: i64,
    pub user_id: Option<i64>,
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub user_id: Option<i64>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPage {
    pub data: Vec<ChatThread>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone)]
pub struct ChatHistoryStore {
    pool: SqlitePool,
}

impl ChatHistoryStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, ApiError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect_options)
            .await
            .map_err(ApiError::internal)?;

        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), ApiError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        if version != SCHEMA_VERSION {
            self.rebuild_schema().await?;
        }

        Ok(())
    }

    async fn rebuild_schema(&self) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        sqlx::query("DROP TABLE IF EXISTS chat_history")
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        sqlx::query(
            "\
            CREATE TABLE chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                thread_id TEXT NOT NULL CHECK(length(thread_id) > 0),
                messages TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query("CREATE UNIQUE INDEX uk_chat_history_thread_id ON chat_history(thread_id)")
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        let pragma = format!("PRAGMA user_version = {}", SCHEMA_VERSION);
        sqlx::query(&pragma)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn create(
        &self,
        user_id: Option<i64>,
        thread_id: Option<String>,
        messages: Option<Vec<MessageInput>>,
    ) -> Result<ChatThread, ApiError> {
        let mut errors = validate_thread_id(thread_id.as_deref());

        let validated = match &messages {
            Some(items) => {
                merge_errors(&mut errors, validate_messages(items));
                convert_messages(items)
            }
            None => {
                push_error(&mut errors, "messages", "messages is required");
                Vec::new()
            }
        };

        if errors.is_empty() {
            let thread_id = thread_id.as_deref().unwrap_or_default();
            if self.thread_id_exists(thread_id).await? {
                push_error(&mut errors, "thread_id", "thread_id has already been taken");
            }
        }

        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }

        let thread_id = thread_id.unwrap_or_default();
        let payload = serde_json::to_string(&validated).map_err(ApiError::internal)?;

        let result = sqlx::query(
            "INSERT INTO chat_history (user_id, thread_id, messages) VALUES (?1, ?2, ?3)",
        )
        .bind(user_id)
        .bind(&thread_id)
        .bind(&payload)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            // Unique-index race between the existence check and the insert.
            Err(err) if is_unique_violation(&err) => {
                return Err(ApiError::validation(
                    "thread_id",
                    "thread_id has already been taken",
                ));
            }
            Err(err) => return Err(ApiError::internal(err)),
        };

        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<ChatThread, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, thread_id, messages, created_at, updated_at
             FROM chat_history WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        row.map(thread_from_row)
            .transpose()?
            .ok_or_else(|| ApiError::NotFound("Chat history not found".to_string()))
    }

    pub async fn get_by_thread_id(&self, thread_id: &str) -> Result<ChatThread, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, thread_id, messages, created_at, updated_at
             FROM chat_history WHERE thread_id = ?1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        row.map(thread_from_row)
            .transpose()?
            .ok_or_else(|| ApiError::NotFound("Chat history not found".to_string()))
    }

    pub async fn list(
        &self,
        filter: ThreadFilter,
        page: i64,
        per_page: i64,
    ) -> Result<ThreadPage, ApiError> {
        let page = page.max(1);
        let per_page = sanitize_per_page(per_page);
        let offset = page.saturating_sub(1).saturating_mul(per_page);

        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM chat_history WHERE 1=1");
        push_filter(&mut count_query, &filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id, thread_id, messages, created_at, updated_at
             FROM chat_history WHERE 1=1",
        );
        push_filter(&mut query, &filter);
        query
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        let data = rows
            .into_iter()
            .map(thread_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ThreadPage {
            data,
            total,
            page,
            per_page,
        })
    }

    /// Replaces the message log wholesale. `None` is a valid no-op update
    /// that only refreshes `updated_at`.
    pub async fn replace_messages(
        &self,
        id: i64,
        messages: Option<Vec<MessageInput>>,
    ) -> Result<ChatThread, ApiError> {
        // Lookup first: an unknown id is 404 even when the payload is bad.
        self.get(id).await?;

        match messages {
            Some(items) => {
                let errors = validate_messages(&items);
                if !errors.is_empty() {
                    return Err(ApiError::Validation(errors));
                }

                let payload =
                    serde_json::to_string(&convert_messages(&items)).map_err(ApiError::internal)?;
                sqlx::query(
                    "UPDATE chat_history
                     SET messages = ?1, updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = ?2",
                )
                .bind(&payload)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(ApiError::internal)?;
            }
            None => {
                sqlx::query(
                    "UPDATE chat_history
                     SET updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = ?1",
                )
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(ApiError::internal)?;
            }
        }

        self.get(id).await
    }

    /// Appends one message with a server-assigned timestamp.
    ///
    /// The append happens inside a single UPDATE via `json_insert`, so two
    /// concurrent appends on the same thread both land; SQLite serializes
    /// the writers.
    pub async fn append_message(
        &self,
        thread_id: &str,
        role: Option<String>,
        content: Option<String>,
    ) -> Result<ChatThread, ApiError> {
        let mut errors = FieldErrors::new();

        let role = match role.as_deref().map(str::trim) {
            None | Some("") => {
                push_error(&mut errors, "role", "role is required");
                None
            }
            Some(raw) => {
                let parsed = MessageRole::parse(raw);
                if parsed.is_none() {
                    push_error(&mut errors, "role", "role must be one of: user, assistant, system");
                }
                parsed
            }
        };

        let content = match content {
            Some(text) if !text.is_empty() => Some(text),
            _ => {
                push_error(&mut errors, "content", "content is required");
                None
            }
        };

        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }

        let (role, content) = match (role, content) {
            (Some(role), Some(content)) => (role, content),
            _ => return Err(ApiError::Internal("message validation left no payload".into())),
        };

        let message = Message {
            role,
            content,
            timestamp: Some(now_iso()),
        };
        let payload = serde_json::to_string(&message).map_err(ApiError::internal)?;

        let result = sqlx::query(
            "UPDATE chat_history
             SET messages = json_insert(messages, '$[#]', json(?1)),
                 updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE thread_id = ?2",
        )
        .bind(&payload)
        .bind(thread_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("Chat history not found".to_string()));
        }

        self.get_by_thread_id(thread_id).await
    }

    pub async fn clear_messages(&self, thread_id: &str) -> Result<(), ApiError> {
        let result = sqlx::query(
            "UPDATE chat_history
             SET messages = '[]', updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE thread_id = ?1",
        )
        .bind(thread_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("Chat history not found".to_string()));
        }

        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), ApiError> {
        let result = sqlx::query("DELETE FROM chat_history WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("Chat history not found".to_string()));
        }

        Ok(())
    }

    async fn thread_id_exists(&self, thread_id: &str) -> Result<bool, ApiError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM chat_history WHERE thread_id = ?1)",
        )
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await
        .map_err(ApiError::internal)
    }
}

fn thread_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ChatThread, ApiError> {
    let raw_messages: String = row.try_get("messages").map_err(ApiError::internal)?;
    let messages: Vec<Message> =
        serde_json::from_str(&raw_messages).map_err(ApiError::internal)?;

    Ok(ChatThread {
        id: row.try_get("id").map_err(ApiError::internal)?,
        user_id: row.try_get("user_id").map_err(ApiError::internal)?,
        thread_id: row.try_get("thread_id").map_err(ApiError::internal)?,
        messages,
        created_at: row.try_get("created_at").map_err(ApiError::internal)?,
        updated_at: row.try_get("updated_at").map_err(ApiError::internal)?,
    })
}

fn push_filter(query: &mut QueryBuilder<Sqlite>, filter: &ThreadFilter) {
    if let Some(user_id) = filter.user_id {
        query.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(thread_id) = &filter.thread_id {
        query.push(" AND thread_id = ").push_bind(thread_id.clone());
    }
}

fn validate_thread_id(thread_id: Option<&str>) -> FieldErrors {
    let mut errors = FieldErrors::new();

    match thread_id.map(str::trim) {
        None | Some("") => push_error(&mut errors, "thread_id", "thread_id is required"),
        Some(value) if value.chars().count() > MAX_THREAD_ID_LEN => push_error(
            &mut errors,
            "thread_id",
            "thread_id must not exceed 255 characters",
        ),
        Some(_) => {}
    }

    errors
}

fn validate_messages(messages: &[MessageInput]) -> FieldErrors {
    let mut errors = FieldErrors::new();

    for (index, message) in messages.iter().enumerate() {
        match message.role.as_deref().map(str::trim) {
            None | Some("") => push_error(
                &mut errors,
                format!("messages.{index}.role"),
                "role is required",
            ),
            Some(raw) if MessageRole::parse(raw).is_none() => push_error(
                &mut errors,
                format!("messages.{index}.role"),
                "role must be one of: user, assistant, system",
            ),
            Some(_) => {}
        }

        match &message.content {
            Some(text) if !text.is_empty() => {}
            _ => push_error(
                &mut errors,
                format!("messages.{index}.content"),
                "content is required",
            ),
        }
    }

    errors
}

/// Only call after `validate_messages` passed; invalid entries are dropped.
fn convert_messages(messages: &[MessageInput]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|input| {
            let role = MessageRole::parse(input.role.as_deref()?.trim())?;
            let content = input.content.clone()?;
            Some(Message {
                role,
                content,
                timestamp: input.timestamp.clone(),
            })
        })
        .collect()
}

fn push_error(errors: &mut FieldErrors, field: impl Into<String>, message: impl Into<String>) {
    errors.entry(field.into()).or_default().push(message.into());
}

fn merge_errors(target: &mut FieldErrors, source: FieldErrors) {
    for (field, messages) in source {
        target.entry(field).or_default().extend(messages);
    }
}

fn sanitize_per_page(per_page: i64) -> i64 {
    if per_page <= 0 {
        return DEFAULT_PER_PAGE;
    }
    per_page.min(MAX_PER_PAGE)
}

pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
