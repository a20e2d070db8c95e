use crate::constants::{ACTIVE_SESSION_KEY, DB_PRAGMAS, SUSPENDED_AT_KEY};
use crate::persistence::ResearchStore;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(DelveError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url).await?;

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(DelveError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("[💾] Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("[💾] Could not verify schema version: {}", e);
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DelveError::internal(format!("Corrupt timestamp '{}': {}", raw, e)).into())
}

fn status_tag(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Complete => "complete",
    }
}

fn parse_status(tag: &str) -> SessionStatus {
    match tag {
        "complete" => SessionStatus::Complete,
        _ => SessionStatus::Active,
    }
}

fn parse_role(tag: &str) -> MessageRole {
    match tag {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

/// [`ResearchStore`] backed by SQLite. Answers are stored as JSON documents.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn set_state(&self, key: &str, value: Option<String>) -> Result<()> {
        match value {
            Some(v) => {
                sqlx::query("INSERT OR REPLACE INTO app_state (key, value) VALUES (?1, ?2)")
                    .bind(key)
                    .bind(v)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM app_state WHERE key = ?1")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn load_messages(&self, session_id: &SessionId) -> Result<Vec<SessionMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, answer_id, created_at FROM session_messages WHERE session_id = ?1 ORDER BY id",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get(0)?;
            let answer_id: Option<String> = row.try_get(2)?;
            let created_at: String = row.try_get(3)?;
            messages.push(SessionMessage {
                role: parse_role(&role),
                content: row.try_get(1)?,
                answer_id: answer_id.map(AnswerId),
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl ResearchStore for SqliteStore {
    async fn save(&self, answer: &Answer) -> Result<()> {
        let document = serde_json::to_string(answer)?;
        sqlx::query(
            "INSERT INTO answers (id, query, document, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET document = excluded.document,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(&answer.id.0)
        .bind(&answer.query)
        .bind(document)
        .bind(timestamp(&answer.created_at))
        .execute(&self.pool)
        .await?;

        tracing::trace!(
            "[💾] Saved answer {} ({} chars, {} sources)",
            answer.id.short(),
            answer.content.len(),
            answer.sources.len()
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Answer>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT document FROM answers ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;

        let mut answers = Vec::with_capacity(rows.len());
        for (document,) in rows {
            match serde_json::from_str::<Answer>(&document) {
                Ok(answer) => answers.push(answer),
                Err(e) => tracing::warn!("[💾] Skipping unreadable answer document: {}", e),
            }
        }
        Ok(answers)
    }

    async fn delete_all(&self) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM answers").execute(&self.pool).await?;
        tracing::debug!("[💾] Deleted {} answers", deleted.rows_affected());
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let metadata = match &session.metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (id, user_id, status, last_activity, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.id.0)
        .bind(&session.user_id.0)
        .bind(status_tag(session.status))
        .bind(timestamp(&session.last_activity))
        .bind(metadata)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM session_messages WHERE session_id = ?1")
            .bind(&session.id.0)
            .execute(&mut *tx)
            .await?;

        for message in &session.messages {
            sqlx::query(
                "INSERT INTO session_messages (session_id, role, content, answer_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&session.id.0)
            .bind(message.role.to_string())
            .bind(&message.content)
            .bind(message.answer_id.as_ref().map(|id| id.0.clone()))
            .bind(timestamp(&message.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_message(&self, session_id: &SessionId, message: &SessionMessage) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE sessions SET last_activity = ?1 WHERE id = ?2")
            .bind(timestamp(&message.created_at))
            .bind(&session_id.0)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DelveError::internal(format!("unknown session {}", session_id)).into());
        }

        sqlx::query(
            "INSERT INTO session_messages (session_id, role, content, answer_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session_id.0)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(message.answer_id.as_ref().map(|id| id.0.clone()))
        .bind(timestamp(&message.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &SessionId,
        metadata: Option<SessionMetadata>,
    ) -> Result<()> {
        let metadata = match metadata {
            Some(m) => Some(serde_json::to_string(&m)?),
            None => None,
        };
        sqlx::query(
            "UPDATE sessions SET status = ?1, last_activity = ?2, metadata = COALESCE(?3, metadata) WHERE id = ?4",
        )
        .bind(status_tag(SessionStatus::Complete))
        .bind(timestamp(&Utc::now()))
        .bind(metadata)
        .bind(&session_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT user_id, status, last_activity, metadata FROM sessions WHERE id = ?1",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let status: String = row.try_get(1)?;
        let last_activity: String = row.try_get(2)?;
        let metadata: Option<String> = row.try_get(3)?;
        let metadata = match metadata {
            Some(raw) => Some(serde_json::from_str::<SessionMetadata>(&raw)?),
            None => None,
        };

        Ok(Some(Session {
            id: session_id.clone(),
            user_id: UserId(row.try_get(0)?),
            messages: self.load_messages(session_id).await?,
            status: parse_status(&status),
            last_activity: parse_timestamp(&last_activity)?,
            metadata,
        }))
    }

    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM sessions WHERE user_id = ?1 ORDER BY last_activity DESC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for (id,) in ids {
            if let Some(session) = self.load_session(&SessionId(id)).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn set_active_session(&self, session_id: Option<&SessionId>) -> Result<()> {
        self.set_state(ACTIVE_SESSION_KEY, session_id.map(|id| id.0.clone()))
            .await
    }

    async fn active_session_id(&self) -> Result<Option<SessionId>> {
        Ok(self.get_state(ACTIVE_SESSION_KEY).await?.map(SessionId))
    }

    async fn record_suspension(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set_state(SUSPENDED_AT_KEY, at.as_ref().map(timestamp))
            .await
    }

    async fn suspension(&self) -> Result<Option<DateTime<Utc>>> {
        match self.get_state(SUSPENDED_AT_KEY).await? {
            Some(raw) => Ok(Some(parse_timestamp(&raw)?)),
            None => Ok(None),
        }
    }
}
