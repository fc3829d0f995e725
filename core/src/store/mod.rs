//! Persistent store (C1): sessions, messages, tasks, artifacts, rule-context rows, and
//! settings, behind typed CRUD. Every public method opens a short-lived connection
//! inside `spawn_blocking` and returns before any transaction is held across an await
//! point, following the same shape as the teacher's `SqliteStore` in
//! `memory/sqlite_store.rs`: the struct holds only a `PathBuf`, and each call reopens
//! the file so SQLite's own multi-reader/single-writer discipline (WAL mode) does the
//! rest.

mod migrations;

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("storage: {0}")]
    Storage(String),
}

fn join_err<T>(r: Result<Result<T, StoreError>, tokio::task::JoinError>) -> Result<T, StoreError> {
    r.map_err(|e| StoreError::Storage(format!("blocking task panicked: {e}")))?
}

pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(StoreError::Validation(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            other => Err(StoreError::Validation(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    ProjectIdea,
    TechStack,
    SubmissionSummary,
}

impl ArtifactType {
    fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::ProjectIdea => "project_idea",
            ArtifactType::TechStack => "tech_stack",
            ArtifactType::SubmissionSummary => "submission_summary",
        }
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_idea" => Ok(ArtifactType::ProjectIdea),
            "tech_stack" => Ok(ArtifactType::TechStack),
            "submission_summary" => Ok(ArtifactType::SubmissionSummary),
            other => Err(StoreError::Validation(format!("unknown artifact_type: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleContextSource {
    Initial,
    File,
    Text,
    Url,
}

impl RuleContextSource {
    fn as_str(&self) -> &'static str {
        match self {
            RuleContextSource::Initial => "initial",
            RuleContextSource::File => "file",
            RuleContextSource::Text => "text",
            RuleContextSource::Url => "url",
        }
    }
}

impl std::str::FromStr for RuleContextSource {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(RuleContextSource::Initial),
            "file" => Ok(RuleContextSource::File),
            "text" => Ok(RuleContextSource::Text),
            "url" => Ok(RuleContextSource::Url),
            other => Err(StoreError::Validation(format!("unknown source: {other}"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub session_id: Option<String>,
    pub item: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub session_id: String,
    pub artifact_type: ArtifactType,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleContextRow {
    pub id: i64,
    pub session_id: Option<String>,
    pub source: RuleContextSource,
    pub filename: Option<String>,
    pub content: String,
    pub active: bool,
    pub created_at: String,
}

/// SQLite-backed store. Holds only the DB path; every operation opens its own
/// connection inside `spawn_blocking`.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, applies pending migrations,
    /// and returns a handle. Migration failure is returned to the caller, who (per
    /// spec.md §6) should treat it as fatal at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
        }
        let mut conn = Connection::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        migrations::apply_migrations(&mut conn)?;
        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    fn open_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn)
    }

    // ---- Session ----------------------------------------------------------------

    pub async fn upsert_session(&self, id: &str, title: Option<String>) -> Result<Session, StoreError> {
        let db_path = self.db_path.clone();
        let id = id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let existing: Option<(Option<String>, String)> = conn
                    .query_row(
                        "SELECT title, created_at FROM sessions WHERE id = ?1",
                        [&id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                match existing {
                    Some((existing_title, created_at)) => {
                        let new_title = title.or(existing_title);
                        conn.execute(
                            "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                            params![new_title, now, id],
                        )
                        .map_err(|e| StoreError::Storage(e.to_string()))?;
                        Ok(Session {
                            id,
                            title: new_title,
                            created_at,
                            updated_at: now,
                        })
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                            params![id, title, now],
                        )
                        .map_err(|e| StoreError::Storage(e.to_string()))?;
                        Ok(Session {
                            id,
                            title,
                            created_at: now.clone(),
                            updated_at: now,
                        })
                    }
                }
            })
            .await,
        )
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let db_path = self.db_path.clone();
        let id = id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.query_row(
                    "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?1",
                    [&id],
                    |row| {
                        Ok(Session {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            created_at: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
            })
            .await,
        )
    }

    /// Deletes a session and everything scoped to it (messages, tasks, artifacts,
    /// rule-context rows).
    pub async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let id = id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let mut conn =
                    Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let tx = conn.transaction().map_err(|e| StoreError::Storage(e.to_string()))?;
                for sql in [
                    "DELETE FROM messages WHERE session_id = ?1",
                    "DELETE FROM tasks WHERE session_id = ?1",
                    "DELETE FROM artifacts WHERE session_id = ?1",
                    "DELETE FROM rule_context_rows WHERE session_id = ?1",
                    "DELETE FROM sessions WHERE id = ?1",
                ] {
                    tx.execute(sql, [&id]).map_err(|e| StoreError::Storage(e.to_string()))?;
                }
                tx.commit().map_err(|e| StoreError::Storage(e.to_string()))
            })
            .await,
        )
    }

    // ---- Message -----------------------------------------------------------------

    /// Appends a message, creating the session first if it doesn't exist yet.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Message, StoreError> {
        self.upsert_session(session_id, None).await?;
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let content = content.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                let metadata_text = metadata.as_ref().map(|v| v.to_string());
                conn.execute(
                    "INSERT INTO messages (session_id, role, content, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![session_id, role.as_str(), content, metadata_text, now],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                let id = conn.last_insert_rowid();
                conn.execute(
                    "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                    params![now, session_id],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                Ok(Message {
                    id,
                    session_id,
                    role,
                    content,
                    metadata,
                    created_at: now,
                })
            })
            .await,
        )
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let limit = limit.unwrap_or(i64::MAX);
                let offset = offset.unwrap_or(0);
                let mut stmt = conn
                    .prepare(
                        "SELECT id, session_id, role, content, metadata, created_at FROM messages \
                         WHERE session_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let rows = stmt
                    .query_map(params![session_id, limit, offset], |row| {
                        let role_str: String = row.get(2)?;
                        let metadata_text: Option<String> = row.get(4)?;
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, role_str, row.get::<_, String>(3)?, metadata_text, row.get::<_, String>(5)?))
                    })
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, session_id, role_str, content, metadata_text, created_at) =
                        row.map_err(|e| StoreError::Storage(e.to_string()))?;
                    let role: Role = role_str.parse()?;
                    let metadata = metadata_text
                        .map(|t| serde_json::from_str(&t))
                        .transpose()
                        .map_err(|e| StoreError::Storage(e.to_string()))?;
                    out.push(Message {
                        id,
                        session_id,
                        role,
                        content,
                        metadata,
                        created_at,
                    });
                }
                Ok(out)
            })
            .await,
        )
    }

    // ---- Task ----------------------------------------------------------------------

    pub async fn add_task(
        &self,
        session_id: Option<String>,
        item: &str,
        priority: i64,
    ) -> Result<Task, StoreError> {
        let db_path = self.db_path.clone();
        let item = item.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                let next_sort: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM tasks WHERE session_id IS ?1",
                        [&session_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.execute(
                    "INSERT INTO tasks (session_id, item, status, priority, sort_order, created_at, updated_at, completed_at) \
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5, NULL)",
                    params![session_id, item, priority, next_sort, now],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                let id = conn.last_insert_rowid();
                Ok(Task {
                    id,
                    session_id,
                    item,
                    status: TaskStatus::Pending,
                    priority,
                    sort_order: next_sort,
                    created_at: now.clone(),
                    updated_at: now,
                    completed_at: None,
                })
            })
            .await,
        )
    }

    pub async fn list_tasks(&self, session_id: Option<String>) -> Result<Vec<Task>, StoreError> {
        let db_path = self.db_path.clone();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id, session_id, item, status, priority, sort_order, created_at, updated_at, completed_at \
                         FROM tasks WHERE session_id IS ?1 ORDER BY sort_order ASC",
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let rows = stmt
                    .query_map([&session_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, Option<String>>(8)?,
                        ))
                    })
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, session_id, item, status_str, priority, sort_order, created_at, updated_at, completed_at) =
                        row.map_err(|e| StoreError::Storage(e.to_string()))?;
                    out.push(Task {
                        id,
                        session_id,
                        item,
                        status: status_str.parse()?,
                        priority,
                        sort_order,
                        created_at,
                        updated_at,
                        completed_at,
                    });
                }
                Ok(out)
            })
            .await,
        )
    }

    pub async fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<Task, StoreError> {
        let db_path = self.db_path.clone();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                let completed_at = if status == TaskStatus::Done { Some(now.clone()) } else { None };
                let updated = conn
                    .execute(
                        "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = ?3 WHERE id = ?4",
                        params![status.as_str(), now, completed_at, id],
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("task {id}")));
                }
                conn.query_row(
                    "SELECT id, session_id, item, status, priority, sort_order, created_at, updated_at, completed_at \
                     FROM tasks WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Task {
                            id: row.get(0)?,
                            session_id: row.get(1)?,
                            item: row.get(2)?,
                            status: TaskStatus::Pending, // overwritten below
                            priority: row.get(4)?,
                            sort_order: row.get(5)?,
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                            completed_at: row.get(8)?,
                        })
                    },
                )
                .map(|mut t| {
                    t.status = status;
                    t
                })
                .map_err(|e| StoreError::Storage(e.to_string()))
            })
            .await,
        )
    }

    /// Clears all tasks scoped to `session_id`. Per spec.md §4.4, "clear all" is only
    /// ever invoked with an explicit session id — there is no global clear.
    pub async fn clear_tasks(&self, session_id: &str) -> Result<u64, StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let n = conn
                    .execute("DELETE FROM tasks WHERE session_id = ?1", [&session_id])
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                Ok(n as u64)
            })
            .await,
        )
    }

    // ---- Artifact --------------------------------------------------------------

    pub async fn put_artifact(
        &self,
        session_id: &str,
        artifact_type: ArtifactType,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Artifact, StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        let content = content.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                let metadata_text = metadata.as_ref().map(|v| v.to_string());
                conn.execute(
                    "INSERT INTO artifacts (session_id, artifact_type, content, metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                     ON CONFLICT(session_id, artifact_type) DO UPDATE SET \
                        content = excluded.content, metadata = excluded.metadata, updated_at = excluded.updated_at",
                    params![session_id, artifact_type.as_str(), content, metadata_text, now],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.query_row(
                    "SELECT id, created_at FROM artifacts WHERE session_id = ?1 AND artifact_type = ?2",
                    params![session_id, artifact_type.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .map(|(id, created_at)| Artifact {
                    id,
                    session_id,
                    artifact_type,
                    content,
                    metadata,
                    created_at,
                    updated_at: now,
                })
                .map_err(|e| StoreError::Storage(e.to_string()))
            })
            .await,
        )
    }

    pub async fn get_artifact(
        &self,
        session_id: &str,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>, StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.query_row(
                    "SELECT id, content, metadata, created_at, updated_at FROM artifacts \
                     WHERE session_id = ?1 AND artifact_type = ?2",
                    params![session_id, artifact_type.as_str()],
                    |row| {
                        let metadata_text: Option<String> = row.get(2)?;
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            metadata_text,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .map(|(id, content, metadata_text, created_at, updated_at)| {
                    let metadata = metadata_text
                        .map(|t| serde_json::from_str(&t))
                        .transpose()
                        .map_err(|e| StoreError::Storage(e.to_string()))?;
                    Ok(Artifact {
                        id,
                        session_id,
                        artifact_type,
                        content,
                        metadata,
                        created_at,
                        updated_at,
                    })
                })
                .transpose()
            })
            .await,
        )
    }

    pub async fn list_artifacts(&self, session_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id, artifact_type, content, metadata, created_at, updated_at FROM artifacts \
                         WHERE session_id = ?1 ORDER BY artifact_type ASC",
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let rows = stmt
                    .query_map([&session_id], |row| {
                        let metadata_text: Option<String> = row.get(3)?;
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            metadata_text,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, type_str, content, metadata_text, created_at, updated_at) =
                        row.map_err(|e| StoreError::Storage(e.to_string()))?;
                    let metadata = metadata_text
                        .map(|t| serde_json::from_str(&t))
                        .transpose()
                        .map_err(|e| StoreError::Storage(e.to_string()))?;
                    out.push(Artifact {
                        id,
                        session_id: session_id.clone(),
                        artifact_type: type_str.parse()?,
                        content,
                        metadata,
                        created_at,
                        updated_at,
                    });
                }
                Ok(out)
            })
            .await,
        )
    }

    // ---- RuleContext -----------------------------------------------------------

    pub async fn insert_rule_context(
        &self,
        session_id: Option<String>,
        source: RuleContextSource,
        content: &str,
        filename: Option<String>,
    ) -> Result<RuleContextRow, StoreError> {
        let db_path = self.db_path.clone();
        let content = content.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let now = now_iso();
                conn.execute(
                    "INSERT INTO rule_context_rows (session_id, source, filename, content, active, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![session_id, source.as_str(), filename, content, now],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                let id = conn.last_insert_rowid();
                Ok(RuleContextRow {
                    id,
                    session_id,
                    source,
                    filename,
                    content,
                    active: true,
                    created_at: now,
                })
            })
            .await,
        )
    }

    /// Lists active rule-context rows for `session_id`. Per spec.md §9 Open Questions,
    /// rows with `session_id = NULL` are a shared/global pool used only when no
    /// session id is supplied; once a session id is given, only that session's rows
    /// are returned (null-session rows are not folded in).
    pub async fn list_active_rule_context(
        &self,
        session_id: Option<String>,
    ) -> Result<Vec<RuleContextRow>, StoreError> {
        let db_path = self.db_path.clone();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id, session_id, source, filename, content, created_at FROM rule_context_rows \
                         WHERE session_id IS ?1 AND active = 1 ORDER BY id ASC",
                    )
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let rows = stmt
                    .query_map([&session_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, session_id, source_str, filename, content, created_at) =
                        row.map_err(|e| StoreError::Storage(e.to_string()))?;
                    out.push(RuleContextRow {
                        id,
                        session_id,
                        source: source_str.parse()?,
                        filename,
                        content,
                        active: true,
                        created_at,
                    });
                }
                Ok(out)
            })
            .await,
        )
    }

    pub async fn deactivate_rule_context(&self, id: i64) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                let n = conn
                    .execute("UPDATE rule_context_rows SET active = 0 WHERE id = ?1", [id])
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                if n == 0 {
                    return Err(StoreError::NotFound(format!("rule context row {id}")));
                }
                Ok(())
            })
            .await,
        )
    }

    // ---- AppSetting --------------------------------------------------------------

    pub async fn setting_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.query_row("SELECT value FROM app_settings WHERE key = ?1", [&key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| StoreError::Storage(e.to_string()))
            })
            .await,
        )
    }

    pub async fn setting_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        let value = value.to_string();
        join_err(
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path).map_err(|e| StoreError::Storage(e.to_string()))?;
                conn.execute(
                    "INSERT INTO app_settings (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
                Ok(())
            })
            .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("app.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn upsert_session_creates_then_preserves_created_at() {
        let (_dir, store) = temp_store();
        let s1 = store.upsert_session("s1", Some("first".into())).await.unwrap();
        assert_eq!(s1.title.as_deref(), Some("first"));
        let s2 = store.upsert_session("s1", None).await.unwrap();
        assert_eq!(s2.created_at, s1.created_at);
        assert_eq!(s2.title.as_deref(), Some("first"), "missing title keeps existing");
    }

    #[tokio::test]
    async fn append_message_creates_session_on_first_write() {
        let (_dir, store) = temp_store();
        let msg = store
            .append_message("new-session", Role::User, "hello", None)
            .await
            .unwrap();
        assert_eq!(msg.session_id, "new-session");
        let session = store.get_session("new-session").await.unwrap();
        assert_eq!(session.id, "new-session");
    }

    #[tokio::test]
    async fn list_messages_ordered_by_created_at_then_id() {
        let (_dir, store) = temp_store();
        store.append_message("s", Role::User, "one", None).await.unwrap();
        store.append_message("s", Role::Assistant, "two", None).await.unwrap();
        let msgs = store.list_messages("s", None, None).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].content, "two");
    }

    #[tokio::test]
    async fn task_lifecycle_status_and_clear() {
        let (_dir, store) = temp_store();
        let t1 = store.add_task(Some("s".into()), "design schema", 3).await.unwrap();
        assert_eq!(t1.status, TaskStatus::Pending);
        let done = store.set_task_status(t1.id, TaskStatus::Done).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.completed_at.is_some());
        let cleared = store.clear_tasks("s").await.unwrap();
        assert_eq!(cleared, 1);
        let remaining = store.list_tasks(Some("s".into())).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn clear_tasks_is_scoped_to_session() {
        let (_dir, store) = temp_store();
        store.add_task(Some("a".into()), "task a", 3).await.unwrap();
        store.add_task(Some("b".into()), "task b", 3).await.unwrap();
        store.clear_tasks("a").await.unwrap();
        assert!(store.list_tasks(Some("a".into())).await.unwrap().is_empty());
        assert_eq!(store.list_tasks(Some("b".into())).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn artifact_put_is_upsert_per_session_and_type() {
        let (_dir, store) = temp_store();
        store
            .put_artifact("s", ArtifactType::ProjectIdea, "v1", None)
            .await
            .unwrap();
        let a2 = store
            .put_artifact("s", ArtifactType::ProjectIdea, "v2", None)
            .await
            .unwrap();
        assert_eq!(a2.content, "v2");
        let all = store.list_artifacts("s").await.unwrap();
        assert_eq!(all.len(), 1, "upsert must not create a second row");
    }

    #[tokio::test]
    async fn rule_context_session_scoping_ignores_null_session_rows() {
        let (_dir, store) = temp_store();
        store
            .insert_rule_context(None, RuleContextSource::Initial, "global", None)
            .await
            .unwrap();
        store
            .insert_rule_context(Some("s".into()), RuleContextSource::Text, "scoped", None)
            .await
            .unwrap();
        let rows = store.list_active_rule_context(Some("s".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "scoped");
    }

    #[tokio::test]
    async fn deactivate_rule_context_removes_from_active_list() {
        let (_dir, store) = temp_store();
        let row = store
            .insert_rule_context(Some("s".into()), RuleContextSource::Text, "text", None)
            .await
            .unwrap();
        store.deactivate_rule_context(row.id).await.unwrap();
        let rows = store.list_active_rule_context(Some("s".into())).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn setting_get_put_roundtrip() {
        let (_dir, store) = temp_store();
        assert!(store.setting_get("model_id").await.unwrap().is_none());
        store.setting_put("model_id", "llama3").await.unwrap();
        assert_eq!(store.setting_get("model_id").await.unwrap().as_deref(), Some("llama3"));
        store.setting_put("model_id", "mistral").await.unwrap();
        assert_eq!(store.setting_get("model_id").await.unwrap().as_deref(), Some("mistral"));
    }

    #[tokio::test]
    async fn delete_session_cascades() {
        let (_dir, store) = temp_store();
        store.append_message("s", Role::User, "hi", None).await.unwrap();
        store.add_task(Some("s".into()), "t", 1).await.unwrap();
        store
            .put_artifact("s", ArtifactType::ProjectIdea, "c", None)
            .await
            .unwrap();
        store
            .insert_rule_context(Some("s".into()), RuleContextSource::Text, "c", None)
            .await
            .unwrap();

        store.delete_session("s").await.unwrap();

        assert!(store.get_session("s").await.is_err());
        assert!(store.list_messages("s", None, None).await.unwrap().is_empty());
        assert!(store.list_tasks(Some("s".into())).await.unwrap().is_empty());
        assert!(store.list_artifacts("s").await.unwrap().is_empty());
        assert!(store.list_active_rule_context(Some("s".into())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_scoping_never_leaks_across_sessions() {
        let (_dir, store) = temp_store();
        store.add_task(Some("a".into()), "only a", 1).await.unwrap();
        store
            .insert_rule_context(Some("a".into()), RuleContextSource::Text, "only a", None)
            .await
            .unwrap();
        let b_tasks = store.list_tasks(Some("b".into())).await.unwrap();
        let b_rows = store.list_active_rule_context(Some("b".into())).await.unwrap();
        assert!(b_tasks.is_empty());
        assert!(b_rows.is_empty());
    }
}
