// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::CoreError;
use crate::ids::EntityKey;
use crate::migrations::SQLITE as MIGRATOR;
use crate::types::{InvocationStatus, Outcome};

use super::{
    AppendOutcome, CallbackRecord, InvocationRecord, JournalAppend, JournalRecord, NewInvocation,
    Persistence, StateMutation, StateRecord,
};

const INVOCATION_COLUMNS: &str = r#"
    seq, invocation_id, service, handler, entity_key, kind, input, status, attempt, failures,
    cancel_requested, run_at, parent_invocation_id, created_at, started_at, finished_at,
    output, error_code, error_message, last_failure
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, enables
    /// WAL with `synchronous = FULL` so an acknowledged write survives a
    /// crash, and runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/keel.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrated(pool).await
    }

    /// Connect using a `sqlite:` URL. `sqlite::memory:` yields a private
    /// in-memory database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL '{}': {}", url, e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at '{}': {}", url, e),
            })?;

        Self::migrated(pool).await
    }

    /// Fresh in-memory database on a single, never-recycled connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, CoreError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

/// Insert a journal row on `conn`, resolving a duplicate index by content.
async fn append_on(
    conn: &mut SqliteConnection,
    entry: JournalAppend<'_>,
) -> Result<AppendOutcome, CoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO journal (invocation_id, entry_index, kind, payload, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (invocation_id, entry_index) DO NOTHING
        "#,
    )
    .bind(entry.invocation_id)
    .bind(i64::from(entry.index))
    .bind(entry.kind)
    .bind(entry.payload)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() > 0 {
        return Ok(AppendOutcome::Appended);
    }

    let existing: String = sqlx::query_scalar(
        r#"
        SELECT payload FROM journal
        WHERE invocation_id = ? AND entry_index = ?
        "#,
    )
    .bind(entry.invocation_id)
    .bind(i64::from(entry.index))
    .fetch_one(&mut *conn)
    .await?;

    if existing == entry.payload {
        Ok(AppendOutcome::AlreadyPresent)
    } else {
        Err(CoreError::JournalConflict {
            invocation_id: entry.invocation_id.to_string(),
            index: entry.index,
        })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_invocation(&self, invocation: &NewInvocation) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO invocations
                (invocation_id, service, handler, entity_key, kind, input, status,
                 run_at, parent_invocation_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(invocation.invocation_id.as_str())
        .bind(&invocation.entity.service)
        .bind(&invocation.handler)
        .bind(&invocation.entity.key)
        .bind(invocation.kind.as_str())
        .bind(&invocation.input)
        .bind(invocation.run_at)
        .bind(invocation.parent.as_ref().map(|p| p.as_str()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError> {
        let record = sqlx::query_as::<_, InvocationRecord>(&format!(
            "SELECT {} FROM invocations WHERE invocation_id = ?",
            INVOCATION_COLUMNS
        ))
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_workflow_run(
        &self,
        service: &str,
        workflow_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError> {
        let record = sqlx::query_as::<_, InvocationRecord>(&format!(
            "SELECT {} FROM invocations WHERE service = ? AND entity_key = ? AND kind = 'workflow'",
            INVOCATION_COLUMNS
        ))
        .bind(service)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_invocation_status(
        &self,
        invocation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET status = ?,
                started_at = CASE WHEN ? = 'running' AND started_at IS NULL THEN ? ELSE started_at END
            WHERE invocation_id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(now)
        .bind(invocation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM invocations WHERE invocation_id = ?")
                    .bind(invocation_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match actual {
                Some(actual) => CoreError::InvalidInvocationState {
                    invocation_id: invocation_id.to_string(),
                    expected: "pending, running or suspended".to_string(),
                    actual,
                },
                None => CoreError::InvocationNotFound {
                    invocation_id: invocation_id.to_string(),
                },
            });
        }

        Ok(())
    }

    async fn record_attempt(&self, invocation_id: &str, attempt: u32) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE invocations
            SET attempt = ?
            WHERE invocation_id = ?
            "#,
        )
        .bind(i64::from(attempt))
        .bind(invocation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_failure(&self, invocation_id: &str, message: &str) -> Result<u32, CoreError> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE invocations
            SET failures = failures + 1, last_failure = ?
            WHERE invocation_id = ?
            RETURNING failures
            "#,
        )
        .bind(message)
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await?;

        let failures = failures.ok_or_else(|| CoreError::InvocationNotFound {
            invocation_id: invocation_id.to_string(),
        })?;
        Ok(u32::try_from(failures).unwrap_or(u32::MAX))
    }

    async fn complete_invocation(
        &self,
        invocation_id: &str,
        outcome: &Outcome,
    ) -> Result<bool, CoreError> {
        let (status, output, code, message) = match outcome {
            Outcome::Success(bytes) => (InvocationStatus::Completed, Some(bytes.as_slice()), None, None),
            Outcome::Failure(err) => (
                InvocationStatus::Failed,
                None,
                Some(i64::from(err.code)),
                Some(err.message.as_str()),
            ),
        };

        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET status = ?, output = ?, error_code = ?, error_message = ?, finished_at = ?
            WHERE invocation_id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(output)
        .bind(code)
        .bind(message)
        .bind(Utc::now())
        .bind(invocation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_cancellation(&self, invocation_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE invocations
            SET cancel_requested = 1
            WHERE invocation_id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(invocation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unfinished_invocations(&self) -> Result<Vec<InvocationRecord>, CoreError> {
        let records = sqlx::query_as::<_, InvocationRecord>(&format!(
            "SELECT {} FROM invocations WHERE status NOT IN ('completed', 'failed') ORDER BY seq",
            INVOCATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn append_journal_entry(
        &self,
        entry: JournalAppend<'_>,
    ) -> Result<AppendOutcome, CoreError> {
        let mut conn = self.pool.acquire().await?;
        append_on(&mut conn, entry).await
    }

    async fn append_state_write(
        &self,
        entry: JournalAppend<'_>,
        mutation: StateMutation<'_>,
    ) -> Result<AppendOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        let outcome = append_on(&mut tx, entry).await?;
        if outcome == AppendOutcome::Appended {
            match mutation.value {
                Some(value) => {
                    sqlx::query(
                        r#"
                        INSERT INTO entity_state (service, entity_key, slot, value, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT (service, entity_key, slot)
                        DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&mutation.entity.service)
                    .bind(&mutation.entity.key)
                    .bind(mutation.slot)
                    .bind(value)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        r#"
                        DELETE FROM entity_state
                        WHERE service = ? AND entity_key = ? AND slot = ?
                        "#,
                    )
                    .bind(&mutation.entity.service)
                    .bind(&mutation.entity.key)
                    .bind(mutation.slot)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn read_journal(&self, invocation_id: &str) -> Result<Vec<JournalRecord>, CoreError> {
        let records = sqlx::query_as::<_, JournalRecord>(
            r#"
            SELECT invocation_id, entry_index, kind, payload, created_at
            FROM journal
            WHERE invocation_id = ?
            ORDER BY entry_index
            "#,
        )
        .bind(invocation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_state(
        &self,
        entity: &EntityKey,
        slot: &str,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT value FROM entity_state
            WHERE service = ? AND entity_key = ? AND slot = ?
            "#,
        )
        .bind(&entity.service)
        .bind(&entity.key)
        .bind(slot)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set_state(
        &self,
        entity: &EntityKey,
        slot: &str,
        value: &[u8],
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO entity_state (service, entity_key, slot, value, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (service, entity_key, slot)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(&entity.service)
        .bind(&entity.key)
        .bind(slot)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_state(&self, entity: &EntityKey, slot: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM entity_state
            WHERE service = ? AND entity_key = ? AND slot = ?
            "#,
        )
        .bind(&entity.service)
        .bind(&entity.key)
        .bind(slot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_state(&self, entity: &EntityKey) -> Result<Vec<StateRecord>, CoreError> {
        let records = sqlx::query_as::<_, StateRecord>(
            r#"
            SELECT slot, value, updated_at
            FROM entity_state
            WHERE service = ? AND entity_key = ?
            ORDER BY slot
            "#,
        )
        .bind(&entity.service)
        .bind(&entity.key)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_callback(
        &self,
        callback_id: &str,
        invocation_id: &str,
        entry_index: u32,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO callbacks (callback_id, invocation_id, entry_index, created_at, deadline)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (callback_id) DO NOTHING
            "#,
        )
        .bind(callback_id)
        .bind(invocation_id)
        .bind(i64::from(entry_index))
        .bind(Utc::now())
        .bind(deadline)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_callback(&self, callback_id: &str) -> Result<Option<CallbackRecord>, CoreError> {
        let record = sqlx::query_as::<_, CallbackRecord>(
            r#"
            SELECT callback_id, invocation_id, entry_index, created_at, deadline,
                   completed_at, outcome
            FROM callbacks
            WHERE callback_id = ?
            "#,
        )
        .bind(callback_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn complete_callback(
        &self,
        callback_id: &str,
        outcome_json: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE callbacks
            SET outcome = ?, completed_at = ?
            WHERE callback_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(outcome_json)
        .bind(Utc::now())
        .bind(callback_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_callback_deadline(
        &self,
        callback_id: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE callbacks
            SET deadline = ?
            WHERE callback_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(deadline)
        .bind(callback_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
