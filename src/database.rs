use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::queue::SubmissionId;
use crate::status::JobState;
use crate::store::{NewSubmission, SubmissionResult, SubmissionStore};

const DATABASE_NAME: &str = "oj-exec.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "oj-exec")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = connect(&db_url, 2).await?;
    log::info!("Initialized database at {}", db_path.as_ref().display());
    Ok(db_pool)
}

/// Opens a private in-memory database, mostly useful for tests
pub async fn init_memory_db() -> sqlx::Result<SqlitePool> {
    // Every connection to `:memory:` is its own database, so keep exactly one
    connect("sqlite::memory:", 1).await
}

async fn connect(db_url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(db_url)
        .await?;

    // Execute PRAGMA statements first (these cannot be run inside a transaction)
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",  // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;", // Balance between safety and performance
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                 INTEGER  PRIMARY KEY AUTOINCREMENT,
            user_id            TEXT     NOT NULL,
            problem_id         INTEGER  NOT NULL,
            code               TEXT     NOT NULL,
            language           TEXT     NOT NULL,
            status             TEXT     NOT NULL,
            runtime            INTEGER,
            memory             INTEGER,
            test_cases_passed  INTEGER  NOT NULL DEFAULT 0,
            total_test_cases   INTEGER  NOT NULL DEFAULT 0,
            error_message      TEXT,
            submitted_at       TEXT     NOT NULL,
            updated_at         TEXT     NOT NULL
        );",
    )
    .execute(&db_pool)
    .await?;

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    // Remove main database file
    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// A submission row as stored on disk
#[derive(Serialize, Debug, Clone, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRow {
    pub id: i64,
    pub user_id: String,
    pub problem_id: i64,
    pub code: String,
    pub language: String,
    pub status: String,
    pub runtime: Option<i64>,
    pub memory: Option<i64>,
    pub test_cases_passed: i64,
    pub total_test_cases: i64,
    pub error_message: Option<String>,
    pub submitted_at: String,
    pub updated_at: String,
}

/// Submission store backed by SQLite
#[derive(Clone)]
pub struct SqliteSubmissionStore {
    pool: SqlitePool,
}

impl SqliteSubmissionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch_submission(&self, id: SubmissionId) -> sqlx::Result<SubmissionRow> {
        sqlx::query_as::<_, SubmissionRow>("SELECT * FROM submissions WHERE id = ?")
            .bind(id as i64)
            .fetch_one(&self.pool)
            .await
    }
}

#[async_trait]
impl SubmissionStore for SqliteSubmissionStore {
    async fn create(&self, submission: &NewSubmission) -> anyhow::Result<SubmissionId> {
        let now = create_timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO submissions (user_id, problem_id, code, language, status, submitted_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&submission.user_id)
        .bind(submission.problem_id as i64)
        .bind(&submission.code)
        .bind(&submission.language)
        .bind(JobState::Queued.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert submission")?;

        let id = result.last_insert_rowid() as SubmissionId;
        log::debug!("Created submission {id} for user {}", submission.user_id);
        Ok(id)
    }

    async fn record_result(
        &self,
        id: SubmissionId,
        result: &SubmissionResult,
    ) -> anyhow::Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE submissions
            SET status = ?, runtime = ?, memory = ?, test_cases_passed = ?,
                total_test_cases = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result.status.as_str())
        .bind(result.runtime.map(|v| v as i64))
        .bind(result.memory.map(|v| v as i64))
        .bind(result.test_cases_passed as i64)
        .bind(result.total_test_cases as i64)
        .bind(&result.error_message)
        .bind(create_timestamp())
        .bind(id as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update submission {id}"))?
        .rows_affected();

        if affected == 0 {
            bail!("Submission {id} not found");
        }
        Ok(())
    }

    async fn discard(&self, id: SubmissionId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM submissions WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete submission {id}"))?;
        Ok(())
    }
}
