//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::Database;

/// Versioned schema steps, applied in order; each runs in its own transaction
const MIGRATIONS: &[(i64, &str, &[&str])] = &[(
    1,
    "jobs and tasks",
    &[
        r#"
        CREATE TABLE download_job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL DEFAULT '',
            source_name TEXT,
            storage_path TEXT NOT NULL,
            filename_template TEXT NOT NULL DEFAULT '{artist} - {title}',
            target_quality TEXT NOT NULL DEFAULT 'lossless',
            embed_cover INTEGER NOT NULL DEFAULT 1,
            embed_lyrics INTEGER NOT NULL DEFAULT 1,
            embed_metadata INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'created',
            enabled INTEGER NOT NULL DEFAULT 1,
            total_tasks INTEGER NOT NULL DEFAULT 0,
            completed_tasks INTEGER NOT NULL DEFAULT 0,
            failed_tasks INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
        "CREATE INDEX idx_job_source ON download_job(source_type, source_id)",
        r#"
        CREATE TABLE download_task (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL REFERENCES download_job(id) ON DELETE CASCADE,
            music_id TEXT NOT NULL,
            music_title TEXT,
            music_artist TEXT,
            music_album TEXT,
            quality TEXT NOT NULL,
            progress_flags INTEGER NOT NULL DEFAULT 0,
            file_path TEXT,
            file_name TEXT,
            file_format TEXT,
            file_size INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            note TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            UNIQUE(job_id, music_id)
        )
        "#,
        "CREATE INDEX idx_task_status ON download_task(status)",
        "CREATE INDEX idx_task_music ON download_task(music_id, status)",
    ],
)];

fn connection_failed(context: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::ConnectionFailed(format!("{}: {}", context, e)))
}

fn migration_failed(version: i64, context: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| {
        Error::Database(DatabaseError::MigrationFailed(format!(
            "v{} {}: {}",
            version, context, e
        )))
    }
}

impl Database {
    /// Open (creating if missing) the database at `path` and bring its schema up to date
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "cannot create database directory {}: {}",
                    parent.display(),
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(connection_failed("invalid database path"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(connection_failed("cannot open database"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Highest applied schema version (0 for a fresh file)
    pub async fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(DatabaseError::QueryFailed(e.to_string())))?;
        Ok(version.unwrap_or(0))
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(connection_failed("cannot acquire connection"))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed(0, "schema_version table"))?;

        let current = self.schema_version().await?;
        for &(version, name, statements) in MIGRATIONS.iter().filter(|(v, ..)| *v > current) {
            tracing::info!(version, name, "applying database migration");
            apply(&mut conn, version, statements).await?;
        }
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply(conn: &mut SqliteConnection, version: i64, statements: &[&str]) -> Result<()> {
    sqlx::query("BEGIN")
        .execute(&mut *conn)
        .await
        .map_err(migration_failed(version, "begin"))?;

    let result = async {
        for sql in statements {
            sqlx::query(sql)
                .execute(&mut *conn)
                .await
                .map_err(migration_failed(version, "statement"))?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(migration_failed(version, "record"))?;
        Ok::<(), Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(migration_failed(version, "commit"))?;
            Ok(())
        }
        Err(e) => {
            // Best effort; the original error is what matters
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            Err(e)
        }
    }
}
