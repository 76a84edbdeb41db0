//! Port Daddy persistence layer: one embedded SQLite store shared by the
//! daemon and by CLI clients running in direct-DB mode.
//!
//! The store is opened in WAL mode with foreign keys enforced so several
//! processes can coordinate through the same file (readers never block, one
//! writer at a time). Every timestamp column is UTC milliseconds.

use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};

/// Environment variable naming the database file.
pub const ENV_DB_PATH: &str = "PORT_DADDY_DB";

/// File name used when no override or environment variable is set.
const DEFAULT_DB_FILE: &str = "port-daddy.db";

/// How long a connection waits on a busy writer before giving up.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Current UTC time in milliseconds; the single clock the whole system uses.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Handle to the coordination store. Cheap to clone; all clones share a pool.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    in_memory: bool,
}

impl Database {
    /// Opens the store at the resolved location: explicit override, then
    /// `$PORT_DADDY_DB`, then `port-daddy.db` beside the running binary.
    /// The literal path `:memory:` selects the in-memory store used by tests.
    pub async fn open(override_path: Option<&Path>) -> Result<Self> {
        let path = resolve_db_path(override_path)?;
        if path.as_os_str() == ":memory:" {
            return Self::open_in_memory().await;
        }
        Self::open_file(&path).await
    }

    /// Opens a private in-memory store. The pool is capped at a single
    /// connection because every SQLite `:memory:` connection is its own
    /// database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));
        Self::connect(options, 1, true).await
    }

    /// Opens (or creates) the store at the given file path.
    pub async fn open_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));
        Self::connect(options, 8, false).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32, in_memory: bool) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open SQLite database")?;

        // Embedded migrations; the DDL is IF NOT EXISTS throughout, so
        // replaying it on a populated file preserves existing rows.
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running schema migrations")?;

        Ok(Self { pool, in_memory })
    }

    /// Exposes the underlying pool; components compose their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// True when backed by `:memory:` rather than a file.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Starts a transaction. Callers must not hold it across outbound I/O.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        self.pool.begin().await.context("starting transaction")
    }

    /// Closes the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Resolution order: explicit override, `$PORT_DADDY_DB`, default file next
/// to the daemon binary (falling back to the working directory).
pub fn resolve_db_path(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }
    if let Ok(value) = env::var(ENV_DB_PATH) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let fallback = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(fallback.join(DEFAULT_DB_FILE))
}

/// Detects a UNIQUE constraint violation so callers can turn the race into a
/// domain outcome (duplicate claim, contested lock) instead of a 500.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(code.as_ref(), "2067" | "1555")
            } else {
                db_err.message().contains("UNIQUE")
            }
        }
        _ => false,
    }
}

/// Decodes an opaque metadata blob at the component boundary. The store
/// treats the column as text; invalid JSON round-trips as a JSON string.
pub fn decode_json_opt(raw: Option<String>) -> Option<serde_json::Value> {
    raw.map(|text| {
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    })
}

/// Encodes an opaque metadata value for storage.
pub fn encode_json_opt(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_opens_and_migrates() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.is_in_memory());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn reopening_a_file_store_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");

        {
            let db = Database::open_file(&path).await.unwrap();
            sqlx::query(
                "INSERT INTO services (id, port, status, created_at, last_seen)
                 VALUES ('myapp:api', 3100, 'assigned', 1, 1)",
            )
            .execute(db.pool())
            .await
            .unwrap();
            db.close().await;
        }

        let db = Database::open_file(&path).await.unwrap();
        let port: i64 = sqlx::query_scalar("SELECT port FROM services WHERE id = 'myapp:api'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(port, 3100);
    }

    #[tokio::test]
    async fn assigned_port_uniqueness_is_enforced() {
        let db = Database::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO services (id, port, status, created_at, last_seen)
             VALUES ('a', 4000, 'assigned', 1, 1)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let clash = sqlx::query(
            "INSERT INTO services (id, port, status, created_at, last_seen)
             VALUES ('b', 4000, 'assigned', 1, 1)",
        )
        .execute(db.pool())
        .await;
        assert!(matches!(clash, Err(ref e) if is_unique_violation(e)));

        // A released row may share the port.
        sqlx::query(
            "INSERT INTO services (id, port, status, created_at, last_seen)
             VALUES ('c', 4000, 'released', 1, 1)",
        )
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[test]
    fn resolve_prefers_override_then_env() {
        let resolved = resolve_db_path(Some(Path::new("/tmp/explicit.db"))).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/explicit.db"));

        env::set_var(ENV_DB_PATH, "/tmp/from-env.db");
        let resolved = resolve_db_path(None).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/from-env.db"));
        env::remove_var(ENV_DB_PATH);

        let resolved = resolve_db_path(None).unwrap();
        assert!(resolved.ends_with(DEFAULT_DB_FILE));
    }
}
