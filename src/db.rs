//! SQLite database holding inbound records
//!
//! This module owns the connection and the schema. Queries live next to the
//! components that issue them (`inbound`, `traffic`, `quota`).

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Lock the connection for a sequence of statements
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Current schema version recorded in the database
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock();
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        // Create migrations table if it doesn't exist
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: inbounds table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: inbounds");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS inbounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                up INTEGER NOT NULL DEFAULT 0,
                down INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                remark TEXT NOT NULL DEFAULT '',
                enable INTEGER NOT NULL DEFAULT 1,
                expiry_time INTEGER NOT NULL DEFAULT 0,
                listen TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL UNIQUE,
                protocol TEXT NOT NULL DEFAULT '',
                settings TEXT NOT NULL DEFAULT '',
                stream_settings TEXT NOT NULL DEFAULT '',
                sniffing TEXT NOT NULL DEFAULT '',
                tag TEXT NOT NULL DEFAULT ''
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: lookup indexes
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: inbound indexes");

        conn.execute_batch(r#"
            -- Traffic reports are matched by tag, listings by owner
            CREATE INDEX IF NOT EXISTS idx_inbounds_tag ON inbounds(tag);
            CREATE INDEX IF NOT EXISTS idx_inbounds_user ON inbounds(user_id);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }
}
