//! SQLite-based local state for the federation node (FED-31).
//!
//! The database lives at `~/.impactos/federation.db` and holds everything the
//! node needs to operate: the peer registry, the sharing policy, outbound
//! bundles with their per-peer delivery ledger, inbound signals awaiting merge,
//! division weights, the drift ledger, and the audit trail. Local impact
//! observations land here too so the bundle builder can aggregate them without
//! touching the rest of the platform.

use std::path::PathBuf;

use rusqlite::Connection;

pub mod types;
pub use types::*;

pub struct FederationDb {
    conn: Connection,
}

impl FederationDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so a concurrent writer
    /// surfaces as a busy error here rather than at the first UPDATE.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.impactos/federation.db` and apply
    /// the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Used by background tasks that get
    /// the path from `AppState`, and by tests.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // The receiver and parallel delivery tasks write concurrently; wait
        // briefly for the write lock instead of failing with SQLITE_BUSY.
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        // Run schema migrations
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        // Enable FK constraint enforcement. Set after migrations so future
        // table-recreation migrations can run with enforcement off.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.impactos/federation.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".impactos").join("federation.db"))
    }
}

pub mod audit;
pub mod bundles;
pub mod observations;
pub mod peers;
pub mod policy;
pub mod signals;
pub mod weights;

// =============================================================================
// Shared test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
