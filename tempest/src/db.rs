//! # Note on database migrations
//!
//! The `user_version` field in the SQLite header tracks the schema version.
//! It starts at `0`, meaning no tables exist yet, and is incremented every
//! time a migration is applied. Migrations are named after their version
//! numbers, so the first migration is `1.sql`, the second `2.sql`, etc.
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::{fmt, time};

use sqlite as sql;
use thiserror::Error;

/// How long to wait for the database lock to be released before failing.
const DB_TIMEOUT: time::Duration = time::Duration::from_secs(6);

/// Database migrations.
/// The first migration is the creation of the initial tables.
const MIGRATIONS: &[&str] = &[include_str!("db/migrations/1.sql")];

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// No rows returned in query result.
    #[error("no rows returned")]
    NoRows,
}

/// A file-backed database storing the node's durable state: waiting channel
/// proofs and in-flight retributions.
#[derive(Clone)]
pub struct Database {
    pub db: Arc<sql::ConnectionThreadSafe>,
}

impl Deref for Database {
    type Target = sql::ConnectionThreadSafe;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish()
    }
}

impl Database {
    /// Open a database at the given path. Creates a new database if it
    /// doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe(path)?;
        db.set_busy_timeout(DB_TIMEOUT.as_millis() as usize)?;
        migrate(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new in-memory database.
    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open_thread_safe(":memory:")?;
        migrate(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get the database version. This is updated on schema changes.
    pub fn version(&self) -> Result<usize, Error> {
        version(&self.db)
    }
}

/// Run a query within a transaction, rolling back on error.
pub fn transaction<T, E: From<sql::Error>>(
    db: &sql::Connection,
    query: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    db.execute("BEGIN")?;

    match query(db) {
        Ok(result) => {
            db.execute("COMMIT")?;
            Ok(result)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}

/// Get the `user_version` value from the database header.
pub fn version(db: &sql::Connection) -> Result<usize, Error> {
    let version = db
        .prepare("PRAGMA user_version")?
        .into_iter()
        .next()
        .ok_or(Error::NoRows)??
        .read::<i64, _>(0);

    Ok(version as usize)
}

/// Bump the `user_version` value.
fn bump(db: &sql::Connection) -> Result<usize, Error> {
    let new = version(db)? + 1;
    db.execute(format!("PRAGMA user_version = {new}"))?;

    Ok(new)
}

/// Migrate the database to the latest schema.
pub fn migrate(db: &sql::Connection) -> Result<usize, Error> {
    let mut version = version(db)?;
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        if i >= version {
            log::debug!(target: "db", "Migrating database to version {}..", i + 1);

            transaction(db, |db| {
                db.execute(migration)?;
                version = bump(db)?;

                Ok::<_, Error>(())
            })?;
        }
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations() {
        let db = Database::memory().unwrap();
        assert_eq!(db.version().unwrap(), MIGRATIONS.len());
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");

        let db = Database::open(&path).unwrap();
        db.execute("INSERT INTO waiting_proofs (scid, origin, data) VALUES (1, 0, x'00')")
            .unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.version().unwrap(), MIGRATIONS.len());

        let count = db
            .prepare("SELECT COUNT(*) FROM waiting_proofs")
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .unwrap()
            .read::<i64, _>(0);
        assert_eq!(count, 1);
    }
}
