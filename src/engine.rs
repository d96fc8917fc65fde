//! Connection wrapper around the encrypted SQLite engine.
//!
//! Owns the single persistent connection per store instance and the pragma
//! surface the passphrase lifecycle needs: `PRAGMA key` (apply key material
//! to the open connection), `PRAGMA rekey` (the engine's native, atomic
//! re-key primitive), and `PRAGMA cache_size`. The connection may be closed
//! and reopened; passphrase validation exploits that to retry a key against
//! a fresh connection.
//!
//! Engine errors are mapped to the [`StoreError`] taxonomy here and never
//! surface as raw `rusqlite` errors.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// Handle on the encrypted database file. Holds at most one live connection.
pub struct Engine {
    path: PathBuf,
    conn: Option<Connection>,
}

impl Engine {
    /// Open a connection to the database file, creating it if absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::OpenFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "opened database connection");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Some(conn),
        })
    }

    /// Whether the file existed with content before this engine opened it.
    ///
    /// Used by the store to decide the initial passphrase state: an empty or
    /// missing file is a freshly created, unencrypted-until-keyed database.
    pub fn file_is_fresh(path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        }
    }

    /// Whether a live connection is held. Validation failure closes the
    /// connection; callers observe that here.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the live connection, if any.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(path = %self.path.display(), "closed database connection");
        }
    }

    /// Open a fresh connection to the same file, replacing any existing one.
    pub fn reopen(&mut self) -> Result<(), StoreError> {
        self.close();
        let conn = Connection::open(&self.path).map_err(|e| StoreError::OpenFailed {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Apply key material to the live connection (`PRAGMA key`).
    ///
    /// On a fresh database this is the key-derivation step that makes the
    /// file encrypted from its first write onward.
    pub fn apply_key(&mut self, passphrase: &str) -> Result<(), StoreError> {
        self.conn()?
            .pragma_update(None, "key", passphrase)
            .map_err(|e| StoreError::IncorrectPasscode {
                message: e.to_string(),
            })
    }

    /// Re-key the database to a new passphrase (`PRAGMA rekey`).
    ///
    /// The engine performs this atomically; on failure the file remains
    /// readable under the previous key.
    pub fn rekey(&mut self, passphrase: &str) -> Result<(), StoreError> {
        self.conn()?
            .pragma_update(None, "rekey", passphrase)
            .map_err(|e| StoreError::MigrationFailed {
                message: e.to_string(),
            })
    }

    /// Prove the current key by reading the schema table.
    ///
    /// With a wrong key the first real read fails ("file is not a
    /// database"); that failure maps to `IncorrectPasscode`.
    pub fn probe(&self) -> Result<(), StoreError> {
        self.conn()?
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|e| StoreError::IncorrectPasscode {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Set the engine page-cache size in pages (`PRAGMA cache_size`).
    pub fn set_cache_size(&mut self, pages: i64) -> Result<(), StoreError> {
        self.conn()?
            .pragma_update(None, "cache_size", pages)
            .map_err(|e| StoreError::SchemaMismatch {
                message: format!("failed to set cache_size: {e}"),
            })
    }

    /// Borrow the live connection, failing with `StoreNotReady` when closed.
    pub fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::StoreNotReady)
    }

    /// Mutably borrow the live connection (transactions need `&mut`).
    pub fn conn_mut(&mut self) -> Result<&mut Connection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::StoreNotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_db(dir: &TempDir) -> PathBuf {
        dir.path().join("engine_test.sqlite")
    }

    #[test]
    fn test_open_close_reopen() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::open(&temp_db(&dir)).unwrap();
        assert!(engine.is_open());

        engine.close();
        assert!(!engine.is_open());
        match engine.conn() {
            Err(StoreError::StoreNotReady) => {}
            other => panic!("Expected StoreNotReady, got {other:?}"),
        }

        engine.reopen().unwrap();
        assert!(engine.is_open());
    }

    #[test]
    fn test_fresh_file_detection() {
        let dir = TempDir::new().unwrap();
        let path = temp_db(&dir);
        assert!(Engine::file_is_fresh(&path));

        let mut engine = Engine::open(&path).unwrap();
        engine.apply_key("secret").unwrap();
        engine
            .conn()
            .unwrap()
            .execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        engine.close();
        assert!(!Engine::file_is_fresh(&path));
    }

    #[test]
    fn test_probe_fails_with_wrong_key() {
        let dir = TempDir::new().unwrap();
        let path = temp_db(&dir);

        let mut engine = Engine::open(&path).unwrap();
        engine.apply_key("right").unwrap();
        engine
            .conn()
            .unwrap()
            .execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        engine.close();

        engine.reopen().unwrap();
        engine.apply_key("wrong").unwrap();
        match engine.probe() {
            Err(StoreError::IncorrectPasscode { .. }) => {}
            other => panic!("Expected IncorrectPasscode, got {other:?}"),
        }
    }

    #[test]
    fn test_rekey_then_reopen_with_new_key() {
        let dir = TempDir::new().unwrap();
        let path = temp_db(&dir);

        let mut engine = Engine::open(&path).unwrap();
        engine.apply_key("first").unwrap();
        engine
            .conn()
            .unwrap()
            .execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        engine.rekey("second").unwrap();
        engine.close();

        engine.reopen().unwrap();
        engine.apply_key("second").unwrap();
        engine.probe().unwrap();
    }
}
