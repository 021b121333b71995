use aoc_storage::{SessionStore, StorageError};
use std::path::{Path, PathBuf};

/// Path to the agent database. Each call opens its own read-only connection
/// on the blocking pool, so a database that appears late is picked up.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    path: PathBuf,
}

impl StoreHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        F: FnOnce(&SessionStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let store = SessionStore::open_readonly(&path)?;
            work(&store)
        })
        .await
        .map_err(|err| StorageError::Join(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_storage::SESSION_SCHEMA_SQL;
    use rusqlite::Connection;
    use tempfile::{tempdir, NamedTempFile};

    #[tokio::test]
    async fn runs_work_against_a_fresh_readonly_connection() {
        let file = NamedTempFile::new().expect("temp db");
        let writer = Connection::open(file.path()).expect("writer");
        writer.execute_batch(SESSION_SCHEMA_SQL).expect("schema");
        writer
            .execute("INSERT INTO session (id, updated_at) VALUES ('s1', 10)", [])
            .expect("insert");

        let handle = StoreHandle::new(file.path());
        let sessions = handle
            .run(|store| store.recent_sessions(20, 0))
            .await
            .expect("query");
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn missing_database_is_a_storage_error() {
        let dir = tempdir().expect("temp dir");
        let handle = StoreHandle::new(dir.path().join("absent.db"));
        let err = handle
            .run(|store| store.table_names())
            .await
            .expect_err("missing db");
        assert!(matches!(err, StorageError::Sqlite(_)));
        assert!(!dir.path().join("absent.db").exists());
    }
}
