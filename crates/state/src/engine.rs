//! Storage engine wrapper.
//!
//! A thin layer over redb handling database lifecycle: file-backed databases
//! for production, in-memory databases for tests.

use std::path::Path;
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::Database;
use snafu::ResultExt;

use crate::state::{DatabaseSnafu, StateError};

/// Storage engine backed by redb.
pub struct StorageEngine {
    db: Arc<Database>,
}

impl StorageEngine {
    /// Opens or creates a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let db = if path.exists() {
            Database::open(path)
        } else {
            Database::create(path)
        }
        .context(DatabaseSnafu)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Creates a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .context(DatabaseSnafu)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Returns a clone of the database handle.
    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self { db: Arc::clone(&self.db) }
    }
}
