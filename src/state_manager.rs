// src/state_manager.rs

use crate::models::{DownloadId, DownloadJob, JobStatus, SCHEMA_VERSION};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("record {id} was written by a newer version (schema {found})")]
    UnsupportedSchema { id: String, found: u32 },
    #[error("persistence task has stopped")]
    Closed,
}

/// Layout version of the SQLite file, tracked through `PRAGMA user_version`.
const DB_VERSION: i64 = 2;

/// Manages the persistence of download jobs to an SQLite database.
///
/// A passive record store: it knows nothing about the download lifecycle.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the database file and brings its layout up to date.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// A throwaway store, mostly for tests.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// Runs every layout migration the file has not seen yet.
    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                let mut version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
                if version < 1 {
                    conn.execute(
                        "CREATE TABLE IF NOT EXISTS downloads (
                            id              TEXT PRIMARY KEY,
                            schema_version  INTEGER NOT NULL,
                            record          TEXT NOT NULL
                        )",
                        [],
                    )?;
                    version = 1;
                }
                if version < 2 {
                    conn.execute_batch(
                        "ALTER TABLE downloads ADD COLUMN status TEXT NOT NULL DEFAULT 'queued';
                         CREATE INDEX IF NOT EXISTS downloads_status ON downloads(status);",
                    )?;
                    version = 2;
                }
                conn.pragma_update(None, "user_version", version)?;
                Ok(())
            })
            .await?;
        debug!(version = DB_VERSION, "state database ready");
        Ok(())
    }

    /// Saves (inserts or updates) a DownloadJob.
    pub async fn save(&self, job: &DownloadJob) -> Result<(), StateError> {
        let record = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let status = job.status.as_str();
        let schema_version = job.schema_version;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO downloads (id, schema_version, status, record)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, schema_version, status, record],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads every stored job, upgrading older records on the way.
    pub async fn load_all(&self) -> Result<Vec<DownloadJob>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, record FROM downloads")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, record)| {
                let job: DownloadJob = serde_json::from_str(&record)?;
                migrate_record(&id, job)
            })
            .collect()
    }

    /// Deletes a job by its ID.
    pub async fn delete(&self, id: DownloadId) -> Result<(), StateError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Deletes every job in `status`, returning how many went.
    pub async fn delete_with_status(&self, status: JobStatus) -> Result<usize, StateError> {
        let status = status.as_str();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM downloads WHERE status = ?1", params![status])?))
            .await?;
        Ok(removed)
    }
}

/// Brings a record written by an older release up to the current schema.
fn migrate_record(id: &str, mut job: DownloadJob) -> Result<DownloadJob, StateError> {
    if job.schema_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchema {
            id: id.to_string(),
            found: job.schema_version,
        });
    }
    if job.schema_version < 2 {
        // Schema 1 stored no per-segment retry counters; serde already
        // defaulted them to zero. Ranges were implied by having segments.
        job.supports_ranges = job.segments.len() > 1;
    }
    job.schema_version = SCHEMA_VERSION;
    Ok(job)
}

enum PersistOp {
    Save(Box<DownloadJob>),
    Delete(DownloadId),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front for a [`StateManager`].
///
/// Writes are applied in submission order by one background task; `flush`
/// resolves once everything submitted before it has hit the database.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl Persister {
    pub fn spawn(store: StateManager) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    PersistOp::Save(job) => {
                        if let Err(e) = store.save(&job).await {
                            warn!(download_id = %job.id, error = %e, "failed to persist download");
                        }
                    }
                    PersistOp::Delete(id) => {
                        if let Err(e) = store.delete(id).await {
                            warn!(download_id = %id, error = %e, "failed to delete download record");
                        }
                    }
                    PersistOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn save(&self, job: &DownloadJob) {
        if self.tx.send(PersistOp::Save(Box::new(job.clone()))).is_err() {
            warn!(download_id = %job.id, "persister stopped, save dropped");
        }
    }

    pub fn delete(&self, id: DownloadId) {
        if self.tx.send(PersistOp::Delete(id)).is_err() {
            warn!(download_id = %id, "persister stopped, delete dropped");
        }
    }

    /// Waits for every write queued so far.
    pub async fn flush(&self) -> Result<(), StateError> {
        let (done, wait) = oneshot::channel();
        self.tx.send(PersistOp::Flush(done)).map_err(|_| StateError::Closed)?;
        wait.await.map_err(|_| StateError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadOptions, Segment};
    use std::path::PathBuf;

    fn job(url: &str) -> DownloadJob {
        DownloadJob::new(url.into(), PathBuf::from("/tmp/out.bin"), DownloadOptions::default(), 4)
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = StateManager::in_memory().await.unwrap();
        let mut a = job("http://example.com/a");
        a.total_size = Some(10);
        a.segments = vec![Segment::new(0, 0, Some(4)), Segment::new(1, 5, Some(9))];
        a.segments[1].bytes_downloaded = 3;
        let b = job("http://example.com/b");

        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by_key(|j| j.url.clone());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], a);

        store.delete(a.id).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, b.id);
    }

    #[tokio::test]
    async fn save_replaces_existing_record() {
        let store = StateManager::in_memory().await.unwrap();
        let mut a = job("http://example.com/a");
        store.save(&a).await.unwrap();
        a.transition(JobStatus::Downloading).unwrap();
        store.save(&a).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, JobStatus::Downloading);
    }

    #[tokio::test]
    async fn delete_with_status_only_touches_matching_rows() {
        let store = StateManager::in_memory().await.unwrap();
        let mut done = job("http://example.com/done");
        done.status = JobStatus::Completed;
        store.save(&done).await.unwrap();
        store.save(&job("http://example.com/pending")).await.unwrap();

        assert_eq!(store.delete_with_status(JobStatus::Completed).await.unwrap(), 1);
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = job("http://example.com/a");
        {
            let store = StateManager::new(&path).await.unwrap();
            store.save(&a).await.unwrap();
        }
        let store = StateManager::new(&path).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn old_records_are_migrated() {
        let mut old = job("http://example.com/old");
        old.schema_version = 1;
        old.segments = vec![Segment::new(0, 0, Some(4)), Segment::new(1, 5, Some(9))];
        let migrated = migrate_record("x", old).unwrap();
        assert_eq!(migrated.schema_version, SCHEMA_VERSION);
        assert!(migrated.supports_ranges);

        let mut future = job("http://example.com/new");
        future.schema_version = SCHEMA_VERSION + 1;
        assert!(matches!(
            migrate_record("y", future),
            Err(StateError::UnsupportedSchema { .. })
        ));
    }

    #[tokio::test]
    async fn persister_flush_waits_for_writes() {
        let store = StateManager::in_memory().await.unwrap();
        let persister = Persister::spawn(store.clone());
        let a = job("http://example.com/a");
        let b = job("http://example.com/b");
        persister.save(&a);
        persister.save(&b);
        persister.delete(a.id);
        persister.flush().await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, b.id);
    }
}
