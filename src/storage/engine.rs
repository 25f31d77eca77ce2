//! Storage Engine
//!
//! Local key-value table backed by SQLite, with a replication log that
//! receives a copy of every accepted write in the same transaction.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of connections serving lookups in parallel
const READER_CONNECTIONS: usize = 4;

/// A write that has not yet been acknowledged by a replication consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Position in the replication log, increasing with every write
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Persistent key-value store backed by SQLite
///
/// Writers are serialized on one connection; lookups are spread over a small
/// set of reader connections so that, with the WAL journal, they run in
/// parallel and never wait on an open write.
pub struct StorageEngine {
    /// Connection used for every mutation
    writer: Mutex<Connection>,
    /// Connections used for lookups and scans
    readers: Vec<Mutex<Connection>>,
    /// Next reader to wait on when all of them are busy
    next_reader: AtomicUsize,
    /// Reject mutations when set
    read_only: bool,
}

impl StorageEngine {
    /// Open or create the database file at `path`
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(&path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = writer.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!("Opened {:?} with journal mode {}", path, mode);

        writer.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS replication_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key BLOB NOT NULL,
                value BLOB NOT NULL
            );
            "#,
        )?;

        let mut readers = Vec::with_capacity(READER_CONNECTIONS);
        for _ in 0..READER_CONNECTIONS {
            let reader = Connection::open(&path)?;
            reader.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Take an idle reader connection, or queue on one if all are busy
    async fn reader(&self) -> MutexGuard<'_, Connection> {
        for reader in &self.readers {
            if let Ok(conn) = reader.try_lock() {
                return conn;
            }
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock().await
    }

    /// Get the value stored under `key`
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.reader().await;
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Store `value` under `key` and append the write to the replication log
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut conn = self.writer.lock().await;
        write_record(&mut conn, key, value)
    }

    /// Delete every key for which `predicate` returns true
    ///
    /// Keys are collected in a read pass and deleted in a separate write
    /// transaction. A key written between the two passes is not considered.
    pub async fn delete_many<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&[u8]) -> bool + Send + Sync,
    {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let keys = {
            let conn = self.reader().await;
            scan_keys(&conn, &predicate)?
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.writer.lock().await;
        delete_keys(&mut conn, &keys)
    }

    /// Oldest entry of the replication log, left in place
    pub async fn peek_oldest_pending(&self) -> Result<Option<PendingEntry>> {
        Ok(self.pending_batch(1).await?.into_iter().next())
    }

    /// Up to `limit` oldest entries of the replication log, oldest first
    pub async fn pending_batch(&self, limit: usize) -> Result<Vec<PendingEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.reader().await;
        let mut stmt = conn.prepare(
            "SELECT seq, key, value FROM replication_log ORDER BY seq LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(PendingEntry {
                seq: row.get::<_, i64>(0)? as u64,
                key: row.get(1)?,
                value: row.get(2)?,
            })
        })?;

        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Remove every replication log entry up to and including `seq`
    pub async fn acknowledge_pending(&self, seq: u64) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let seq = i64::try_from(seq).unwrap_or(i64::MAX);
        let conn = self.writer.lock().await;
        let removed = conn.execute(
            "DELETE FROM replication_log WHERE seq <= ?1",
            params![seq],
        )?;
        Ok(removed as u64)
    }

    /// Number of entries waiting in the replication log
    pub async fn pending_count(&self) -> Result<u64> {
        let conn = self.reader().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM replication_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of records in the local table
    pub async fn record_count(&self) -> Result<u64> {
        let conn = self.reader().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Upsert the record and append it to the log; both commit or neither does.
fn write_record(conn: &mut Connection, key: &[u8], value: &[u8]) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        r#"
        INSERT INTO records (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![key, value],
    )?;
    tx.execute(
        "INSERT INTO replication_log (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    tx.commit()?;
    Ok(())
}

fn scan_keys<F>(conn: &Connection, predicate: &F) -> Result<Vec<Vec<u8>>>
where
    F: Fn(&[u8]) -> bool,
{
    let mut stmt = conn.prepare("SELECT key FROM records")?;
    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

    let mut keys = Vec::new();
    for key in rows {
        let key = key?;
        if predicate(&key) {
            keys.push(key);
        }
    }
    Ok(keys)
}

fn delete_keys(conn: &mut Connection, keys: &[Vec<u8>]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut deleted = 0;
    {
        let mut stmt = tx.prepare("DELETE FROM records WHERE key = ?1")?;
        for key in keys {
            deleted += stmt.execute(params![key])?;
        }
    }
    tx.commit()?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_temp(read_only: bool) -> (tempfile::TempDir, StorageEngine) {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path().join("shard.db"), read_only).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_get_set() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"hello", b"world").await.unwrap();
        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(engine.get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"hello", b"world").await.unwrap();
        engine.set(b"hello", b"there").await.unwrap();
        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"there".to_vec()));
        assert_eq!(engine.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_value_is_not_absent() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"blank", b"").await.unwrap();
        assert_eq!(engine.get(b"blank").await.unwrap(), Some(Vec::new()));
        assert_eq!(engine.get(b"other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"hello", b"world").await.unwrap();
        engine.set(b"hello1", b"world1").await.unwrap();
        engine.set(b"hello2", b"world2").await.unwrap();

        let deleted = engine.delete_many(|key| key == b"hello1").await.unwrap();
        assert_eq!(deleted, 1);

        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(engine.get(b"hello1").await.unwrap(), None);
        assert_eq!(engine.get(b"hello2").await.unwrap(), Some(b"world2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_many_without_matches() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"hello", b"world").await.unwrap();
        assert_eq!(engine.delete_many(|_| false).await.unwrap(), 0);
        assert_eq!(engine.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.db");
        {
            let engine = StorageEngine::open(&path, false).unwrap();
            engine.set(b"hello", b"world").await.unwrap();
        }

        let engine = StorageEngine::open(&path, true).unwrap();
        assert!(engine.is_read_only());
        assert!(matches!(engine.set(b"hello", b"again").await, Err(Error::ReadOnly)));
        assert!(matches!(engine.delete_many(|_| true).await, Err(Error::ReadOnly)));
        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"world".to_vec()));
    }

    #[tokio::test]
    async fn test_read_only_keeps_replication_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.db");
        {
            let engine = StorageEngine::open(&path, false).unwrap();
            engine.set(b"hello", b"world").await.unwrap();
        }

        let engine = StorageEngine::open(&path, true).unwrap();
        let seq = engine.peek_oldest_pending().await.unwrap().unwrap().seq;
        assert!(matches!(engine.acknowledge_pending(seq).await, Err(Error::ReadOnly)));
        assert_eq!(engine.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_log_insert_rolls_back_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.db");
        let engine = StorageEngine::open(&path, false).unwrap();
        engine.set(b"before", b"1").await.unwrap();

        let other = Connection::open(&path).unwrap();
        other
            .execute_batch(
                r#"
                CREATE TRIGGER reject_log BEFORE INSERT ON replication_log
                BEGIN
                    SELECT RAISE(ABORT, 'replication log unavailable');
                END;
                "#,
            )
            .unwrap();

        assert!(matches!(engine.set(b"hello", b"world").await, Err(Error::Storage(_))));
        assert_eq!(engine.get(b"hello").await.unwrap(), None);
        assert_eq!(engine.record_count().await.unwrap(), 1);
        assert_eq!(engine.pending_count().await.unwrap(), 1);

        other.execute_batch("DROP TRIGGER reject_log;").unwrap();
        engine.set(b"hello", b"world").await.unwrap();
        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(engine.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("shard.db");
        {
            let engine = StorageEngine::open(&path, false).unwrap();
            engine.set(b"hello", b"world").await.unwrap();
        }

        let engine = StorageEngine::open(&path, false).unwrap();
        assert_eq!(engine.get(b"hello").await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(engine.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replication_log_order() {
        let (_dir, engine) = open_temp(false);
        assert!(engine.peek_oldest_pending().await.unwrap().is_none());

        engine.set(b"zeta", b"1").await.unwrap();
        engine.set(b"alpha", b"2").await.unwrap();
        engine.set(b"zeta", b"3").await.unwrap();

        // Chronological, not key order; overwrites are logged separately
        let batch = engine.pending_batch(10).await.unwrap();
        let writes: Vec<(Vec<u8>, Vec<u8>)> =
            batch.iter().map(|e| (e.key.clone(), e.value.clone())).collect();
        assert_eq!(
            writes,
            vec![
                (b"zeta".to_vec(), b"1".to_vec()),
                (b"alpha".to_vec(), b"2".to_vec()),
                (b"zeta".to_vec(), b"3".to_vec()),
            ]
        );
        assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq));

        let oldest = engine.peek_oldest_pending().await.unwrap().unwrap();
        assert_eq!(oldest, batch[0]);
        // Peeking does not consume
        assert_eq!(engine.peek_oldest_pending().await.unwrap().unwrap(), oldest);
        assert_eq!(engine.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_acknowledge_pending() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"a", b"1").await.unwrap();
        engine.set(b"b", b"2").await.unwrap();
        engine.set(b"c", b"3").await.unwrap();

        let batch = engine.pending_batch(2).await.unwrap();
        assert_eq!(batch.len(), 2);

        let removed = engine.acknowledge_pending(batch[1].seq).await.unwrap();
        assert_eq!(removed, 2);

        let next = engine.peek_oldest_pending().await.unwrap().unwrap();
        assert_eq!(next.key, b"c".to_vec());
        assert_eq!(engine.pending_count().await.unwrap(), 1);

        // Records are untouched by acknowledgement
        assert_eq!(engine.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        // Sequences beyond i64 acknowledge everything instead of wrapping
        assert_eq!(engine.acknowledge_pending(u64::MAX).await.unwrap(), 1);
        assert_eq!(engine.pending_count().await.unwrap(), 0);
        assert!(engine.pending_batch(usize::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_while_reader_is_busy() {
        let (_dir, engine) = open_temp(false);
        engine.set(b"hello", b"world").await.unwrap();

        // A long-running scan holds one reader; lookups use the others
        let _busy = engine.readers[0].lock().await;
        let value = tokio::time::timeout(Duration::from_secs(1), engine.get(b"hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"world".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_does_not_touch_log() {
        let (_dir, engine) = open_temp(false);

        engine.set(b"hello", b"world").await.unwrap();
        engine.delete_many(|_| true).await.unwrap();
        assert_eq!(engine.record_count().await.unwrap(), 0);
        assert_eq!(engine.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let (_dir, engine) = open_temp(false);
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for worker in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let key = format!("w{}-k{}", worker, i);
                    engine.set(key.as_bytes(), b"v").await.unwrap();
                    assert_eq!(engine.get(key.as_bytes()).await.unwrap(), Some(b"v".to_vec()));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(engine.record_count().await.unwrap(), 200);
        assert_eq!(engine.pending_count().await.unwrap(), 200);
    }
}
