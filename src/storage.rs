//! RocksDB storage layer
//!
//! Every table lives in one `TransactionDB`, separated by key prefix. Numeric
//! key suffixes are big-endian so prefix scans come back in ascending order.

use crate::{config::StorageConfig, errors::StorageError};
use rocksdb::{
    Direction, ErrorKind, IteratorMode, MultiThreaded, Options, TransactionDB, TransactionDBOptions,
};
use std::{path::Path, sync::Arc, time::Duration};

/// Transaction handle passed to [`DrawStorage::transaction`] bodies
pub type DbTransaction<'a> = rocksdb::Transaction<'a, TransactionDB<MultiThreaded>>;

/// Shared handle to the process-wide database
#[derive(Clone)]
pub struct DrawStorage {
    db: Arc<TransactionDB<MultiThreaded>>,
    max_retries: u32,
}

impl DrawStorage {
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.data_directory)
            .map_err(|e| StorageError::OpenFailed(format!("{}: {}", config.data_directory, e)))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let db = TransactionDB::<MultiThreaded>::open(&opts, &txn_opts, &config.data_directory)
            .map_err(|e| StorageError::OpenFailed(e.to_string()))?;

        tracing::debug!(path = %config.data_directory, "Opened draw storage");

        Ok(Self {
            db: Arc::new(db),
            max_retries: config.max_transaction_retries.max(1),
        })
    }

    /// Open with default tuning at `path`
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open(&StorageConfig {
            data_directory: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put(key, value).map_err(StorageError::from)
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.delete(key).map_err(StorageError::from)
    }

    /// Ascending scan of `prefix`, starting strictly after `after` when given
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = after.unwrap_or(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if after.is_some_and(|a| key.as_ref() == a) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// Descending scan of `prefix`, newest key first
    pub fn scan_prefix_rev(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let upper = prefix_upper_bound(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(&upper, Direction::Reverse)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if key.as_ref() >= upper.as_slice() {
                continue;
            }
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// Run `body` inside a pessimistic transaction and commit it.
    ///
    /// Lock waits that time out and commit conflicts are retried with a short
    /// backoff; any other RocksDB error aborts immediately.
    pub fn transaction<T, F>(&self, mut body: F) -> Result<T, StorageError>
    where
        F: FnMut(&DbTransaction<'_>) -> Result<T, rocksdb::Error>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let txn = self.db.transaction();
            let result = body(&txn).and_then(|value| txn.commit().map(|_| value));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt < self.max_retries => {
                    tracing::debug!(attempt, error = %e, "Retrying contended transaction");
                    std::thread::sleep(Duration::from_millis(1 << attempt.min(6)));
                }
                Err(e) if is_retryable(&e) => {
                    tracing::warn!(attempts = attempt, error = %e, "Transaction contention persisted");
                    return Err(StorageError::Contention { attempts: attempt });
                }
                Err(e) => return Err(StorageError::WriteFailed(e.to_string())),
            }
        }
    }

    /// Run a blocking storage operation off the async runtime with an upper bound.
    ///
    /// A timed-out operation may still complete in the background; callers
    /// must not assume it was applied.
    pub async fn run_blocking<T, F>(&self, timeout: Duration, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&DrawStorage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        let task = tokio::task::spawn_blocking(move || op(&storage));

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(StorageError::Timeout(timeout)),
        }
    }
}

fn is_retryable(e: &rocksdb::Error) -> bool {
    matches!(e.kind(), ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain)
}

/// Key made of `prefix` followed by `n` in big-endian
pub fn numbered_key(prefix: &[u8], n: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// Trailing big-endian u64 of a numbered key
pub fn key_number(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = suffix.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return upper;
        }
    }
    vec![u8::MAX; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (DrawStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = DrawStorage::open_path(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_numbered_keys_sort_ascending() {
        let (storage, _temp) = create_test_storage();
        for n in [300u64, 2, 70_000, 15] {
            storage.put(&numbered_key(b"t:", n), &n.to_le_bytes()).unwrap();
        }
        storage.put(b"u:unrelated", b"x").unwrap();

        let rows = storage.scan_prefix(b"t:", None, 10).unwrap();
        let numbers: Vec<u64> = rows.iter().filter_map(|(k, _)| key_number(b"t:", k)).collect();
        assert_eq!(numbers, vec![2, 15, 300, 70_000]);

        let rev = storage.scan_prefix_rev(b"t:", 2).unwrap();
        let numbers: Vec<u64> = rev.iter().filter_map(|(k, _)| key_number(b"t:", k)).collect();
        assert_eq!(numbers, vec![70_000, 300]);
    }

    #[test]
    fn test_scan_after_cursor() {
        let (storage, _temp) = create_test_storage();
        for n in 1..=5u64 {
            storage.put(&numbered_key(b"q:", n), b"").unwrap();
        }
        let cursor = numbered_key(b"q:", 2);
        let rows = storage.scan_prefix(b"q:", Some(&cursor), 2).unwrap();
        let numbers: Vec<u64> = rows.iter().filter_map(|(k, _)| key_number(b"q:", k)).collect();
        assert_eq!(numbers, vec![3, 4]);
    }

    #[test]
    fn test_transaction_commits() {
        let (storage, _temp) = create_test_storage();
        let out = storage
            .transaction(|txn| {
                let current = txn.get_for_update(b"counter", true)?;
                let next = current.map(|b| b[0]).unwrap_or(0) + 1;
                txn.put(b"counter", [next])?;
                Ok(next)
            })
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(storage.get(b"counter").unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_empty_prefix_scan() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.scan_prefix(b"none:", None, 10).unwrap().is_empty());
        assert!(storage.scan_prefix_rev(b"none:", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let (storage, _temp) = create_test_storage();
        storage
            .run_blocking(Duration::from_secs(5), |s| s.put(b"k", b"v"))
            .await
            .unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
