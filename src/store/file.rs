//! Record store backed by a line-oriented text file.

use super::codec;
use super::{FailureRecord, RecordStore};
use crate::error::StoreError;
use crate::paths::StorePaths;
use async_trait::async_trait;
use std::io;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File-resident record table.
///
/// Reads scan the whole file; removals rewrite it through a scratch file that is renamed into
/// place, so a crash mid-rewrite leaves either the old or the new table. Inserts append.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    paths: StorePaths,
}

impl FileRecordStore {
    /// Open the store, creating an empty record file if none exists yet.
    pub async fn open(paths: StorePaths) -> Result<Self, StoreError> {
        let path = paths.record_file();
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self) -> Result<Vec<FailureRecord>, StoreError> {
        let path = self.paths.record_file();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "record file missing; treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let decoded = codec::decode(&bytes);
        for bad in &decoded.malformed {
            tracing::warn!(path = %path.display(), line = bad.line, reason = bad.reason, "skipping malformed record line");
        }
        for identity in &decoded.duplicates {
            tracing::warn!(path = %path.display(), identity = %identity, "duplicate record; keeping the last line");
        }
        if decoded.legacy > 0 {
            tracing::debug!(path = %path.display(), count = decoded.legacy, "read legacy-layout records");
        }
        Ok(decoded.records)
    }

    async fn rewrite(&self, records: &[FailureRecord]) -> Result<(), StoreError> {
        let scratch = self.paths.rewrite_scratch();
        let target = self.paths.record_file();
        let body = codec::encode(records);

        let mut file =
            tokio::fs::File::create(&scratch).await.map_err(|e| StoreError::io(&scratch, e))?;
        file.write_all(body.as_bytes()).await.map_err(|e| StoreError::io(&scratch, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&scratch, e))?;
        drop(file);

        tokio::fs::rename(&scratch, target).await.map_err(|e| StoreError::io(target, e))?;
        tracing::trace!(path = %target.display(), records = records.len(), "record file rewritten");
        Ok(())
    }

    async fn append(&self, record: &FailureRecord) -> Result<(), StoreError> {
        if record.identity().is_empty() {
            return Err(StoreError::InvalidIdentity);
        }
        let path = self.paths.record_file();
        let mut line = codec::encode_line(record);
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        if !ends_with_newline(&mut file).await.map_err(|e| StoreError::io(path, e))? {
            // A torn or hand-edited last line would otherwise swallow this record.
            tracing::warn!(path = %path.display(), "record file lacks a trailing newline; terminating it");
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes()).await.map_err(|e| StoreError::io(path, e))?;
        file.flush().await.map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }
}

/// `true` for an empty file or one whose last byte is `\n`.
async fn ends_with_newline(file: &mut tokio::fs::File) -> io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileRecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::open(StorePaths::in_dir(dir.path())).await.expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn open_creates_empty_file() {
        let (_dir, store) = store().await;
        assert!(store.paths().record_file().exists());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_fails_when_directory_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::in_dir(dir.path().join("does-not-exist"));
        let err = FileRecordStore::open(paths).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[tokio::test]
    async fn insert_lookup_remove() {
        let (_dir, store) = store().await;
        store.insert(&FailureRecord::new("alice", 1, 100)).await.unwrap();
        store.insert(&FailureRecord::new("bob", 2, 105)).await.unwrap();

        assert!(store.exists("alice").await.unwrap());
        assert_eq!(store.failure_count("bob").await.unwrap(), 2);
        assert_eq!(store.failure_count("carol").await.unwrap(), 0);
        assert_eq!(store.seconds_since_last_failure("bob", 130, 60).await.unwrap(), 25);
        assert_eq!(store.seconds_since_last_failure("carol", 130, 60).await.unwrap(), 60);

        assert!(store.remove("alice").await.unwrap());
        assert!(!store.exists("alice").await.unwrap());
        assert!(store.exists("bob").await.unwrap());
    }

    #[tokio::test]
    async fn remove_absent_leaves_file_untouched() {
        let (_dir, store) = store().await;
        store.insert(&FailureRecord::new("alice", 1, 100)).await.unwrap();
        let before = std::fs::read(store.paths().record_file()).unwrap();

        assert!(!store.remove("nobody").await.unwrap());
        assert!(!store.remove("nobody").await.unwrap());

        assert_eq!(std::fs::read(store.paths().record_file()).unwrap(), before);
        assert!(!store.paths().rewrite_scratch().exists());
    }

    #[tokio::test]
    async fn insert_refuses_duplicates_and_empty_identity() {
        let (_dir, store) = store().await;
        store.insert(&FailureRecord::new("alice", 1, 100)).await.unwrap();
        let err = store.insert(&FailureRecord::new("alice", 5, 101)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { ref identity } if identity == "alice"));

        let err = store.insert(&FailureRecord::new("", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity));
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn increment_moves_record_to_end_with_new_timestamp() {
        let (_dir, store) = store().await;
        store.insert(&FailureRecord::new("alice", 1, 100)).await.unwrap();
        store.insert(&FailureRecord::new("bob", 1, 100)).await.unwrap();

        let updated = store.increment_and_refresh("alice", 140).await.unwrap();
        assert_eq!(updated, FailureRecord::new("alice", 2, 140));

        let text = std::fs::read_to_string(store.paths().record_file()).unwrap();
        assert_eq!(text, "bob 1 100\nalice 2 140\n");
    }

    #[tokio::test]
    async fn malformed_lines_do_not_abort_reads() {
        let (_dir, store) = store().await;
        std::fs::write(store.paths().record_file(), "alice 2 100\nnot a record at all\n bob 1 90\n")
            .unwrap();

        let records = store.load().await.unwrap();
        assert_eq!(
            records,
            vec![FailureRecord::new("alice", 2, 100), FailureRecord::new("bob", 1, 90)]
        );

        // The next rewrite drops the unreadable line and migrates the legacy one.
        store.remove("alice").await.unwrap();
        let text = std::fs::read_to_string(store.paths().record_file()).unwrap();
        assert_eq!(text, "bob 1 90\n");
    }

    #[tokio::test]
    async fn insert_after_unterminated_last_line_keeps_both_records() {
        let (_dir, store) = store().await;
        std::fs::write(store.paths().record_file(), "bob 2 20").unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);

        store.insert(&FailureRecord::new("alice", 1, 30)).await.unwrap();

        let text = std::fs::read_to_string(store.paths().record_file()).unwrap();
        assert_eq!(text, "bob 2 20\nalice 1 30\n");
        assert_eq!(
            store.load().await.unwrap(),
            vec![FailureRecord::new("bob", 2, 20), FailureRecord::new("alice", 1, 30)]
        );
    }

    #[tokio::test]
    async fn non_utf8_lines_are_skipped_not_merged() {
        let (_dir, store) = store().await;
        std::fs::write(store.paths().record_file(), b" caf\xe9 2 10\n caf\xe8 1 11\nbob 1 12\n")
            .unwrap();

        assert_eq!(store.load().await.unwrap(), vec![FailureRecord::new("bob", 1, 12)]);
        assert!(!store.exists("caf\u{fffd}").await.unwrap());
    }

    #[tokio::test]
    async fn deleted_record_file_reads_as_empty() {
        let (_dir, store) = store().await;
        std::fs::remove_file(store.paths().record_file()).unwrap();
        assert!(store.load().await.unwrap().is_empty());
        store.insert(&FailureRecord::new("alice", 1, 1)).await.unwrap();
        assert!(store.exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn identities_with_delimiters_round_trip_through_file() {
        let (_dir, store) = store().await;
        store.insert(&FailureRecord::new("john smith", 1, 10)).await.unwrap();
        store.insert(&FailureRecord::new("john", 3, 10)).await.unwrap();

        assert_eq!(store.failure_count("john smith").await.unwrap(), 1);
        assert_eq!(store.failure_count("john").await.unwrap(), 3);
        store.remove("john").await.unwrap();
        assert!(store.exists("john smith").await.unwrap());
    }
}
