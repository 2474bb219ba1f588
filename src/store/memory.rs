use super::{FailureRecord, RecordStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

/// Simple in-memory record store. Clones share the same table.
#[derive(Default, Clone, Debug)]
pub struct InMemoryRecordStore {
    records: Arc<Mutex<Vec<FailureRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with records recovered from elsewhere.
    pub fn with_records(records: Vec<FailureRecord>) -> Self {
        Self { records: Arc::new(Mutex::new(records)) }
    }

    fn table(&self) -> MutexGuard<'_, Vec<FailureRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self.table().clone())
    }

    async fn rewrite(&self, records: &[FailureRecord]) -> Result<(), StoreError> {
        *self.table() = records.to_vec();
        Ok(())
    }

    async fn append(&self, record: &FailureRecord) -> Result<(), StoreError> {
        self.table().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn interleaved_mutations_keep_identities_unique() {
        let store = InMemoryRecordStore::new();
        let names = ["alice", "bob", "carol"];

        for step in 0u64..60 {
            let name = names[(step % 3) as usize];
            match step % 4 {
                0 => {
                    let _ = store.insert(&FailureRecord::first_failure(name, step)).await;
                }
                1 => {
                    store.increment_and_refresh(name, step).await.unwrap();
                }
                2 => {
                    store.remove(name).await.unwrap();
                }
                _ => {
                    if !store.exists(name).await.unwrap() {
                        store.insert(&FailureRecord::first_failure(name, step)).await.unwrap();
                    }
                }
            }

            let records = store.load().await.unwrap();
            let unique: HashSet<_> = records.iter().map(|r| r.identity().to_string()).collect();
            assert_eq!(unique.len(), records.len(), "duplicate after step {step}");
        }
    }

    #[tokio::test]
    async fn repeated_increments_count_up_by_one() {
        let store = InMemoryRecordStore::new();
        for (i, now) in [10u64, 11, 15, 20].into_iter().enumerate() {
            let record = store.increment_and_refresh("alice", now).await.unwrap();
            assert_eq!(record.failure_count(), i as u32 + 1);
            assert_eq!(record.last_failure(), now);
        }
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_table() {
        let store = InMemoryRecordStore::with_records(vec![FailureRecord::new("a", 1, 1)]);
        let clone = store.clone();
        store.clear().await.unwrap();
        assert!(clone.load().await.unwrap().is_empty());
    }
}
