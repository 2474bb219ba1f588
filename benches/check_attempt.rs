use connguard::{
    Attempt, AttemptChecker, AuthOutcome, FileLock, FileRecordStore, InMemoryRecordStore,
    LocalLock, RecordStore, StorePaths, ThrottleConfig,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn check_attempt_in_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let checker =
        AttemptChecker::new(InMemoryRecordStore::new(), LocalLock::new(), ThrottleConfig::new(5, 10));
    let fail = Attempt::new("alice", false, AuthOutcome::Failure);
    let ok = Attempt::new("alice", false, AuthOutcome::Success);

    c.bench_function("check_attempt_in_memory_fail_then_clear", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(checker.check_attempt(black_box(&fail)).await);
            let _ = black_box(checker.check_attempt(black_box(&ok)).await);
        });
    });
}

fn check_attempt_file_backed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());

    let checker = rt.block_on(async {
        let store = FileRecordStore::open(paths.clone()).await.unwrap();
        // A populated table, as on a busy server.
        for i in 0..200u32 {
            store
                .insert(&connguard::FailureRecord::new(format!("user{i}"), 1, 1))
                .await
                .unwrap();
        }
        AttemptChecker::new(store, FileLock::new(&paths), ThrottleConfig::new(5, 10))
    });
    let fail = Attempt::new("alice", false, AuthOutcome::Failure);
    let ok = Attempt::new("alice", false, AuthOutcome::Success);

    c.bench_function("check_attempt_file_fail_then_clear", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(checker.check_attempt(black_box(&fail)).await);
            let _ = black_box(checker.check_attempt(black_box(&ok)).await);
        });
    });
}

criterion_group!(benches, check_attempt_in_memory, check_attempt_file_backed);
criterion_main!(benches);
