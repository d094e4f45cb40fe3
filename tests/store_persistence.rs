//! Exercises `Store::open` against a real on-disk file instead of the
//! `:memory:` path every other test in this crate uses, since an in-memory
//! connection can't prove migrations and data actually survive a reopen of
//! the same database file.

use convoy_memory::clock::SystemClock;
use convoy_memory::message::{AppendMessageInput, MessageLog};
use convoy_memory::Store;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn reopening_the_same_file_keeps_migrations_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("convoy.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let thread_id = Uuid::now_v7();
    {
        let store = Store::open(&db_path, 1).await.unwrap();
        let log = MessageLog::new(store, Arc::new(SystemClock));
        log.ensure_thread(thread_id, None).await.unwrap();
        log.append(AppendMessageInput {
            thread_id,
            raw_content: "persisted across reopen".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    }
    // `store` (and its pool) is dropped here; nothing but the file on disk
    // carries state into the next `Store::open`.

    let store = Store::open(&db_path, 1).await.unwrap();
    let log = MessageLog::new(store, Arc::new(SystemClock));
    assert_eq!(log.count(thread_id).await.unwrap(), 1);
    let thread = log.get_thread(thread_id).await.unwrap().unwrap();
    assert_eq!(thread.id, thread_id);
}

#[tokio::test]
async fn open_rejects_unwritable_directory_as_storage_error() {
    use convoy_memory::error::CoreError;

    let dir = tempfile::tempdir().unwrap();
    let missing_parent = dir.path().join("no-such-subdir").join("convoy.db");
    let result = Store::open(missing_parent.to_str().unwrap(), 1).await;

    assert!(matches!(result, Err(CoreError::Storage(_))));
}
