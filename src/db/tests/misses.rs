use crate::db::*;
use tempfile::NamedTempFile;

async fn record(db: &Database, missing: &[u64]) {
    db.save_window(
        &WindowCommit {
            group: "g",
            parts: &[],
            missing,
            cursor: None,
        },
        100,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_misses_are_recorded_once() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    record(&db, &[5, 3, 9]).await;
    record(&db, &[3]).await;

    let pending = db.pending_misses("g", 10).await.unwrap();
    assert_eq!(
        pending.iter().map(|m| m.message).collect::<Vec<_>>(),
        vec![3, 5, 9]
    );
    assert!(pending.iter().all(|m| m.attempts == 0));

    db.close().await;
}

#[tokio::test]
async fn test_settle_misses_forgets_found_and_expires_after_limit() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    record(&db, &[1, 2, 3]).await;

    // First retry: 1 recovered, 2 and 3 still missing
    let dropped = db.settle_misses("g", &[1], &[2, 3], 2).await.unwrap();
    assert_eq!(dropped, 0);
    let pending = db.pending_misses("g", 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|m| m.attempts == 1));

    // Second retry reaches the limit
    let dropped = db.settle_misses("g", &[], &[2, 3], 2).await.unwrap();
    assert_eq!(dropped, 2);
    assert_eq!(db.count_misses("g").await.unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn test_misses_are_scoped_by_group() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    record(&db, &[1]).await;
    db.save_window(
        &WindowCommit {
            group: "other",
            parts: &[],
            missing: &[1, 2],
            cursor: None,
        },
        100,
    )
    .await
    .unwrap();

    db.settle_misses("other", &[1, 2], &[], 3).await.unwrap();
    assert_eq!(db.count_misses("other").await.unwrap(), 0);
    assert_eq!(db.count_misses("g").await.unwrap(), 1);

    db.close().await;
}
