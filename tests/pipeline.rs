//! End-to-end pipeline tests against an in-memory news server

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use usenet_indexer::{Error, ReleaseStatus, nzb};

#[tokio::test]
async fn scanned_posts_become_releases_with_nzbs() {
    let server = FakeNewsServer::new();
    let posted = Utc::now().timestamp() - 3600;
    let next = server.post_rar_set(GROUP, "Big.Show.S01E01.720p", 3, 2, 1, posted);
    server.post_rar_set(GROUP, "Some.Album", 2, 1, next, posted);

    let (indexer, _temp) = indexer(&server, test_config()).await;
    let report = indexer.update_cycle(None).await.unwrap();

    assert_eq!(report.scan.completed.len(), 1);
    let summary = &report.scan.completed[0];
    assert_eq!(summary.windows, 2);
    assert_eq!(summary.received, 8);
    assert_eq!(report.finalized.created, 2);

    let db = indexer.database();
    assert_eq!(db.count_binaries().await.unwrap(), 0);
    assert_eq!(db.count_unassigned_parts().await.unwrap(), 0);

    let show = db
        .find_release_by_name("Big.Show.S01E01.720p")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(show.category_id, 5040);
    assert_eq!(show.total_parts, 3);
    assert_eq!(show.size, 6000);
    assert_eq!(show.posted, posted);
    assert_eq!(show.status, ReleaseStatus::New.to_i32());

    let document = nzb::decode(&db.get_release_nzb(&show.id).await.unwrap().unwrap()).unwrap();
    assert_eq!(document.name, "Big.Show.S01E01.720p");
    assert_eq!(document.category(), Some("TV HD"));
    assert_eq!(document.file_count(), 3);
    assert_eq!(document.total_bytes(), 6000);
    for file in &document.files {
        assert_eq!(file.groups, vec![GROUP.to_string()]);
        assert_eq!(file.segment_count, 2);
        assert_eq!(file.poster, "uploader@example.com");
    }

    let album = db.find_release_by_name("Some.Album").await.unwrap().unwrap();
    assert_eq!(album.category_id, 7010);
    assert_eq!(album.total_parts, 2);
}

#[tokio::test]
async fn binaries_complete_across_cycles() {
    let server = FakeNewsServer::new();
    let posted = Utc::now().timestamp() - 3600;
    let (indexer, _temp) = indexer(&server, test_config()).await;

    // First two of three volumes
    for (article, volume) in [(1u64, 1u32), (2, 2)] {
        server.post(
            GROUP,
            article,
            &format!(r#"[{volume}/3] - "Slow.Upload.part0{volume}.rar" yEnc (1/1)"#),
            Utc.timestamp_opt(posted, 0).unwrap(),
            1000,
        );
    }
    let report = indexer.update_cycle(None).await.unwrap();
    assert_eq!(report.finalized.created, 0);
    assert_eq!(indexer.database().count_binaries().await.unwrap(), 1);

    server.post(
        GROUP,
        3,
        r#"[3/3] - "Slow.Upload.part03.rar" yEnc (1/1)"#,
        Utc.timestamp_opt(posted, 0).unwrap(),
        1000,
    );
    let report = indexer.update_cycle(None).await.unwrap();
    assert_eq!(report.scan.completed[0].received, 1);
    assert_eq!(report.finalized.created, 1);

    let release = indexer
        .database()
        .find_release_by_name("Slow.Upload")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(release.total_parts, 3);
    assert_eq!(indexer.database().count_binaries().await.unwrap(), 0);
}

#[tokio::test]
async fn backfill_reaches_posts_older_than_the_new_group_window() {
    let server = FakeNewsServer::new();
    let old = (Utc::now() - Duration::days(5)).timestamp();
    let recent = Utc::now().timestamp() - 3600;
    let next = server.post_rar_set(GROUP, "Old.Post", 2, 2, 1, old);
    server.post_rar_set(GROUP, "New.Post", 2, 2, next, recent);

    let mut config = test_config();
    config.scan.new_group_scan_days = 1;
    let (indexer, _temp) = indexer(&server, config).await;

    let report = indexer.update_cycle(None).await.unwrap();
    assert_eq!(report.finalized.created, 1);
    let group = indexer.group_info(GROUP).await.unwrap();
    assert_eq!((group.first, group.last), (Some(5), Some(8)));

    let report = indexer
        .backfill(Some(GROUP), Some(Utc::now() - Duration::days(10)))
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].received, 4);

    let (_, finalized) = indexer.process().await.unwrap();
    assert_eq!(finalized.created, 1);

    let db = indexer.database();
    assert!(db.find_release_by_name("Old.Post").await.unwrap().is_some());
    assert!(db.find_release_by_name("New.Post").await.unwrap().is_some());
    assert_eq!(indexer.group_info(GROUP).await.unwrap().first, Some(1));
}

#[tokio::test]
async fn backfill_before_first_update_is_refused() {
    let server = FakeNewsServer::new();
    server.post_rar_set(GROUP, "Any.Post", 1, 1, 1, Utc::now().timestamp());
    let (indexer, _temp) = indexer(&server, test_config()).await;

    let report = indexer.backfill(Some(GROUP), None).await.unwrap();
    assert!(report.completed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, GROUP);
}

#[tokio::test]
async fn imported_nzb_round_trips_and_blocks_duplicates() {
    let server = FakeNewsServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;

    let id = indexer.import_nzb(TITLED_NZB.as_bytes()).await.unwrap();

    let db = indexer.database();
    let release = db.get_release(&id).await.unwrap().unwrap();
    assert_eq!(release.name, "Old.Show.S03E07.720p");
    assert_eq!(release.search_name, "Old Show S03E07 720p");
    assert_eq!(release.status, ReleaseStatus::Imported.to_i32());
    assert_eq!(release.category_id, 5040);
    assert_eq!(release.total_parts, 2);
    assert_eq!(release.size, 850);
    assert_eq!(release.posted, 1_700_000_000);

    // Stored compressed, decodes to the same document
    let stored = db.get_release_nzb(&id).await.unwrap().unwrap();
    assert_eq!(&stored[..2], &[0x1f, 0x8b]);
    assert_eq!(
        nzb::decompress(&stored).unwrap(),
        TITLED_NZB.as_bytes().to_vec()
    );

    let err = indexer.import_nzb(TITLED_NZB.as_bytes()).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert_eq!(server.sessions(), 0);
}

#[tokio::test]
async fn removing_a_group_with_releases_is_refused() {
    let server = FakeNewsServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.import_nzb(TITLED_NZB.as_bytes()).await.unwrap();

    assert!(indexer.remove_group(GROUP).await.is_err());
    assert!(indexer.group_info(GROUP).await.is_ok());
}
