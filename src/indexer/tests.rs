use super::*;
use crate::aggregate::{Blacklist, aggregate};
use crate::config::{CategoryConfig, CategoryRule, RetryConfig};
use crate::db::{NewRegexRule, WindowCommit};
use crate::nntp::test_helpers::MockServer;
use crate::nzb::{NzbDocument, NzbFile, NzbSegment};
use crate::release::StaticClassifier;
use crate::types::OverviewRecord;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

const GROUP: &str = "alt.binaries.test";

fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.scan.update_threads = 2;
    config.scan.group_scan_limit = None;
    config
}

fn classifier() -> StaticClassifier {
    StaticClassifier::from_config(&CategoryConfig {
        default_id: 7010,
        default_name: "Misc".to_string(),
        rules: vec![CategoryRule {
            pattern: r"/S\d{2}E\d{2}/i".to_string(),
            group_prefix: None,
            id: 5040,
            name: "TV HD".to_string(),
        }],
    })
    .unwrap()
}

async fn indexer(server: &MockServer, config: Config) -> (Indexer, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let indexer = Indexer::from_parts(
        db,
        config,
        Arc::new(server.clone()),
        Arc::new(classifier()),
        Arc::new(NoopHandoff),
    );
    (indexer, temp_file)
}

async fn add_rule(indexer: &Indexer) {
    indexer
        .database()
        .insert_regex(&NewRegexRule {
            group_name: "*".to_string(),
            pattern: r#"/^\[(?P<parts>\d+\/\d+)\] - "(?P<name>.+?)\.part\d+\.\w+"/i"#.to_string(),
            description: None,
            ordinal: 1,
            enabled: true,
            category_id: None,
        })
        .await
        .unwrap();
}

fn record(article: u64, subject: &str, posted: i64, bytes: u64) -> OverviewRecord {
    OverviewRecord {
        article,
        subject: subject.to_string(),
        poster: "poster@example.com".to_string(),
        date: Some(Utc.timestamp_opt(posted, 0).unwrap()),
        message_id: format!("<{article}@example.com>"),
        bytes,
        xref: format!("news.example.com {GROUP}:{article}"),
    }
}

/// A two-volume post whose articles start at `first`
fn post_release(server: &MockServer, name: &str, first: u64, posted: i64) {
    server.add_group(GROUP);
    server.add_record(
        GROUP,
        record(first, &format!(r#"[1/2] - "{name}.part1.rar" yEnc (1/2)"#), posted, 400),
    );
    server.add_record(
        GROUP,
        record(first + 1, &format!(r#"[1/2] - "{name}.part1.rar" yEnc (2/2)"#), posted, 100),
    );
    server.add_record(
        GROUP,
        record(first + 2, &format!(r#"[2/2] - "{name}.part2.rar" yEnc (1/1)"#), posted, 50),
    );
}

fn document(name: &str, group: &str) -> Vec<u8> {
    nzb::encode(&NzbDocument {
        name: name.to_string(),
        category: "TV HD".to_string(),
        files: vec![NzbFile {
            subject: format!(r#""{name}.part1.rar" yEnc"#),
            total_segments: 2,
            poster: "poster@example.com".to_string(),
            date: 1_709_294_400,
            groups: vec![group.to_string()],
            segments: vec![
                NzbSegment {
                    number: 1,
                    bytes: 700,
                    message_id: "a1@example.com".to_string(),
                },
                NzbSegment {
                    number: 2,
                    bytes: 300,
                    message_id: "a2@example.com".to_string(),
                },
            ],
        }],
    })
    .unwrap()
}

#[tokio::test]
async fn update_cycle_turns_new_posts_into_releases() {
    let server = MockServer::new();
    post_release(&server, "My.Show.S01E01", 1, Utc::now().timestamp() - 600);

    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();
    add_rule(&indexer).await;

    let report = indexer.update_cycle(None).await.unwrap();

    assert_eq!(report.scan.completed.len(), 1);
    assert!(report.scan.failed.is_empty());
    assert_eq!(report.assembled.processed, 2);
    assert_eq!(report.finalized.created, 1);

    let db = indexer.database();
    let release = db.find_release_by_name("My.Show.S01E01").await.unwrap().unwrap();
    assert_eq!(release.category_id, 5040);
    assert_eq!(release.size, 550);
    assert_eq!(db.count_binaries().await.unwrap(), 0);
    assert_eq!(indexer.group_info(GROUP).await.unwrap().last, Some(3));
}

#[tokio::test]
async fn second_cycle_only_reads_new_articles() {
    let server = MockServer::new();
    let posted = Utc::now().timestamp() - 600;
    post_release(&server, "First.Release", 1, posted);

    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();
    add_rule(&indexer).await;
    indexer.update_cycle(Some(GROUP)).await.unwrap();

    post_release(&server, "Second.Release", 4, posted);
    let report = indexer.update_cycle(Some(GROUP)).await.unwrap();

    assert_eq!(report.scan.completed[0].received, 3);
    assert_eq!(report.finalized.created, 1);
    assert_eq!(indexer.database().count_releases().await.unwrap(), 2);
    assert_eq!(indexer.group_info(GROUP).await.unwrap().last, Some(6));
}

#[tokio::test]
async fn update_of_unknown_group_is_not_found() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;

    let err = indexer.update_cycle(Some("alt.binaries.nope")).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn inactive_groups_are_skipped() {
    let server = MockServer::new();
    post_release(&server, "My.Show.S01E01", 1, Utc::now().timestamp() - 600);

    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();
    indexer.set_group_active(GROUP, false).await.unwrap();

    let report = indexer.update_cycle(None).await.unwrap();
    assert!(report.scan.completed.is_empty());
    assert!(server.overview_calls().is_empty());
}

#[tokio::test]
async fn run_update_returns_once_cancelled() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;

    indexer.shutdown();
    tokio::time::timeout(Duration::from_secs(5), indexer.run_update(None))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn import_creates_an_imported_release() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();

    let data = document("Imported.Show.S02E03", GROUP);
    let id = indexer.import_nzb(&data).await.unwrap();

    let db = indexer.database();
    let release = db.get_release(&id).await.unwrap().unwrap();
    assert_eq!(release.name, "Imported.Show.S02E03");
    assert_eq!(release.status, ReleaseStatus::Imported.to_i32());
    assert_eq!(release.category_id, 5040);
    assert_eq!(release.total_parts, 1);
    assert_eq!(release.size, 1000);
    assert_eq!(release.posted, 1_709_294_400);

    let stored = db.get_release_nzb(&id).await.unwrap().unwrap();
    assert_eq!(nzb::decode(&stored).unwrap().name, "Imported.Show.S02E03");

    let err = indexer.import_nzb(&data).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert_eq!(db.count_releases().await.unwrap(), 1);
}

#[tokio::test]
async fn import_into_unknown_group_is_rejected() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;

    let err = indexer
        .import_nzb(&document("Some.Release", "alt.binaries.unknown"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn import_path_reads_nzb_files_in_a_directory() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.nzb.gz"), document("First.Release", GROUP)).unwrap();
    std::fs::write(
        dir.path().join("b.nzb"),
        nzb::decompress(&document("Second.Release", GROUP)).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.path().join("c.nzb"), b"<nzb><file>").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let report = indexer.import_path(dir.path()).await.unwrap();

    assert_eq!(report.imported.len(), 2);
    assert_eq!(report.rejected.len(), 1);
    assert!(report.rejected[0].0.ends_with("c.nzb"));
    assert_eq!(indexer.database().count_releases().await.unwrap(), 2);
}

#[tokio::test]
async fn import_file_stores_the_compressed_document() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;
    indexer.add_group(GROUP).await.unwrap();

    let dir = TempDir::new().unwrap();
    let gzipped = document("Streamed.Release", GROUP);
    let plain = nzb::decompress(&gzipped).unwrap();
    std::fs::write(dir.path().join("streamed.nzb.gz"), &gzipped).unwrap();
    std::fs::write(
        dir.path().join("plain.nzb"),
        nzb::decompress(&document("Plain.Release", GROUP)).unwrap(),
    )
    .unwrap();

    let id = indexer
        .import_file(&dir.path().join("streamed.nzb.gz"))
        .await
        .unwrap();
    let db = indexer.database();
    let stored = db.get_release_nzb(&id).await.unwrap().unwrap();
    assert_eq!(stored, gzipped);
    assert_eq!(nzb::decompress(&stored).unwrap(), plain);

    let id = indexer.import_file(&dir.path().join("plain.nzb")).await.unwrap();
    let stored = db.get_release_nzb(&id).await.unwrap().unwrap();
    assert_eq!(nzb::decode(&stored).unwrap().name, "Plain.Release");

    let err = indexer
        .import_file(&dir.path().join("missing.nzb"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[tokio::test]
async fn reap_deletes_old_unmatched_parts() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;
    let db = indexer.database();
    db.add_group(GROUP).await.unwrap();

    let old = Utc::now().timestamp() - 3 * 86_400;
    let recent = Utc::now().timestamp() - 60;
    let records = [
        record(1, r#""old.bin" yEnc (1/1)"#, old, 10),
        record(2, r#""new.bin" yEnc (1/1)"#, recent, 10),
    ];
    let parts: Vec<_> = aggregate(GROUP, &records, &Blacklist::default())
        .parts
        .into_values()
        .collect();
    db.save_window(
        &WindowCommit {
            group: GROUP,
            parts: &parts,
            missing: &[],
            cursor: None,
        },
        100,
    )
    .await
    .unwrap();

    assert_eq!(indexer.reap().await.unwrap(), (1, 0));
    assert_eq!(db.count_unassigned_parts().await.unwrap(), 1);
}

#[tokio::test]
async fn reap_is_disabled_at_zero_days() {
    let server = MockServer::new();
    let mut config = test_config();
    config.scan.dead_binary_age_days = 0;
    let (indexer, _temp) = indexer(&server, config).await;

    assert_eq!(indexer.reap().await.unwrap(), (0, 0));
}

#[tokio::test]
async fn group_management_reports_unknown_groups() {
    let server = MockServer::new();
    let (indexer, _temp) = indexer(&server, test_config()).await;

    assert!(matches!(
        indexer.remove_group("alt.nope").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        indexer.reset_group("alt.nope").await.unwrap_err(),
        Error::NotFound(_)
    ));

    indexer.add_group(GROUP).await.unwrap();
    indexer.set_group_active(GROUP, false).await.unwrap();
    assert!(indexer.list_groups(true).await.unwrap().is_empty());
    assert_eq!(indexer.list_groups(false).await.unwrap().len(), 1);

    indexer.remove_group(GROUP).await.unwrap();
    assert!(indexer.list_groups(false).await.unwrap().is_empty());
}

#[test]
fn nzb_paths_are_recognized() {
    assert!(is_nzb_path(Path::new("/tmp/a.nzb")));
    assert!(is_nzb_path(Path::new("/tmp/A.NZB.GZ")));
    assert!(!is_nzb_path(Path::new("/tmp/a.nzb.txt")));
    assert!(!is_nzb_path(Path::new("/tmp/nzb")));
}
