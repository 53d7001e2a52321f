//! Configuration, rules and NZB fixtures

use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use usenet_indexer::config::{CategoryConfig, CategoryRule, RetryConfig};
use usenet_indexer::db::NewRegexRule;
use usenet_indexer::release::{NoopHandoff, StaticClassifier};
use usenet_indexer::{Config, Database, Indexer};

use super::FakeNewsServer;

pub const GROUP: &str = "alt.binaries.teevee";

/// Binary rule for `[n/N] - "name.partNN.rar" yEnc` style subjects
pub const VOLUME_RULE: &str = r#"/^\[(?P<parts>\d+\/\d+)\] - "(?P<name>.+?)\.part\d+\.\w+"/i"#;

/// Hand-written NZB with a `title` meta and two files
pub const TITLED_NZB: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">Old.Show.S03E07.720p</meta>
  </head>
  <file poster="someone@example.com" date="1700000000" subject="Old.Show.S03E07.720p.part01.rar (1/2)">
    <groups>
      <group>alt.binaries.teevee</group>
    </groups>
    <segments>
      <segment bytes="500" number="1">old-1@example.com</segment>
      <segment bytes="250" number="2">old-2@example.com</segment>
    </segments>
  </file>
  <file poster="someone@example.com" date="1700000100" subject="Old.Show.S03E07.720p.part02.rar (1/1)">
    <groups>
      <group>alt.binaries.teevee</group>
    </groups>
    <segments>
      <segment bytes="100" number="1">old-3@example.com</segment>
    </segments>
  </file>
</nzb>"#;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.scan.message_scan_limit = 5;
    config.scan.group_scan_limit = None;
    config.categories = CategoryConfig {
        default_id: 7010,
        default_name: "Misc".to_string(),
        rules: vec![CategoryRule {
            pattern: r"/S\d{2}E\d{2}/i".to_string(),
            group_prefix: Some("alt.binaries.teevee".to_string()),
            id: 5040,
            name: "TV HD".to_string(),
        }],
    };
    config
}

/// Indexer over a fresh database with `GROUP` registered and `VOLUME_RULE` loaded
pub async fn indexer(server: &FakeNewsServer, config: Config) -> (Indexer, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    db.add_group(GROUP).await.unwrap();
    db.insert_regex(&NewRegexRule {
        group_name: "alt.binaries.*".to_string(),
        pattern: VOLUME_RULE.to_string(),
        description: Some("volume sets".to_string()),
        ordinal: 1,
        enabled: true,
        category_id: None,
    })
    .await
    .unwrap();

    let classifier = StaticClassifier::from_config(&config.categories).unwrap();
    let indexer = Indexer::from_parts(
        db,
        config,
        Arc::new(server.clone()),
        Arc::new(classifier),
        Arc::new(NoopHandoff),
    );
    (indexer, temp_file)
}
