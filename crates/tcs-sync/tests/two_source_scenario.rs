use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tcs_core::{fold_text, TournamentStatus};
use tcs_storage::{DirectoryFetcher, MemoryGateway};
use tcs_sync::{PipelineSettings, SyncPipeline};

const SETTINGS: &str = r#"
stale_miss_threshold: 2
run_timeout_secs: 30
sources:
  - source_id: fide
    kind: fide
    url: https://calendar.fide.com/calendar.php
  - source_id: federation
    kind: federation
    url: https://ruchess.ru/tournaments/
"#;

fn scenario_dir(run: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join("scenario")
        .join(run)
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, day, 6, 0, 0).single().unwrap()
}

fn pipeline(run: &str, store: &Arc<MemoryGateway>) -> SyncPipeline {
    let settings = PipelineSettings::from_yaml_str(SETTINGS).unwrap();
    settings.pipeline(Arc::new(DirectoryFetcher::new(scenario_dir(run))), store.clone())
}

#[tokio::test]
async fn matching_pair_merges_and_dropped_entry_is_archived() {
    let store = Arc::new(MemoryGateway::new());

    let first = pipeline("run1", &store).run_once_at(at(1)).await;
    assert!(first.failed_sources().is_empty(), "{first:?}");
    assert_eq!(first.source("fide").unwrap().candidates, 3);
    assert_eq!(first.source("federation").unwrap().candidates, 2);

    let records = store.snapshot().await;
    assert_eq!(records.len(), 4);
    let city = records
        .iter()
        .find(|r| r.external_id.as_deref() == Some("FIDE123"))
        .expect("merged City Open");
    assert_eq!(fold_text(&city.name), "city open");
    assert_eq!(city.claims.len(), 2);
    let city_id = city.id;
    let others = records
        .iter()
        .filter(|r| r.id != city_id)
        .map(|r| (r.id, r.content_hash.clone()))
        .collect::<Vec<_>>();

    // Re-running identical payloads changes nothing.
    let repeat = pipeline("run1", &store).run_once_at(at(2)).await;
    let totals = repeat.totals();
    assert_eq!((totals.inserted, totals.updated, totals.noop), (0, 0, 5));

    // Federation drops City Open; FIDE still lists it.
    let miss_one = pipeline("run2", &store).run_once_at(at(3)).await;
    assert!(miss_one.failed_sources().is_empty());
    let city = store.get(city_id).await.unwrap();
    assert_eq!(city.miss_count, 1);
    assert_eq!(city.status, TournamentStatus::Scheduled);

    let miss_two = pipeline("run2", &store).run_once_at(at(4)).await;
    assert_eq!(miss_two.source("federation").unwrap().archived, 1);
    let city = store.get(city_id).await.unwrap();
    assert_eq!(city.status, TournamentStatus::Cancelled);
    assert_eq!(city.external_id.as_deref(), Some("FIDE123"));

    let records = store.snapshot().await;
    assert_eq!(records.len(), 4);
    for (id, hash) in others {
        let record = records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(record.status, TournamentStatus::Scheduled);
        assert_eq!(record.content_hash, hash);
    }
}

#[tokio::test]
async fn merge_result_does_not_depend_on_source_completion_order() {
    for _ in 0..8 {
        let store = Arc::new(MemoryGateway::new());
        pipeline("run1", &store).run_once_at(at(1)).await;
        let records = store.snapshot().await;
        assert_eq!(records.len(), 4);
        assert_eq!(
            records
                .iter()
                .filter(|r| r.external_id.as_deref() == Some("FIDE123"))
                .count(),
            1
        );
    }
}
