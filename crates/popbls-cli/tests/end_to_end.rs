use std::sync::Arc;

use popbls_analytics::{AnalyticsConsumer, AnalyticsSettings, InProcessQueue, NotifyingStore};
use popbls_core::{PipelineConfig, StoreBackend};
use popbls_sources::{MemoryRemoteTree, StaticPopulationSource};
use popbls_storage::{ContentStore, FsContentStore};
use popbls_sync::IngestionPipeline;
use serde_json::json;

const BLS_DATA: &str = "series_id        \tyear\tperiod\t       value\tfootnote_codes\n\
                        PRS30006032      \t2013\tQ01\t  10\t\n\
                        PRS30006032      \t2014\tQ01\t  12\t\n\
                        PRS30006011      \t2013\tQ01\t   1\t\n\
                        PRS30006011      \t2020\tQ01\t   9\t\n";

fn config(root: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        bucket: Some("test-bucket".into()),
        store_backend: StoreBackend::Fs,
        store_root: root.to_path_buf(),
        mirror_base_url: "http://mirror.local/pub/time.series/".into(),
        mirror_sync_enabled: true,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn ingest_relay_and_analytics_in_one_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());

    let base: Arc<dyn ContentStore> =
        Arc::new(FsContentStore::new(config.bucket_name(), dir.path()));
    let queue = Arc::new(InProcessQueue::new());
    let store: Arc<dyn ContentStore> = Arc::new(NotifyingStore::new(
        base.clone(),
        queue.clone(),
        config.population_prefix.clone(),
    ));

    let tree = MemoryRemoteTree::new();
    tree.insert(
        format!("{}pr.data.0.Current", config.mirror_root_url()),
        BLS_DATA.as_bytes().to_vec(),
    )
    .await;
    let source = StaticPopulationSource::new(json!({
        "data": [
            {"Nation": "United States", "Year": 2013, "Population": 316},
            {"Nation": "United States", "Year": 2014, "Population": 319},
            {"Nation": "United States", "Year": 2018, "Population": 327},
            {"Nation": "United States", "Year": 2019}
        ]
    }));

    let settings = AnalyticsSettings::from(&config);
    let pipeline = IngestionPipeline::new(config, store, Arc::new(tree), Arc::new(source));

    let first = pipeline.run_once().await.expect("first run");
    assert!(!first.population.deduplicated);
    assert_eq!(
        first.mirror.as_ref().expect("mirror report").keys,
        vec!["bls-folder/pr/pr.data.0.Current".to_string()]
    );
    assert!(dir.path().join("bls-folder/pr/pr.data.0.Current").is_file());

    // Only the population write is under the notified prefix.
    assert_eq!(queue.ready_len().await, 1);

    let consumer = AnalyticsConsumer::new(base, settings);
    let drained = consumer.drain(queue.as_ref(), 10).await.expect("drain");
    assert_eq!(drained.acked, 1);
    assert_eq!(drained.reports.len(), 1);

    let report = &drained.reports[0];
    assert_eq!(report.population_key, first.population.key);
    assert_eq!(report.population_stats.count, 3);
    assert!((report.population_stats.mean.expect("mean") - 320.67).abs() < 0.01);

    let best: Vec<_> = report
        .best_years
        .iter()
        .map(|b| (b.series_id.as_str(), b.year))
        .collect();
    assert_eq!(best, vec![("PRS30006011", 2020), ("PRS30006032", 2014)]);

    let joined: Vec<_> = report
        .joined
        .iter()
        .map(|r| (r.year, r.value, r.population))
        .collect();
    assert_eq!(joined, vec![(2013, 10.0, 316), (2014, 12.0, 319)]);

    // Same content, same day: nothing new is written, so nothing is relayed.
    let second = pipeline.run_once().await.expect("second run");
    assert!(second.population.deduplicated);
    assert_eq!(second.population.key, first.population.key);
    assert_eq!(second.mirror.expect("mirror report").uploaded, 0);
    assert_eq!(queue.ready_len().await, 0);
}
