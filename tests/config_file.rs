//! The shipped configuration file must stay loadable and match the built-in defaults.

use piezo_scan::adapters::MockAdapter;
use piezo_scan::config::ScanConfig;
use piezo_scan::scan::ScanEngine;
use piezo_scan::stage::PiezoStage;
use piezo_scan::trigger::LogTrigger;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/piezo_scan.toml")
}

#[test]
fn shipped_config_matches_defaults() {
    let config = ScanConfig::load_from(shipped_config()).unwrap();
    assert_eq!(config, ScanConfig::default());
}

#[tokio::test(start_paused = true)]
async fn engine_builds_from_shipped_config() {
    let config = ScanConfig::load_from(shipped_config()).unwrap();
    let mut engine = ScanEngine::from_config(PiezoStage::new(MockAdapter::new()), LogTrigger, &config);
    engine.reset_triggers().await.unwrap();
    let report = engine
        .scan_line(
            config.axes.fast,
            &[0.0, 0.5],
            config.timing.min_dwell(),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.commanded, vec![0.0, 0.5]);
}
