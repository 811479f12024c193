//! Configuration loading: TOML files, environment overrides and validation.

use daq_readout::config::AppConfig;
use daq_readout::logging::LoggingConfig;
use daq_readout::{DeliveryMode, ReadoutError};
use std::path::Path;
use std::time::Duration;

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("readout.toml");
    std::fs::write(&path, contents).expect("Failed to write config");
    path
}

#[test]
fn test_bundled_sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/readout.toml");
    let config = AppConfig::load_from(&path).expect("Failed to load sample config");
    config.validate().expect("Sample config should validate");

    assert_eq!(config.readout.resolved_fragment_ids(), vec![0, 1]);
    assert_eq!(config.simulator.seed, Some(42));
    assert!(LoggingConfig::from_section(&config.logging).is_ok());
}

#[test]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        request_mode = "single"
        fragment_id = 9
        data_buffer_depth_fragments = 50
        "#,
    );

    // Only this test touches the variable
    std::env::set_var("DAQ_READOUT_READOUT__DATA_BUFFER_DEPTH_FRAGMENTS", "75");
    let loaded = AppConfig::load_from(&path);
    std::env::remove_var("DAQ_READOUT_READOUT__DATA_BUFFER_DEPTH_FRAGMENTS");

    let config = loaded.unwrap();
    assert_eq!(config.readout.request_mode, DeliveryMode::Single);
    assert_eq!(config.readout.data_buffer_depth_fragments, 75);
    assert_eq!(config.readout.resolved_fragment_ids(), vec![9]);
}

#[test]
fn test_defaults_fill_missing_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        fragment_id = 1
        "#,
    );

    let config = AppConfig::load_from(&path).unwrap();
    assert_eq!(config.readout.request_mode, DeliveryMode::Ignored);
    assert!(config.readout.separate_data_thread);
    assert!(!config.readout.circular_buffer_mode);
    assert_eq!(config.readout.hardware_poll_interval, Duration::from_secs(1));
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.simulator.tick_period, Duration::from_millis(1));
    assert!(config.validate().is_ok());
}

#[test]
fn test_request_mode_without_data_thread_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        request_mode = "window"
        separate_data_thread = false
        fragment_id = 1
        "#,
    );

    let config = AppConfig::load_from(&path).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ReadoutError::Configuration(_)));
    assert!(err.to_string().contains("separate_data_thread"));
}

#[test]
fn test_unknown_request_mode_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        request_mode = "sometimes"
        fragment_id = 1
        "#,
    );

    let err = AppConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, ReadoutError::Config(_)));
}

#[test]
fn test_bad_duration_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        fragment_id = 1
        window_close_timeout = "soon"
        "#,
    );

    assert!(AppConfig::load_from(&path).is_err());
}

#[test]
fn test_resolved_config_round_trips_through_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [readout]
        request_mode = "buffer"
        fragment_ids = [2, 3]
        stale_fragment_timeout = 500
        "#,
    );
    let config = AppConfig::load_from(&path).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed: AppConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(reparsed.readout, config.readout);
    assert_eq!(reparsed.simulator, config.simulator);
}
