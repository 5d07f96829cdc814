//! Tests for exchange configuration.

use ironexchange::{ExchangeBuffer, ExchangeConfig, ExchangeError, ExchangeSinkHandler};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_defaults_are_valid() {
    let config = ExchangeConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.max_buffer_rows, None);
    assert_eq!(config.max_buffer_bytes, Some(16 * 1024 * 1024));
    assert_eq!(config.low_water_percent, 50);
    assert_eq!(config.inactive_sink_timeout, Duration::from_secs(300));
}

#[test]
fn test_low_water_marks() {
    let config = ExchangeConfig::with_row_capacity(10).with_max_buffer_bytes(Some(1000));
    assert_eq!(config.low_water_rows(), Some(5));
    assert_eq!(config.low_water_bytes(), Some(500));

    let config = config.with_low_water_percent(0);
    assert_eq!(config.low_water_rows(), Some(0));
    assert_eq!(ExchangeConfig::with_row_capacity(3).low_water_bytes(), None);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let unbounded = ExchangeConfig::default().with_max_buffer_bytes(None);
    assert!(matches!(unbounded.validate(), Err(ExchangeError::InvalidConfig(_))));

    let zero = ExchangeConfig::with_row_capacity(0);
    assert!(zero.validate().is_err());

    let percent = ExchangeConfig::with_row_capacity(4).with_low_water_percent(101);
    assert!(percent.validate().is_err());

    // handlers refuse to start with a bad config
    assert!(ExchangeBuffer::new("bad", &zero).is_err());
    assert!(ExchangeSinkHandler::new("bad", &percent).is_err());
}

#[test]
fn test_from_json_str_fills_defaults() -> anyhow::Result<()> {
    let config = ExchangeConfig::from_json_str(r#"{"max_buffer_rows": 128, "inactive_sink_timeout": 1500}"#)?;
    assert_eq!(config.max_buffer_rows, Some(128));
    assert_eq!(config.max_buffer_bytes, Some(16 * 1024 * 1024));
    assert_eq!(config.inactive_sink_timeout, Duration::from_millis(1500));
    Ok(())
}

#[test]
fn test_from_json_str_validates() {
    let err = ExchangeConfig::from_json_str(r#"{"low_water_percent": 150}"#).unwrap_err();
    assert!(err.to_string().contains("low_water_percent"));
    assert!(ExchangeConfig::from_json_str("{not json").is_err());
}

#[test]
fn test_from_json_file_roundtrip() -> anyhow::Result<()> {
    let config = ExchangeConfig::with_row_capacity(256)
        .with_low_water_percent(30)
        .with_inactive_sink_timeout(Duration::from_secs(42));
    let mut file = NamedTempFile::new()?;
    file.write_all(serde_json::to_string_pretty(&config)?.as_bytes())?;

    let loaded = ExchangeConfig::from_json_file(file.path())?;
    assert_eq!(loaded, config);
    Ok(())
}

#[test]
fn test_from_json_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("exchange.json");
    let err = ExchangeConfig::from_json_file(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("exchange.json"));
}
