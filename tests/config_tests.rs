// Config loading and validation tests

use apm_collector::config::AppConfig;
use apm_collector::rollup_schedule::NEVER_EXPIRE_HOURS;

const VALID_CONFIG: &str = r#"
[server]
port = 8080
host = "0.0.0.0"

[collector]
port = 8181

[database]
path = "data/collector.db"
max_pool_size = 10
trace_retention_hours = 72

[rollup]
interval_secs = 15
vacuum_schedule = "0 0 3 * * *"

[[rollup.levels]]
capture_interval_millis = 60000
view_threshold_millis = 3600000
expiration_hours = 48

[[rollup.levels]]
capture_interval_millis = 300000
expiration_hours = 4294967295

[agent]
id = "prod::web-1"
"#;

const MINIMAL_CONFIG: &str = r#"
[server]
port = 8080
host = "127.0.0.1"

[database]
path = "data/collector.db"
max_pool_size = 4
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.collector.port, 8181);
    assert_eq!(config.collector.host, "0.0.0.0");
    assert_eq!(config.database.trace_retention_hours, 72);
    assert_eq!(config.rollup.interval_secs, 15);
    assert_eq!(config.rollup.vacuum_schedule.as_deref(), Some("0 0 3 * * *"));
    assert_eq!(config.agent.id.as_deref(), Some("prod::web-1"));

    let schedule = config.rollup_schedule().unwrap();
    assert_eq!(schedule.max_level(), 1);
    assert_eq!(schedule.expiration_millis(0), Some(48 * 3_600_000));
    assert_eq!(schedule.level(1).unwrap().expiration_hours, NEVER_EXPIRE_HOURS);
    assert_eq!(schedule.expiration_millis(1), None);
}

#[test]
fn test_config_defaults() {
    let config = AppConfig::load_from_str(MINIMAL_CONFIG).expect("load_from_str");
    assert_eq!(config.collector.port, 8181);
    assert_eq!(config.database.trace_retention_hours, 24 * 7);
    assert!(config.rollup.vacuum_schedule.is_none());
    assert_eq!(config.rollup_schedule().unwrap().levels().len(), 4);
    assert_eq!(config.agent.id, None);
}

#[test]
fn test_config_validation_rejects_invalid_port() {
    let bad = VALID_CONFIG.replace("port = 8080", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("server.port"));
}

#[test]
fn test_config_validation_rejects_invalid_collector_port() {
    let bad = VALID_CONFIG.replace("port = 8181", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("collector.port"));
}

#[test]
fn test_config_validation_rejects_empty_db_path() {
    let bad = VALID_CONFIG.replace("path = \"data/collector.db\"", "path = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("database.path"));
}

#[test]
fn test_config_validation_rejects_max_pool_size_zero() {
    let bad = VALID_CONFIG.replace("max_pool_size = 10", "max_pool_size = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("max_pool_size"));
}

#[test]
fn test_config_validation_rejects_rollup_interval_zero() {
    let bad = VALID_CONFIG.replace("interval_secs = 15", "interval_secs = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.interval_secs"));
}

#[test]
fn test_config_validation_rejects_non_multiple_levels() {
    let bad = VALID_CONFIG.replace("capture_interval_millis = 300000", "capture_interval_millis = 90000");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.levels"));
    assert!(err.to_string().contains("multiple"));
}

#[test]
fn test_config_validation_rejects_zero_expiration() {
    let bad = VALID_CONFIG.replace("expiration_hours = 48", "expiration_hours = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.levels[0].expiration_hours"));
}
