//! Config 单元测试

use crate::util::config::{
    load_config, parse_config, save_config, ClockMode, RuntimeConfig, WorkerMode,
};

#[test]
fn test_empty_config_uses_defaults() {
    let config = parse_config("").unwrap();
    assert_eq!(config, RuntimeConfig::default());
    assert_eq!(config.jobs.workers, 2);
    assert_eq!(config.arena.slot_size, 64 * 1024);
    assert!(!config.scheduler.wait_all_forks_on_finish);
}

#[test]
fn test_partial_sections() {
    let config = parse_config(
        r#"
        [scheduler]
        clock = "virtual"

        [jobs]
        workers = 5
        mode = "thread"
        default_timeout_ms = 250
        "#,
    )
    .unwrap();
    assert_eq!(config.scheduler.clock, ClockMode::Virtual);
    assert_eq!(config.scheduler.idle_slice_ms, 10);
    assert_eq!(config.jobs.workers, 5);
    assert_eq!(config.jobs.mode, WorkerMode::Thread);
    assert_eq!(config.jobs.queue_capacity, 64);
    assert_eq!(
        config.jobs.default_timeout(),
        Some(std::time::Duration::from_millis(250))
    );
    assert_eq!(config.arena.slot_count, 64);
}

#[test]
fn test_unknown_mode_is_an_error() {
    assert!(parse_config("[jobs]\nmode = \"fiber\"\n").is_err());
}

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tasklane.toml");
    let mut config = RuntimeConfig::default();
    config.jobs.workers = 3;
    config.arena.slot_count = 8;
    config.scheduler.wait_all_forks_on_finish = true;

    save_config(&path, &config).unwrap();
    assert_eq!(load_config(&path).unwrap(), config);
}
