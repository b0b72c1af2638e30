//! Configuration tests
//!
//! Env-var precedence is not exercised here (process env is global across
//! the test binary); the file/default merge is tested through
//! `from_file_config` directly.

use super::*;

#[test]
fn defaults_match_the_documented_option_set() {
    let config = Config::default();

    assert_eq!(config.event_service.adapter, AdapterKind::Memory);
    assert_eq!(config.event_service.port, 8081);
    assert_eq!(config.event_service.stream_max_queue_size, 1024);
    assert_eq!(config.event_service.stream_heartbeat_interval_s, 30);

    assert_eq!(config.registry.port, 8082);
    assert_eq!(config.registry.agent_ttl_seconds, 300);
    assert_eq!(config.registry.agent_cleanup_interval_seconds, 60);

    assert_eq!(config.memory.port, 8083);
    assert_eq!(config.memory.embedding_model_dim, 384);
}

#[test]
fn adapter_kind_parses_case_insensitively() {
    assert_eq!("memory".parse::<AdapterKind>().unwrap(), AdapterKind::Memory);
    assert_eq!("NATS".parse::<AdapterKind>().unwrap(), AdapterKind::Nats);
    assert!("kafka".parse::<AdapterKind>().is_err());
}

#[test]
fn file_values_override_defaults() {
    let file: FileConfig = toml::from_str(
        r#"
        log_level = "debug"

        [event_service]
        adapter = "nats"
        nats_url = "nats://bus:4222"
        stream_max_queue_size = 64

        [registry]
        agent_ttl_seconds = 3
        agent_cleanup_interval_seconds = 1

        [memory]
        database_url = "/var/lib/soorma/memory.db"
        embedding_model_dim = 768
        "#,
    )
    .unwrap();

    let config = Config::from_file_config(file);

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.event_service.adapter, AdapterKind::Nats);
    assert_eq!(config.event_service.nats_url, "nats://bus:4222");
    assert_eq!(config.event_service.stream_max_queue_size, 64);
    // Untouched fields keep their defaults.
    assert_eq!(config.event_service.stream_heartbeat_interval_s, 30);
    assert_eq!(config.registry.agent_ttl_seconds, 3);
    assert_eq!(config.registry.agent_cleanup_interval_seconds, 1);
    assert_eq!(config.memory.database_url, "/var/lib/soorma/memory.db");
    assert_eq!(config.memory.embedding_model_dim, 768);
}

#[test]
fn empty_file_config_yields_defaults() {
    let file: FileConfig = toml::from_str("").unwrap();
    let config = Config::from_file_config(file);
    assert_eq!(config.event_service.port, Config::default().event_service.port);
    assert_eq!(config.log_level, "info");
}

#[test]
fn database_url_scheme_is_stripped() {
    assert_eq!(database_path("sqlite:///tmp/reg.db"), "/tmp/reg.db");
    assert_eq!(database_path("./registry.db"), "./registry.db");
}
