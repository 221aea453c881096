//! Configuration loading from files
//!
//! Run with: cargo test --test config_loading

use std::io::Write;

use pipestream_core::bootstrap::load_config_from;
use pipestream_core::Config;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_node_topology_from_yaml() {
    let file = write_config(
        r#"
node:
  name: detect
  consumer_types: [track, store]
  default_flow: main
  flows:
    main:
      - source: detect
        next: [track, store]
      - source: track
        next: [store]
  upstreams:
    - node_name: decode
      host: 127.0.0.1
      port: 9100
streaming:
  port: 9200
  max_queue_bytes: 1000
"#,
    );

    let path = file.path().to_str().unwrap();
    let config = Config::from_file(path).unwrap();

    assert_eq!(config.node.name, "detect");
    assert_eq!(config.node.consumer_types, vec!["track", "store"]);
    assert_eq!(config.node.flows["main"].len(), 2);
    assert_eq!(config.node.flows["main"][1].next, vec!["store"]);
    assert_eq!(config.node.upstreams[0].address(), "127.0.0.1:9100");
    assert_eq!(config.streaming.port, 9200);
    assert_eq!(config.streaming.max_queue_bytes, 1000);
    // Untouched fields keep their defaults
    assert_eq!(config.streaming.heartbeat_interval_ms, 1000);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_config_from_rejects_invalid_file() {
    let file = write_config(
        r#"
node:
  name: detect
  default_flow: missing
streaming:
  reconnect_interval_ms: 5000
  reconnect_max_ms: 100
"#,
    );

    let err = load_config_from(Some(file.path().to_str().unwrap())).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("2 error(s)"), "{message}");
    assert!(message.contains("missing"));
    assert!(message.contains("reconnect_max_ms"));
}
