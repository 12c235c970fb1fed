//! Configuration loading from disk.

use std::io::Write;
use std::time::Duration;

use bridge_gateway::config::{load_config, ConfigError};
use bridge_gateway::Gateway;

const CONFIG: &str = r#"
[http]
keep_alive_timeout_secs = 5
keep_alive_connections = 2

[listener]
workers = 2

[[services]]
name = "api"
accept = "http://127.0.0.1:0/api"
connect = "http://127.0.0.1:3000/"
keep_alive_connections = 8

[[services]]
name = "ws"
accept = "http://127.0.0.1:0/ws"
connect = "ws://127.0.0.1:3001/"

[admin]
enabled = true
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn loads_from_file() {
    let file = write_config(CONFIG);
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.http.keep_alive_timeout_secs, 5);
    assert_eq!(config.listener.workers, 2);
    assert_eq!(config.services.len(), 2);
    assert!(config.admin.enabled);

    let api = config.http.address_options(&config.services[0]);
    assert_eq!(api.keep_alive_connections, 8);
    assert_eq!(api.keep_alive_timeout, Duration::from_secs(5));
    let ws = config.http.address_options(&config.services[1]);
    assert_eq!(ws.keep_alive_connections, 2);
}

#[test]
fn invalid_file_reports_every_problem() {
    let file = write_config(
        r#"
        [http]
        keep_alive_timeout_secs = 0

        [[services]]
        name = "a"
        accept = "http://127.0.0.1:0/a"
        connect = "ftp://127.0.0.1/"

        [[services]]
        name = "a"
        accept = "http://127.0.0.1:0/b"
        connect = "http://127.0.0.1/"
        "#,
    );
    match load_config(file.path()) {
        Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
        other => panic!("expected validation errors, got {:?}", other),
    }
}

#[tokio::test]
async fn loaded_config_starts_gateway() {
    let file = write_config(CONFIG);
    let config = load_config(file.path()).unwrap();
    let gateway = Gateway::new(config);
    let summary = gateway.start().await.unwrap();
    assert_eq!(summary.added, vec!["api".to_string(), "ws".to_string()]);
    assert_eq!(gateway.bindings().paths("http://127.0.0.1:0"), vec!["/api", "/ws"]);
    gateway.shutdown(Duration::from_millis(50)).await;
}
