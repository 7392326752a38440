use std::path::Path;
use std::time::Duration;

use super::*;

fn parse(yaml: &str) -> anyhow::Result<Config> {
    Config::parse(yaml, Path::new("/work"), None)
}

#[test]
fn parses_full_service() {
    let config = parse(
        r#"
services:
  serena:
    command: serena-mcp-server
    args: ["--port", "9121"]
    transport: sse
    url: http://127.0.0.1:9121/sse
    cwd: /srv/serena
    env:
      RUST_LOG: info
    readiness:
      check: http
      url: http://127.0.0.1:9121/health
      timeout: 10s
      interval: 250ms
    restart: always
    keep_alive: false
    exclude_tools: [internal_debug]
    middleware:
      response: [strip-result-wrapper, strip-json-keys]
"#,
    )
    .unwrap();

    let svc = config.service("serena").unwrap();
    assert_eq!(svc.command, "serena-mcp-server");
    assert_eq!(svc.args, vec!["--port", "9121"]);
    assert_eq!(svc.transport, Transport::Sse);
    assert_eq!(svc.url.as_deref(), Some("http://127.0.0.1:9121/sse"));
    assert_eq!(svc.readiness.url.as_deref(), Some("http://127.0.0.1:9121/health"));
    assert_eq!(svc.readiness.timeout, Duration::from_secs(10));
    assert_eq!(svc.readiness.interval, Duration::from_millis(250));
    assert_eq!(svc.restart, RestartPolicy::Always);
    assert!(!svc.keep_alive);
    assert!(svc.exclude_tools.contains("internal_debug"));
    assert_eq!(svc.response_middleware.len(), 2);
    assert_eq!(svc.response_middleware[0].name, "strip-result-wrapper");
}

#[test]
fn defaults_apply() {
    let config = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
"#,
    )
    .unwrap();

    let svc = config.service("svc").unwrap();
    assert_eq!(svc.transport, Transport::Sse);
    assert_eq!(svc.restart, RestartPolicy::OnFailure);
    assert!(svc.keep_alive);
    assert_eq!(svc.readiness.timeout, Duration::from_secs(30));
    assert_eq!(svc.readiness.interval, Duration::from_millis(500));
    // Readiness falls back to the service url.
    assert_eq!(svc.readiness_url(), Some("http://127.0.0.1:4000"));
}

#[test]
fn command_is_required() {
    let err = parse(
        r#"
services:
  svc:
    url: http://127.0.0.1:4000
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("command"), "err={err:#}");
}

#[test]
fn sse_requires_url() {
    let err = parse(
        r#"
services:
  svc:
    command: server
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("url"), "err={err:#}");
}

#[test]
fn stdio_does_not_require_url() {
    let config = parse(
        r#"
services:
  svc:
    command: server
    transport: stdio
"#,
    )
    .unwrap();
    assert_eq!(config.service("svc").unwrap().transport, Transport::Stdio);
}

#[test]
fn duration_accepts_raw_millis_and_minutes() {
    let config = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    readiness:
      timeout: 1m
      interval: 100
"#,
    )
    .unwrap();
    let svc = config.service("svc").unwrap();
    assert_eq!(svc.readiness.timeout, Duration::from_secs(60));
    assert_eq!(svc.readiness.interval, Duration::from_millis(100));
}

#[test]
fn zero_duration_is_rejected() {
    let err = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    readiness:
      timeout: 0
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("positive"), "err={err:#}");
}

#[test]
fn unknown_readiness_check_is_rejected() {
    let err = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    readiness:
      check: tcp
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("http"), "err={err:#}");
}

#[test]
fn unknown_middleware_is_rejected() {
    let err = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    middleware:
      response: [does-not-exist]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown middleware"), "err={err:#}");
}

#[test]
fn middleware_map_entry_keeps_config() {
    let config = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    middleware:
      response:
        - toon: { indent: 2 }
"#,
    )
    .unwrap();
    let svc = config.service("svc").unwrap();
    assert_eq!(svc.response_middleware[0].name, "toon");
    assert!(svc.response_middleware[0].config.is_some());
}

#[test]
fn unknown_top_level_service_field_is_rejected() {
    let err = parse(
        r#"
services:
  svc:
    command: server
    url: http://127.0.0.1:4000
    retries: 3
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("invalid config") || err.to_string().contains("unknown field"));
}

#[test]
fn invalid_service_name_is_rejected() {
    let err = parse(
        r#"
services:
  "bad name":
    command: server
    transport: stdio
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("invalid service name"), "err={err:#}");
}

#[test]
fn placeholders_expand_in_nested_values() {
    std::env::set_var("MCPD_TEST_TOKEN", "s3cret");
    let config = parse(
        r#"
services:
  svc:
    command: ${workspaceRoot}/bin/server
    transport: stdio
    env:
      TOKEN: ${env.MCPD_TEST_TOKEN}
      KEEP: ${env.MCPD_TEST_UNSET_VAR}
      OTHER: ${something.else}
"#,
    )
    .unwrap();
    let svc = config.service("svc").unwrap();
    assert_eq!(svc.command, "/work/bin/server");
    assert_eq!(svc.env["TOKEN"], "s3cret");
    // Unknown placeholders stay literal.
    assert_eq!(svc.env["KEEP"], "${env.MCPD_TEST_UNSET_VAR}");
    assert_eq!(svc.env["OTHER"], "${something.else}");
}

#[tokio::test]
async fn load_prefers_project_config() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join("mcpd.yml"),
        "services:\n  svc:\n    command: server\n    transport: stdio\n",
    )
    .await
    .unwrap();

    let config = Config::load(dir.path(), None).await.unwrap();
    assert!(config.service("svc").is_some());
    assert_eq!(config.path(), Some(dir.path().join("mcpd.yml").as_path()));
}

#[tokio::test]
async fn load_explicit_missing_path_errors() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(dir.path(), Some("nope.yml".into()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope.yml"), "err={err:#}");
}
