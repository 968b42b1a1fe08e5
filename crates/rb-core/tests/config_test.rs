use rb_core::config::{parse_endpoint, Config, EndpointAddr};
use rb_telemetry::LogFormat;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, LogFormat::Human);
    assert_eq!(cfg.general.data_dir, "~/.runbox");
    assert!(cfg.docker.endpoint.is_none());
    assert_eq!(cfg.docker.connect_timeout_secs, 120);
    assert_eq!(cfg.timeouts.setup_secs, 600);
    assert_eq!(cfg.timeouts.mcp_secs, 60);
    assert_eq!(cfg.timeouts.git_secs, 120);
    assert_eq!(cfg.runs.backtrace_lines, 10);
    assert_eq!(cfg.runs.redaction_marker, "[FILTERED]");
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("[FILTERED]"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.timeouts.setup_secs, cfg.timeouts.setup_secs);
    assert_eq!(parsed.runs.commit_message, cfg.runs.commit_message);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[docker]
endpoint = "tcp://10.0.0.5:2375"

[timeouts]
git_secs = 30
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.docker.endpoint.as_deref(), Some("tcp://10.0.0.5:2375"));
    assert_eq!(cfg.timeouts.git_secs, 30);
    // defaults should fill in the rest
    assert_eq!(cfg.timeouts.setup_secs, 600);
    assert_eq!(cfg.general.log_level, "info");
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[general]\nlog_format = \"json\"\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert!(cfg.general.json_logs());
}

#[test]
fn zero_timeout_fails_validation() {
    let mut cfg = Config::default();
    cfg.timeouts.mcp_secs = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("mcp_secs"));
}

#[test]
fn empty_marker_fails_validation() {
    let mut cfg = Config::default();
    cfg.runs.redaction_marker.clear();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("redaction_marker"));
}

#[test]
fn malformed_endpoint_fails_validation() {
    let mut cfg = Config::default();
    cfg.docker.endpoint = Some("http://localhost".into());
    assert!(cfg.validate().is_err());
    cfg.docker.endpoint = Some("unix://relative.sock".into());
    assert!(cfg.validate().is_err());
    cfg.docker.endpoint = Some("unix:///var/run/docker.sock".into());
    assert!(cfg.validate().is_ok());
}

#[test]
fn commit_message_substitutes_run_id() {
    let cfg = Config::default();
    let id = uuid::Uuid::new_v4();
    assert_eq!(
        cfg.runs.commit_message_for(id),
        format!("Auto-commit from runbox run {id}")
    );
}

#[test]
fn log_format_accepts_the_cli_aliases() {
    let cfg: Config = toml::from_str("[general]\nlog_format = \"pretty\"\n").unwrap();
    assert_eq!(cfg.general.log_format, LogFormat::Human);
    let cfg: Config = toml::from_str("[general]\nlog_format = \"JSON\"\n").unwrap();
    assert!(cfg.general.json_logs());
    assert!(toml::from_str::<Config>("[general]\nlog_format = \"yaml\"\n").is_err());
}

#[test]
fn log_format_serialises_lowercase() {
    let toml_str = Config::default().to_toml().unwrap();
    assert!(toml_str.contains("log_format = \"human\""));
}

#[test]
fn endpoint_parsing() {
    assert_eq!(
        parse_endpoint(" unix:///var/run/docker.sock "),
        Some(EndpointAddr::Unix("/var/run/docker.sock"))
    );
    assert_eq!(
        parse_endpoint("tcp://10.0.0.5:2375"),
        Some(EndpointAddr::Tcp("10.0.0.5:2375"))
    );
    assert_eq!(parse_endpoint("tcp://:2375"), None);
    assert_eq!(parse_endpoint("unix://relative.sock"), None);
    assert_eq!(parse_endpoint("http://localhost"), None);
}
