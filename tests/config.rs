use tlstun::{ConfigError, TunnelConfig, TunnelError};

const COMPLETE: &str = "\
[main]
ssl_server_name = 127.0.0.1
ssl_server_port = 8443
destination_name = localhost
destination_port = 8080
thread_count = 4
buffer_size = 4096

[ssl]
verify_locations = /etc/ssl/ca.pem
certificate_file = /etc/ssl/cert.pem
PrivateKey_file = /etc/ssl/key.pem
";

#[test]
fn parses_complete_file() {
  let config = TunnelConfig::parse(COMPLETE).expect("parse failed");
  assert_eq!(config.ssl_server_name, "127.0.0.1");
  assert_eq!(config.ssl_server_port, 8443);
  assert_eq!(config.destination_name, "localhost");
  assert_eq!(config.destination_port, "8080");
  assert_eq!(config.thread_count, 4);
  assert_eq!(config.buffer_size, 4096);
  assert_eq!(config.verify_locations.as_deref(), Some("/etc/ssl/ca.pem"));
  assert_eq!(config.certificate_file, "/etc/ssl/cert.pem");
  assert_eq!(config.private_key_file, "/etc/ssl/key.pem");
  assert!(!config.require_client_auth);
}

#[test]
fn comments_and_blank_lines_are_ignored() {
  let content = format!("; leading comment\n# another one\n\n{COMPLETE}\n; trailing");
  TunnelConfig::parse(&content).expect("parse failed");
}

#[test]
fn wildcard_bind_name_is_accepted() {
  let content = COMPLETE.replace("ssl_server_name = 127.0.0.1", "ssl_server_name = *");
  let config = TunnelConfig::parse(&content).expect("parse failed");
  assert_eq!(config.ssl_server_name, "*");
}

#[test]
fn thread_count_and_buffer_size_are_clamped() {
  let content = COMPLETE
    .replace("thread_count = 4", "thread_count = 0")
    .replace("buffer_size = 4096", "buffer_size = -5");
  let config = TunnelConfig::parse(&content).expect("parse failed");
  assert_eq!(config.thread_count, 1);
  assert_eq!(config.buffer_size, 1);
}

#[test]
fn omitted_sizes_get_defaults() {
  let content = COMPLETE.replace("thread_count = 4\n", "").replace("buffer_size = 4096\n", "");
  let config = TunnelConfig::parse(&content).expect("parse failed");
  assert_eq!(config.thread_count, 1);
  assert_eq!(config.buffer_size, 16384);
}

#[test]
fn unknown_key_is_rejected() {
  let content = format!("{COMPLETE}destination_host = nope\n");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::UnknownKey(section, key))) => {
      assert_eq!(section, "ssl");
      assert_eq!(key, "destination_host");
    }
    other => panic!("expected UnknownKey, got {other:?}"),
  }
}

#[test]
fn unknown_section_is_rejected() {
  let content = format!("{COMPLETE}[metrics]\nport = 1\n");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::UnknownSection(section))) => {
      assert_eq!(section, "metrics")
    }
    other => panic!("expected UnknownSection, got {other:?}"),
  }
}

#[test]
fn malformed_line_is_rejected() {
  let content = COMPLETE.replace("thread_count = 4", "thread_count");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::Syntax(line, text))) => {
      assert_eq!(line, 6);
      assert_eq!(text, "thread_count");
    }
    other => panic!("expected Syntax, got {other:?}"),
  }
}

#[test]
fn key_before_any_section_is_rejected() {
  match TunnelConfig::parse("thread_count = 4\n") {
    Err(TunnelError::Config(ConfigError::KeyOutsideSection(1, key))) => {
      assert_eq!(key, "thread_count")
    }
    other => panic!("expected KeyOutsideSection, got {other:?}"),
  }
}

#[test]
fn missing_required_key_is_rejected() {
  let content = COMPLETE.replace("destination_name = localhost\n", "");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::MissingKey(key))) => {
      assert_eq!(key, "destination_name")
    }
    other => panic!("expected MissingKey, got {other:?}"),
  }
}

#[test]
fn bad_port_is_rejected() {
  let content = COMPLETE.replace("ssl_server_port = 8443", "ssl_server_port = 99999");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::InvalidValue(key, value))) => {
      assert_eq!(key, "ssl_server_port");
      assert_eq!(value, "99999");
    }
    other => panic!("expected InvalidValue, got {other:?}"),
  }
}

#[test]
fn client_auth_requires_verify_locations() {
  let content = COMPLETE
    .replace("verify_locations = /etc/ssl/ca.pem\n", "")
    .replace("[ssl]", "[ssl]\nrequire_client_auth = true");
  match TunnelConfig::parse(&content) {
    Err(TunnelError::Config(ConfigError::MissingKey(key))) => {
      assert_eq!(key, "verify_locations")
    }
    other => panic!("expected MissingKey, got {other:?}"),
  }
}

#[test]
fn loading_a_missing_file_fails() {
  let result = TunnelConfig::load("/nonexistent/tunnel.ini");
  assert!(matches!(result, Err(TunnelError::IO(_))));
}

#[test]
fn loads_from_disk() {
  let path = std::env::temp_dir().join("tlstun-config-test.ini");
  std::fs::write(&path, COMPLETE).expect("write temp config");
  let config = TunnelConfig::load(&path).expect("load failed");
  assert_eq!(config.ssl_server_port, 8443);
  let _ = std::fs::remove_file(&path);
}
