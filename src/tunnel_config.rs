//! Loader for the INI-style tunnel configuration file.
//!
//! The loader is strict: unknown sections, unknown keys and malformed lines
//! all reject the file. This catches typos like a misspelled
//! `destination_name` before the server silently runs with a default.

use crate::tunnel_error::{ConfigError, TunnelResult};
use std::fs;
use std::path::Path;

/// Immutable runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
  /// Bind address for the TLS listener. `*` means any interface, anything
  /// else must be a textual IPv4 address.
  pub ssl_server_name: String,
  /// Bind port for the TLS listener.
  pub ssl_server_port: u16,
  /// Destination host. Resolved via name resolution for every session.
  pub destination_name: String,
  /// Destination port, kept as a string and handed to address resolution.
  pub destination_port: String,
  /// Number of worker threads, at least 1.
  pub thread_count: usize,
  /// Capacity in bytes of each per-session ring buffer, at least 1.
  pub buffer_size: usize,
  /// CA bundle used as client-certificate trust anchors. Required when
  /// `require_client_auth` is set, unused otherwise.
  pub verify_locations: Option<String>,
  /// Server certificate chain, PEM.
  pub certificate_file: String,
  /// Server private key, PEM.
  pub private_key_file: String,
  /// Request and verify a client certificate during the handshake.
  pub require_client_auth: bool,
}

const DEFAULT_THREAD_COUNT: i64 = 1;
const DEFAULT_BUFFER_SIZE: i64 = 16384;

#[derive(Default)]
struct PartialConfig {
  ssl_server_name: Option<String>,
  ssl_server_port: Option<u16>,
  destination_name: Option<String>,
  destination_port: Option<String>,
  thread_count: Option<i64>,
  buffer_size: Option<i64>,
  verify_locations: Option<String>,
  certificate_file: Option<String>,
  private_key_file: Option<String>,
  require_client_auth: Option<bool>,
}

impl TunnelConfig {
  /// Reads and parses the configuration file at `path`.
  pub fn load(path: impl AsRef<Path>) -> TunnelResult<TunnelConfig> {
    let content = fs::read_to_string(path)?;
    Self::parse(&content)
  }

  /// Parses configuration from an in-memory INI document.
  pub fn parse(content: &str) -> TunnelResult<TunnelConfig> {
    let mut partial = PartialConfig::default();
    let mut section: Option<String> = None;

    for (index, raw_line) in content.lines().enumerate() {
      let line_number = index + 1;
      let line = raw_line.trim();

      if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
        continue;
      }

      if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let name = name.trim();
        if name != "main" && name != "ssl" {
          return Err(ConfigError::UnknownSection(name.to_string()).into());
        }
        section = Some(name.to_string());
        continue;
      }

      let Some((key, value)) = line.split_once('=') else {
        return Err(ConfigError::Syntax(line_number, line.to_string()).into());
      };
      let key = key.trim();
      let value = value.trim();

      let Some(section) = section.as_deref() else {
        return Err(ConfigError::KeyOutsideSection(line_number, key.to_string()).into());
      };

      match (section, key) {
        ("main", "ssl_server_name") => partial.ssl_server_name = Some(value.to_string()),
        ("main", "ssl_server_port") => {
          partial.ssl_server_port = Some(parse_value("ssl_server_port", value)?)
        }
        ("main", "destination_name") => partial.destination_name = Some(value.to_string()),
        ("main", "destination_port") => partial.destination_port = Some(value.to_string()),
        ("main", "thread_count") => {
          partial.thread_count = Some(parse_value("thread_count", value)?)
        }
        ("main", "buffer_size") => partial.buffer_size = Some(parse_value("buffer_size", value)?),
        ("ssl", "verify_locations") => partial.verify_locations = Some(value.to_string()),
        ("ssl", "certificate_file") => partial.certificate_file = Some(value.to_string()),
        ("ssl", "PrivateKey_file") => partial.private_key_file = Some(value.to_string()),
        ("ssl", "require_client_auth") => {
          partial.require_client_auth = Some(parse_bool("require_client_auth", value)?)
        }
        (section, key) => {
          return Err(ConfigError::UnknownKey(section.to_string(), key.to_string()).into());
        }
      }
    }

    let require_client_auth = partial.require_client_auth.unwrap_or(false);
    if require_client_auth && partial.verify_locations.is_none() {
      return Err(ConfigError::MissingKey("verify_locations").into());
    }

    Ok(TunnelConfig {
      ssl_server_name: required(partial.ssl_server_name, "ssl_server_name")?,
      ssl_server_port: required(partial.ssl_server_port, "ssl_server_port")?,
      destination_name: required(partial.destination_name, "destination_name")?,
      destination_port: required(partial.destination_port, "destination_port")?,
      // The event loops need at least one worker and one byte of buffer to
      // make progress.
      thread_count: partial.thread_count.unwrap_or(DEFAULT_THREAD_COUNT).max(1) as usize,
      buffer_size: partial.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE).max(1) as usize,
      verify_locations: partial.verify_locations,
      certificate_file: required(partial.certificate_file, "certificate_file")?,
      private_key_file: required(partial.private_key_file, "PrivateKey_file")?,
      require_client_auth,
    })
  }
}

fn required<T>(value: Option<T>, key: &'static str) -> Result<T, ConfigError> {
  value.ok_or(ConfigError::MissingKey(key))
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
  value.parse::<T>().map_err(|_| ConfigError::InvalidValue(key, value.to_string()))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
  match value {
    "true" | "yes" | "1" => Ok(true),
    "false" | "no" | "0" => Ok(false),
    other => Err(ConfigError::InvalidValue(key, other.to_string())),
  }
}
