//! Server and client configuration.
//!
//! The server never refuses to start over its configuration: a missing,
//! unreadable or malformed file resolves to the built-in defaults and the
//! problem is handed back as a [`ConfigWarning`] value for the caller to report.
//! The client is stricter, since it cannot guess where the server lives.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 808;
pub const DEFAULT_ACTIVITY_LOG: &str = "server.log";
pub const DEFAULT_MESSAGE_LOG: &str = "messages.txt";
pub const DEFAULT_MAX_PENDING_CONNECTIONS: u32 = 5;
pub const DEFAULT_MAX_ACTIVE_CONNECTIONS: usize = 64;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4096;
/// Largest accepted `max_message_bytes`; anything above falls back to the default.
pub const MAX_MESSAGE_BYTES_CEILING: usize = 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Fully resolved server settings. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub activity_log_path: PathBuf,
    pub message_log_path: PathBuf,
    /// Listen backlog handed to the OS.
    pub max_pending_connections: u32,
    /// Ceiling on simultaneously running connection handlers.
    pub max_active_connections: usize,
    /// Longest accepted message line, excluding the newline.
    pub max_message_bytes: usize,
    /// How long `stop` waits for in-flight handlers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            activity_log_path: PathBuf::from(DEFAULT_ACTIVITY_LOG),
            message_log_path: PathBuf::from(DEFAULT_MESSAGE_LOG),
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            max_active_connections: DEFAULT_MAX_ACTIVE_CONNECTIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Operator-supplied settings; every field may be left out.
///
/// Field names on the wire follow the documented file keys (`log_file`,
/// `message_file`, `max_connections`). Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "log_file")]
    pub activity_log_path: Option<PathBuf>,
    #[serde(rename = "message_file")]
    pub message_log_path: Option<PathBuf>,
    #[serde(rename = "max_connections")]
    pub max_pending_connections: Option<u32>,
    pub max_active_connections: Option<usize>,
    pub max_message_bytes: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

impl PartialConfig {
    /// Fills every missing field from the defaults.
    pub fn resolve(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            activity_log_path: self
                .activity_log_path
                .unwrap_or(defaults.activity_log_path),
            message_log_path: self.message_log_path.unwrap_or(defaults.message_log_path),
            max_pending_connections: self
                .max_pending_connections
                .unwrap_or(defaults.max_pending_connections),
            // A zero ceiling or size cap would turn every connection away.
            max_active_connections: self
                .max_active_connections
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.max_active_connections),
            max_message_bytes: self
                .max_message_bytes
                .filter(|limit| (1..=MAX_MESSAGE_BYTES_CEILING).contains(limit))
                .unwrap_or(defaults.max_message_bytes),
            shutdown_grace: self
                .shutdown_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }
}

/// Why the server fell back to its defaults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigWarning {
    #[error("configuration file {} not found, using defaults", path.display())]
    NotFound { path: PathBuf },
    #[error("configuration file {} could not be read ({source}), using defaults", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration file {} is malformed ({reason}), using defaults", path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Outcome of loading the server configuration.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub config: ServerConfig,
    pub warning: Option<ConfigWarning>,
}

impl ResolvedConfig {
    fn degraded(warning: ConfigWarning) -> Self {
        Self {
            config: ServerConfig::default(),
            warning: Some(warning),
        }
    }
}

/// Merges an optional source over the defaults.
pub fn resolve(source: Option<PartialConfig>) -> ServerConfig {
    source.unwrap_or_default().resolve()
}

pub fn parse_server_config(text: &str) -> Result<PartialConfig, serde_json::Error> {
    serde_json::from_str(text)
}

/// Reads a JSON configuration file. Never fails; see [`ConfigWarning`].
pub fn load_server_config(path: &Path) -> ResolvedConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ResolvedConfig::degraded(ConfigWarning::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return ResolvedConfig::degraded(ConfigWarning::Unreadable {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match parse_server_config(&text) {
        Ok(partial) => ResolvedConfig {
            config: resolve(Some(partial)),
            warning: None,
        },
        Err(err) => ResolvedConfig::degraded(ConfigWarning::Malformed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

/// Where the client should connect. Both fields are required in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientConfigError {
    #[error("failed to read client configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid client configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig, ClientConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ClientConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ClientConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    #[test]
    fn absent_source_resolves_to_documented_defaults() {
        let config = resolve(None);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 808);
        assert_eq!(config.activity_log_path, PathBuf::from("server.log"));
        assert_eq!(config.message_log_path, PathBuf::from("messages.txt"));
        assert_eq!(config.max_pending_connections, 5);
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn partial_source_keeps_given_fields() {
        let partial = parse_server_config(r#"{"port": 9000, "message_file": "inbox.txt"}"#)
            .expect("valid json");
        let config = resolve(Some(partial));

        assert_eq!(config.port, 9000);
        assert_eq!(config.message_log_path, PathBuf::from("inbox.txt"));
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.activity_log_path, PathBuf::from(DEFAULT_ACTIVITY_LOG));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let partial =
            parse_server_config(r#"{"host": "0.0.0.0", "colour": "blue"}"#).expect("valid json");
        assert_eq!(partial.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let partial =
            parse_server_config(r#"{"max_active_connections": 0, "max_message_bytes": 0}"#)
                .expect("valid json");
        let config = partial.resolve();
        assert_eq!(config.max_active_connections, DEFAULT_MAX_ACTIVE_CONNECTIONS);
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn oversized_message_cap_falls_back_to_default() {
        let partial = parse_server_config(r#"{"max_message_bytes": 18446744073709551615}"#)
            .expect("valid json");
        assert_eq!(partial.resolve().max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);

        let at_ceiling = PartialConfig {
            max_message_bytes: Some(MAX_MESSAGE_BYTES_CEILING),
            ..PartialConfig::default()
        };
        assert_eq!(at_ceiling.resolve().max_message_bytes, MAX_MESSAGE_BYTES_CEILING);
    }

    #[test]
    fn missing_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = load_server_config(&dir.path().join("nope.json"));

        assert_eq!(resolved.config, ServerConfig::default());
        assert!(matches!(resolved.warning, Some(ConfigWarning::NotFound { .. })));
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        for contents in ["{ not json", r#"{"port": "eighty"}"#, "[1, 2, 3]"] {
            let (_dir, path) = write_temp(contents);
            let resolved = load_server_config(&path);

            assert_eq!(resolved.config, ServerConfig::default(), "{contents}");
            assert!(
                matches!(resolved.warning, Some(ConfigWarning::Malformed { .. })),
                "{contents}"
            );
        }
    }

    #[test]
    fn valid_file_has_no_warning() {
        let (_dir, path) = write_temp(r#"{"host": "127.0.0.1", "port": 7000, "max_connections": 10}"#);
        let resolved = load_server_config(&path);

        assert!(resolved.warning.is_none());
        assert_eq!(resolved.config.host, "127.0.0.1");
        assert_eq!(resolved.config.port, 7000);
        assert_eq!(resolved.config.max_pending_connections, 10);
    }

    #[test]
    fn client_config_requires_both_fields() {
        let (_dir, path) = write_temp(r#"{"server_host": "localhost"}"#);
        let err = load_client_config(&path).expect_err("port is required");
        assert!(err.to_string().contains("server_port"), "{err}");

        let (_dir, path) = write_temp(r#"{"server_host": "localhost", "server_port": 808}"#);
        let config = load_client_config(&path).expect("complete config");
        assert_eq!(
            config,
            ClientConfig {
                server_host: "localhost".into(),
                server_port: 808
            }
        );
    }
}
