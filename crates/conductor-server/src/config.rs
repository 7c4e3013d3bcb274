//! Relay configuration: TOML settings file + CLI overrides.

use crate::auth::AuthGate;
use crate::relay::ReconnectPolicy;
use conductor_core::{ConductorError, ConductorResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level settings file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub conductor: ConductorSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// `[conductor]` section of the settings TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConductorSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_payload_path")]
    pub payload_path: String,
}

impl Default for ConductorSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            payload_path: default_payload_path(),
        }
    }
}

/// `[auth]` section of the settings TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// `[host]` section: where to find the host's debugger.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSection {
    #[serde(default = "default_discovery_url")]
    pub discovery_url: String,
    #[serde(default = "default_target_title")]
    pub target_title: String,
    #[serde(default = "default_true")]
    pub enable_remote_debugging: bool,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            discovery_url: default_discovery_url(),
            target_title: default_target_title(),
            enable_remote_debugging: true,
            discovery_interval_ms: default_discovery_interval_ms(),
        }
    }
}

/// `[reconnect]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_tries")]
    pub payload_tries: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            backoff_ms: default_backoff_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            payload_tries: default_max_tries(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7355
}
fn default_payload_path() -> String {
    "payload.js".to_string()
}
fn default_discovery_url() -> String {
    "http://localhost:8080/json".to_string()
}
fn default_target_title() -> String {
    "SharedJSContext".to_string()
}
fn default_discovery_interval_ms() -> u64 {
    1000
}
fn default_max_tries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_handshake_timeout_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

/// Resolved relay configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub payload_path: PathBuf,
    /// Accepted client secrets; empty disables authentication.
    pub client_secrets: Vec<String>,
    pub discovery_url: String,
    pub target_title: String,
    pub enable_remote_debugging: bool,
    pub discovery_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub payload_tries: u32,
}

impl RelayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
    ) -> ConductorResult<Self> {
        let (file_config, base_dir) = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                let base_dir = expanded
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading settings file");
                    let content = std::fs::read_to_string(&expanded)?;
                    (Self::parse(&content)?, base_dir)
                } else {
                    info!(path = %expanded.display(), "settings file not found, using defaults");
                    (ConfigFile::default(), base_dir)
                }
            }
            None => (ConfigFile::default(), PathBuf::new()),
        };

        Self::resolve(file_config, &base_dir, cli_host, cli_port)
    }

    fn parse(content: &str) -> ConductorResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ConductorError::Config(format!("settings parse error: {e}")))
    }

    fn resolve(
        file: ConfigFile,
        base_dir: &Path,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
    ) -> ConductorResult<Self> {
        let client_secrets = if file.auth.enabled {
            let tokens: Vec<String> = file
                .auth
                .tokens
                .into_iter()
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.is_empty() {
                return Err(ConductorError::Config(
                    "no tokens found, add some or set `auth.enabled` to false".into(),
                ));
            }
            tokens
        } else {
            Vec::new()
        };

        let payload_path = expand_tilde_str(&file.conductor.payload_path);
        let payload_path = if payload_path.is_relative() {
            base_dir.join(payload_path)
        } else {
            payload_path
        };

        if file.reconnect.max_tries == 0 || file.reconnect.payload_tries == 0 {
            return Err(ConductorError::Config(
                "reconnect tries must be at least 1".into(),
            ));
        }

        Ok(Self {
            host: cli_host
                .map(|s| s.to_string())
                .unwrap_or(file.conductor.host),
            port: cli_port.unwrap_or(file.conductor.port),
            payload_path,
            client_secrets,
            discovery_url: file.host.discovery_url,
            target_title: file.host.target_title,
            enable_remote_debugging: file.host.enable_remote_debugging,
            discovery_interval: Duration::from_millis(file.host.discovery_interval_ms),
            reconnect: ReconnectPolicy::new(
                file.reconnect.max_tries,
                Duration::from_millis(file.reconnect.backoff_ms),
                Duration::from_millis(file.reconnect.handshake_timeout_ms),
            ),
            payload_tries: file.reconnect.payload_tries,
        })
    }

    /// `host:port` the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the client auth gate from the configured secrets.
    pub fn auth_gate(&self) -> AuthGate {
        AuthGate::new(self.client_secrets.iter().cloned())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = RelayConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.port, 7355);
        assert_eq!(cfg.listen_addr(), "127.0.0.1:7355");
        assert!(cfg.client_secrets.is_empty());
        assert_eq!(cfg.reconnect.max_tries(), 5);
        assert_eq!(cfg.target_title, "SharedJSContext");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = RelayConfig::load(Some(Path::new("/nonexistent/settings.toml")), None, None)
            .unwrap();
        assert_eq!(cfg.payload_path, PathBuf::from("/nonexistent/payload.js"));
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[conductor]
port = 9000
payload_path = "out/payload.js"

[auth]
enabled = true
tokens = ["alpha", "beta"]

[reconnect]
backoff_ms = 750
"#
        )
        .unwrap();

        let cfg = RelayConfig::load(Some(&path), Some("0.0.0.0"), None).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.payload_path, dir.path().join("out/payload.js"));
        assert_eq!(cfg.client_secrets, vec!["alpha", "beta"]);
        assert_eq!(cfg.reconnect.backoff(), Duration::from_millis(750));

        let cfg = RelayConfig::load(Some(&path), None, Some(1234)).unwrap();
        assert_eq!(cfg.port, 1234);
    }

    #[test]
    fn auth_enabled_without_tokens_is_an_error() {
        let file: ConfigFile = RelayConfig::parse("[auth]\nenabled = true\n").unwrap();
        let err = RelayConfig::resolve(file, Path::new(""), None, None).unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));
    }

    #[test]
    fn auth_disabled_ignores_tokens() {
        let file = RelayConfig::parse("[auth]\nenabled = false\ntokens = [\"x\"]\n").unwrap();
        let cfg = RelayConfig::resolve(file, Path::new(""), None, None).unwrap();
        assert!(cfg.client_secrets.is_empty());
        assert!(!cfg.auth_gate().is_enabled());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            RelayConfig::parse("[conductor\nport = 1"),
            Err(ConductorError::Config(_))
        ));
    }
}
