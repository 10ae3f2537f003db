/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed gateway configuration with defaults filled in
[POS]:    Configuration layer - CLI setup
[UPDATE]: When adding new configuration options
*/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use url::Url;

use nostr_gateway_adapter::auth::{DEFAULT_SESSION_FILE, HandshakeConfig, ManagerConfig};
use nostr_gateway_adapter::http::DEFAULT_BASE_URL;

/// Top-level configuration for the gateway CLI
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Gateway API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Relays used for remote signer pairing and wallet events
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Mints recorded in a newly created wallet
    #[serde(default)]
    pub mints: Vec<String>,
    /// Sign requests with the active identity
    #[serde(default = "default_auth_enabled")]
    pub auth_enabled: bool,
    /// Session file; defaults to the user data directory
    #[serde(default)]
    pub session_file: Option<PathBuf>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub remote_signer: RemoteSignerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSignerConfig {
    /// Name shown by the signer app when pairing
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub app_url: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_url: String::new(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            relays: default_relays(),
            mints: Vec::new(),
            auth_enabled: default_auth_enabled(),
            session_file: None,
            session: SessionConfig::default(),
            remote_signer: RemoteSignerConfig::default(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_relays() -> Vec<String> {
    vec!["wss://relay.nsec.app".to_string()]
}

fn default_auth_enabled() -> bool {
    true
}

fn default_ttl_hours() -> i64 {
    24
}

fn default_app_name() -> String {
    "nostr-gateway".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    45
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl GatewayConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url).context("base_url is not a valid URL")?;
        self.relay_urls()?;
        for mint in &self.mints {
            Url::parse(mint).with_context(|| format!("mint {mint} is not a valid URL"))?;
        }
        if self.session.ttl_hours <= 0 {
            bail!("session.ttl_hours must be positive");
        }
        if self.remote_signer.handshake_timeout_secs == 0 {
            bail!("remote_signer.handshake_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn relay_urls(&self) -> Result<Vec<Url>> {
        self.relays
            .iter()
            .map(|relay| {
                let url = Url::parse(relay).with_context(|| format!("relay {relay} is not a valid URL"))?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    bail!("relay {relay} must use ws:// or wss://");
                }
                Ok(url)
            })
            .collect()
    }

    /// Explicit `session_file`, else `<data dir>/nostr-gateway/session.json`.
    pub fn session_path(&self) -> PathBuf {
        if let Some(path) = &self.session_file {
            return path.clone();
        }
        match dirs::data_dir() {
            Some(dir) => dir.join("nostr-gateway").join("session.json"),
            None => PathBuf::from(DEFAULT_SESSION_FILE),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            session_ttl: TimeDelta::hours(self.session.ttl_hours),
            remote_request_timeout: Duration::from_secs(self.remote_signer.request_timeout_secs),
        }
    }

    pub fn handshake_config(&self) -> Result<HandshakeConfig> {
        Ok(HandshakeConfig {
            relays: self.relay_urls()?,
            app_name: self.remote_signer.app_name.clone(),
            app_url: self.remote_signer.app_url.clone(),
            timeout: Duration::from_secs(self.remote_signer.handshake_timeout_secs),
            request_timeout: Duration::from_secs(self.remote_signer.request_timeout_secs),
            ..HandshakeConfig::default()
        })
    }
}
