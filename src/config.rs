use anyhow::{Context, Result};
use serde::{Deserialize, de::DeserializeOwned};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::{info, warn};

use crate::rules::RuleSet;
use crate::substitution::expand_env;
use crate::transport::MAX_MESSAGE_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

impl ListenConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: ListenConfig,
    /// Base URL that webhook requests arriving through tunnels are sent to.
    pub upstream_url: Option<String>,
    /// Rule-set file filtering tunnel-originated requests to the upstream.
    pub accept: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Ask clients to return response bodies over the streaming side channel.
    #[serde(default = "default_true")]
    pub stream_responses: bool,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl ServerConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// `http(s)://` base URL of the relay server.
    pub server_url: String,
    pub token: String,
    /// Default private target; may reference environment variables.
    pub target_url: Option<String>,
    /// Rule-set file filtering requests to the target and local webhooks.
    pub accept: Option<PathBuf>,
    /// Local listener for webhooks, systemcheck and healthcheck.
    pub listen: Option<ListenConfig>,
    /// Extra CA certificate trusted when connecting to the server.
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub validation_url: Option<String>,
    pub validation_authorization: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl ClientConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Target URL with environment variables expanded and any trailing slash
    /// removed.
    #[must_use]
    pub fn resolved_target_url(&self) -> Option<String> {
        self.target_url
            .as_deref()
            .map(expand_env)
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_stream_timeout_secs() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

const fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

/// Loads an optional rule-set file.
///
/// A missing file leaves traffic unfiltered; a malformed one is an error.
pub fn load_rules(path: Option<&Path>) -> Result<Option<RuleSet>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        warn!(path = %path.display(), "Rule file not found, traffic will not be filtered");
        return Ok(None);
    }
    let rules = RuleSet::load(path)
        .with_context(|| format!("Failed to load filter rules from {}", path.display()))?;
    info!(path = %path.display(), "Loaded filter rules");
    Ok(Some(rules))
}
