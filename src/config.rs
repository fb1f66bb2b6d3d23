//! Configuration management
//!
//! Loads configuration from config.toml (or the embedded default) and
//! applies environment overrides for secrets and endpoints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::github::{get_github_token, GITHUB_API_BASE};
use crate::notification::DEFAULT_SITE_URL;
use crate::pipeline::PipelineSettings;
use crate::upload::{DEFAULT_UPLOAD_TIMEOUT, LIGHTHOUSE_API_URL, LIGHTHOUSE_GATEWAY_URL};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub webproof: WebProofConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed browser origins in addition to localhost
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub api_base: String,
    /// Usually left empty in favour of EXTRA_GITHUB_TOKEN / GITHUB_TOKEN
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API_BASE.to_string(),
            token: None,
        }
    }
}

/// PostgreSQL is selected through DATABASE_URL; this is the SQLite fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
    #[serde(skip)]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("gitclaim.db"),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub api_url: String,
    pub gateway_url: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
}

fn default_upload_timeout() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT.as_secs()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_url: LIGHTHOUSE_API_URL.to_string(),
            gateway_url: LIGHTHOUSE_GATEWAY_URL.to_string(),
            api_key: None,
            timeout_secs: default_upload_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebProofConfig {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub notary_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebProofConfig {
    fn default() -> Self {
        Self {
            binary: None,
            notary_url: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub prover_id: String,
    #[serde(default)]
    pub verifier_id: String,
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            prover_id: String::new(),
            verifier_id: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub site_url: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            site_url: DEFAULT_SITE_URL.to_string(),
        }
    }
}

impl Config {
    /// Load from `path` when it exists, the embedded default otherwise.
    /// Environment overrides are not applied here.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&content).context("Failed to parse config file")
        } else {
            Self::parse(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Empty values count as unset.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("GITCLAIM_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("GITCLAIM_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = var("EXTRA_GITHUB_TOKEN").or_else(|| var("GITHUB_TOKEN")) {
            self.github.token = Some(token);
        }
        self.database.url = var("DATABASE_URL");
        self.upload.api_key = var("LIGHTHOUSE_API_KEY");
        if let Some(binary) = var("VLAYER_BIN_PATH") {
            self.webproof.binary = Some(PathBuf::from(binary));
        }
        if let Some(notary) = var("VLAYER_NOTARY_URL") {
            self.webproof.notary_url = Some(notary);
        }
        if let Some(url) = var("VERIFIER_URL") {
            self.verifier.url = Some(url);
        }
        self
    }

    /// Token from config, else from the environment.
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(get_github_token)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            prover_id: self.verifier.prover_id.clone(),
            verifier_id: self.verifier.verifier_id.clone(),
            fetch_timeout: Duration::from_secs(self.webproof.timeout_secs),
            verify_timeout: Duration::from_secs(self.verifier.timeout_secs),
            site_url: self.notifications.site_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_embedded_default_parses() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.github.api_base, GITHUB_API_BASE);
        assert_eq!(config.upload.gateway_url, LIGHTHOUSE_GATEWAY_URL);
        assert_eq!(config.upload.timeout_secs, 30);
        assert_eq!(config.notifications.site_url, DEFAULT_SITE_URL);
        assert!(config.upload.api_key.is_none());
        assert!(config.verifier.url.is_none());
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config = Config::parse("[server]\nhost = \"127.0.0.1\"\nport = 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.webproof.timeout_secs, 120);
        assert_eq!(config.verifier.timeout_secs, 30);
        assert_eq!(config.upload.timeout_secs, 30);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("GITCLAIM_PORT", "3000"),
            ("EXTRA_GITHUB_TOKEN", "extra"),
            ("GITHUB_TOKEN", "plain"),
            ("DATABASE_URL", "postgres://localhost/gitclaim"),
            ("LIGHTHOUSE_API_KEY", ""),
            ("VLAYER_NOTARY_URL", "https://notary.example"),
            ("VERIFIER_URL", "https://verifier.example/verify"),
        ]
        .into_iter()
        .collect();

        let config = Config::parse(DEFAULT_CONFIG)
            .unwrap()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.github.token.as_deref(), Some("extra"));
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/gitclaim")
        );
        assert!(config.upload.api_key.is_none());
        assert_eq!(
            config.webproof.notary_url.as_deref(),
            Some("https://notary.example")
        );
        assert_eq!(
            config.pipeline_settings().verify_timeout,
            Duration::from_secs(30)
        );
    }
}
