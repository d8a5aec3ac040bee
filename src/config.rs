//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::account::AttachmentParams;
use crate::network::NodeSettings;
use crate::signing::{Security, Seed};

/// Environment variable holding the account seed
pub const SEED_ENV: &str = "TANGLE_SEED";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub attachment: AttachmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Default security level of generated addresses (1-3)
    #[serde(default = "default_security")]
    pub security: u8,
    /// Directory for state and history files
    #[serde(default = "default_persistence_path")]
    pub persistence_path: PathBuf,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            security: default_security(),
            persistence_path: default_persistence_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentConfig {
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_min_weight_magnitude")]
    pub min_weight_magnitude: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            min_weight_magnitude: default_min_weight_magnitude(),
            delay_ms: default_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_provider() -> String {
    "http://localhost:14265".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_balance_threshold() -> u8 {
    100
}

fn default_security() -> u8 {
    2
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_depth() -> u32 {
    3
}

fn default_min_weight_magnitude() -> u32 {
    9
}

fn default_delay_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_depth() -> u32 {
    6
}

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("node.provider", default_provider())?
            .set_default("node.timeout_ms", default_timeout_ms() as i64)?
            .set_default("node.max_retries", default_max_retries() as i64)?
            .set_default("node.balance_threshold", default_balance_threshold() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TANGLE_)
            .add_source(
                config::Environment::with_prefix("TANGLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.node.provider.trim().is_empty() {
            anyhow::bail!("node.provider must not be empty");
        }
        url::Url::parse(&self.node.provider)
            .with_context(|| format!("Invalid node.provider URL: {}", self.node.provider))?;

        if self.node.timeout_ms == 0 {
            anyhow::bail!("node.timeout_ms must be positive");
        }

        if self.node.balance_threshold > 100 {
            anyhow::bail!("node.balance_threshold cannot exceed 100");
        }

        Security::try_from(self.account.security)
            .with_context(|| format!("account.security must be 1, 2 or 3, got {}", self.account.security))?;

        if self.attachment.depth == 0 {
            anyhow::bail!("attachment.depth must be positive");
        }

        if !(1..=81).contains(&self.attachment.min_weight_magnitude) {
            anyhow::bail!(
                "attachment.min_weight_magnitude must be between 1 and 81, got {}",
                self.attachment.min_weight_magnitude
            );
        }

        if self.attachment.max_depth == 0 {
            anyhow::bail!("attachment.max_depth must be positive");
        }

        if self.attachment.delay_ms < self.attachment.poll_interval_ms {
            tracing::warn!(
                "attachment.delay_ms is shorter than poll_interval_ms - bundles will be polled back to back"
            );
        }

        Ok(())
    }

    pub fn security(&self) -> Result<Security> {
        Security::try_from(self.account.security).map_err(anyhow::Error::from)
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            provider: self.node.provider.clone(),
            timeout_ms: self.node.timeout_ms,
            max_retries: self.node.max_retries,
            balance_threshold: self.node.balance_threshold,
        }
    }

    pub fn attachment_params(&self) -> AttachmentParams {
        AttachmentParams {
            depth: self.attachment.depth,
            min_weight_magnitude: self.attachment.min_weight_magnitude,
            delay: Duration::from_millis(self.attachment.delay_ms),
            poll_interval: Duration::from_millis(self.attachment.poll_interval_ms),
            max_depth: self.attachment.max_depth,
        }
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Node:
    provider: {}
    timeout: {}ms
    max_retries: {}
    balance_threshold: {}%
  Account:
    security: {}
    persistence_path: {}
  Attachment:
    depth: {}
    min_weight_magnitude: {}
    delay: {}ms
    poll_interval: {}ms
    max_depth: {}
"#,
            mask_url(&self.node.provider),
            self.node.timeout_ms,
            self.node.max_retries,
            self.node.balance_threshold,
            self.account.security,
            self.account.persistence_path.display(),
            self.attachment.depth,
            self.attachment.min_weight_magnitude,
            self.attachment.delay_ms,
            self.attachment.poll_interval_ms,
            self.attachment.max_depth,
        )
    }
}

/// Read the seed from the environment
pub fn seed_from_env() -> Result<Seed> {
    let trytes = std::env::var(SEED_ENV).with_context(|| format!("{} is not set", SEED_ENV))?;
    Seed::from_trytes(trytes.trim()).map_err(anyhow::Error::from)
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                provider: default_provider(),
                timeout_ms: default_timeout_ms(),
                max_retries: default_max_retries(),
                balance_threshold: default_balance_threshold(),
            },
            account: AccountConfig::default(),
            attachment: AttachmentConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_ok!(config.validate());
        assert_eq!(config.security().unwrap(), Security::Medium);

        let params = config.attachment_params();
        assert_eq!(params, AttachmentParams::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.toml");
        std::fs::write(
            &path,
            r#"
[node]
provider = "https://node.example:443"

[attachment]
min_weight_magnitude = 14
delay_ms = 5000
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.provider, "https://node.example:443");
        assert_eq!(config.node.timeout_ms, 10_000);
        assert_eq!(config.attachment.min_weight_magnitude, 14);
        assert_eq!(config.attachment_params().delay, Duration::from_secs(5));
        assert_eq!(config.account.security, 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.account.security = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.attachment.min_weight_magnitude = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.provider = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://node.example.com?token=secret"),
            "https://node.example.com?***"
        );
        assert_eq!(mask_url("https://node.example.com"), "https://node.example.com");
    }
}
