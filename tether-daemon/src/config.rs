//! Daemon configuration.
//!
//! Every flag falls back to a `TETHER_*` environment variable, which in turn
//! may come from a `.env` file loaded at startup.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use clap::Args;
use tether_core::WorkflowPolicy;

/// Default manifest for the management tools install command.
pub const DEFAULT_MANIFEST_URL: &str = "https://localhost/Manifest.plist";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} is out of range")]
    OutOfRange(&'static str),

    #[error("management tools manifest URL is empty")]
    EmptyManifest,
}

/// Settings shared by `serve` and the library [`crate::Engine`].
#[derive(Debug, Clone, Args)]
pub struct DaemonConfig {
    /// Directory holding the device database and transaction log
    #[arg(long, env = "TETHER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// PEM bundle of certificate authorities trusted to sign checkins
    #[arg(long, env = "TETHER_TRUST_ANCHORS")]
    pub trust_anchors: Option<PathBuf>,

    /// Seconds between workflow sweeps
    #[arg(long, env = "TETHER_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    pub sweep_interval_secs: u64,

    /// Seconds a workflow stage may sit idle before its command is re-issued
    #[arg(long, env = "TETHER_RETRY_AFTER_SECS", default_value_t = 5)]
    pub retry_after_secs: u64,

    /// Seconds between DeviceConfigured and the management tools install
    #[arg(long, env = "TETHER_INSTALL_DELAY_SECS", default_value_t = 5)]
    pub install_delay_secs: u64,

    /// Store write timeout in milliseconds
    #[arg(long, env = "TETHER_STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,

    /// Push notification timeout in milliseconds
    #[arg(long, env = "TETHER_PUSH_TIMEOUT_MS", default_value_t = 5000)]
    pub push_timeout_ms: u64,

    /// Signature verification timeout in milliseconds
    #[arg(long, env = "TETHER_VERIFY_TIMEOUT_MS", default_value_t = 1000)]
    pub verify_timeout_ms: u64,

    /// Manifest URL for the InstallManagementTools command
    #[arg(long, env = "TETHER_MANAGEMENT_TOOLS_MANIFEST", default_value = DEFAULT_MANIFEST_URL)]
    pub management_tools_manifest: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            trust_anchors: None,
            sweep_interval_secs: 5,
            retry_after_secs: 5,
            install_delay_secs: 5,
            store_timeout_ms: 2000,
            push_timeout_ms: 5000,
            verify_timeout_ms: 1000,
            management_tools_manifest: DEFAULT_MANIFEST_URL.to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("sweep interval", self.sweep_interval_secs),
            ("retry-after", self.retry_after_secs),
            ("install delay", self.install_delay_secs),
            ("store timeout", self.store_timeout_ms),
            ("push timeout", self.push_timeout_ms),
            ("verify timeout", self.verify_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if seconds(self.retry_after_secs).is_none() {
            return Err(ConfigError::OutOfRange("retry-after"));
        }
        if seconds(self.install_delay_secs).is_none() {
            return Err(ConfigError::OutOfRange("install delay"));
        }
        if self.management_tools_manifest.trim().is_empty() {
            return Err(ConfigError::EmptyManifest);
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tether")
        })
    }

    pub fn trust_anchors_path(&self) -> PathBuf {
        self.trust_anchors
            .clone()
            .unwrap_or_else(|| self.data_dir().join("ca.pem"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("tether.db")
    }

    pub fn transaction_log_path(&self) -> PathBuf {
        self.data_dir().join("transactions.jsonl")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// Workflow timing. Call after [`validate`](Self::validate).
    pub fn workflow_policy(&self) -> WorkflowPolicy {
        let secs = |s: u64| seconds(s).unwrap_or(TimeDelta::MAX);
        WorkflowPolicy {
            retry_after: secs(self.retry_after_secs),
            install_delay: secs(self.install_delay_secs),
        }
    }
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    TimeDelta::try_seconds(i64::try_from(secs).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: DaemonConfig,
    }

    #[test]
    fn defaults_match_parsed_defaults() {
        let parsed = TestCli::try_parse_from(["tether"]).unwrap().config;
        let default = DaemonConfig::default();
        assert_eq!(parsed.sweep_interval_secs, default.sweep_interval_secs);
        assert_eq!(parsed.retry_after_secs, default.retry_after_secs);
        assert_eq!(parsed.store_timeout_ms, default.store_timeout_ms);
        assert_eq!(parsed.management_tools_manifest, DEFAULT_MANIFEST_URL);
        assert!(default.validate().is_ok());
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let config = DaemonConfig {
            data_dir: Some(PathBuf::from("/var/lib/tether")),
            ..DaemonConfig::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/tether/tether.db"));
        assert_eq!(
            config.trust_anchors_path(),
            PathBuf::from("/var/lib/tether/ca.pem")
        );
        assert_eq!(
            config.transaction_log_path(),
            PathBuf::from("/var/lib/tether/transactions.jsonl")
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = DaemonConfig {
            store_timeout_ms: 0,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("store timeout"))));

        let config = DaemonConfig {
            sweep_interval_secs: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrepresentable_durations_are_rejected() {
        let config = DaemonConfig {
            retry_after_secs: u64::MAX,
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange("retry-after"))
        ));
    }

    #[test]
    fn flags_override_defaults() {
        let config = TestCli::try_parse_from(["tether", "--retry-after-secs", "30"])
            .unwrap()
            .config;
        assert_eq!(config.workflow_policy().retry_after, TimeDelta::seconds(30));
        assert_eq!(config.workflow_policy().install_delay, TimeDelta::seconds(5));
    }
}
