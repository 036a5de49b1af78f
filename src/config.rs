//! Dropbox and daemon configuration types (spec §6), `serde`/`serde_yaml`
//! backed as described in `SPEC_FULL.md` §2.3. Loading a file from disk is a
//! thin, out-of-scope entry point (spec §1); the types and the merge rule
//! (spec §9 "Configuration injection") are in scope.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_stable_after() -> u64 {
    60
}

/// `.dropbox.yaml` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxFileConfig {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub auto_approve: Vec<String>,
    #[serde(default)]
    pub one_package_per_file: bool,
    /// Seconds; `0` disables the per-dropbox override (spec §6).
    #[serde(default)]
    pub update_packages_every: u64,
    #[serde(default)]
    pub transactions: BTreeMap<String, BTreeMap<String, ConfigValue>>,
}

impl Default for DropboxFileConfig {
    fn default() -> Self {
        DropboxFileConfig {
            package: PackageConfig::default(),
            auto_approve: Vec::new(),
            one_package_per_file: false,
            update_packages_every: 0,
            transactions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default = "default_stable_after")]
    pub stable_after: u64,
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        PackageConfig {
            stable_after: default_stable_after(),
            search_paths: Vec::new(),
        }
    }
}

/// Free-form per-transaction-type configuration value (spec §6
/// `transactions.<name>.*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Daemon-wide configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub search: SearchConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub authentication: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_max_depth")]
    pub max_directory_depth: usize,
    #[serde(default = "default_config_glob")]
    pub config_file_glob: String,
}

fn default_max_depth() -> usize {
    1
}
fn default_config_glob() -> String {
    ".dropbox.yaml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "default_check_dropboxes")]
    pub dropboxes_every: u64,
    #[serde(default = "default_check_packages")]
    pub packages_every: u64,
    #[serde(default = "default_check_transactions")]
    pub transactions_every: u64,
}

fn default_check_dropboxes() -> u64 {
    60
}
fn default_check_packages() -> u64 {
    30
}
fn default_check_transactions() -> u64 {
    5
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            dropboxes_every: default_check_dropboxes(),
            packages_every: default_check_packages(),
            transactions_every: default_check_transactions(),
        }
    }
}

/// `1 ≤ N < 17` (spec §6, §4.10 worker-pool cap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    #[serde(default = "default_threads")]
    pub num_update_threads: usize,
    #[serde(default = "default_threads")]
    pub num_operation_threads: usize,
}

fn default_threads() -> usize {
    4
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        ThreadsConfig {
            num_update_threads: default_threads(),
            num_operation_threads: default_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_privileged_group")]
    pub privileged_group: String,
}

fn default_privileged_group() -> String {
    "dropbox-admins".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            privileged_group: default_privileged_group(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, n) in [
            ("num_update_threads", self.threads.num_update_threads),
            ("num_operation_threads", self.threads.num_operation_threads),
        ] {
            if n == 0 || n >= 17 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must satisfy 1 <= N < 17, got {n}"
                )));
            }
        }
        Ok(())
    }
}

impl DropboxFileConfig {
    pub fn load(path: &Path) -> Result<DropboxFileConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Merges a per-transaction-type configuration value: daemon default,
/// overridden by dropbox value, overridden by an explicit CLI override
/// (spec §9 "Configuration injection"). Last non-`None` value wins.
pub fn merge_config_value(
    daemon: Option<&ConfigValue>,
    dropbox: Option<&ConfigValue>,
    cli_override: Option<&ConfigValue>,
) -> Option<ConfigValue> {
    cli_override
        .or(dropbox)
        .or(daemon)
        .cloned()
}

/// Resolves `Y/M/D/H/MIN` placeholders in a destination template against a
/// fixed instant (spec §9; §4.9 transfer transaction), without relying on a
/// strptime-equivalent crate for this small substitution set.
pub fn resolve_placeholders(template: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    template
        .replace("{Y}", &format!("{:04}", now.format("%Y")))
        .replace("{M}", &format!("{:02}", now.format("%m")))
        .replace("{D}", &format!("{:02}", now.format("%d")))
        .replace("{H}", &format!("{:02}", now.format("%H")))
        .replace("{MIN}", &format!("{:02}", now.format("%M")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn merge_rule_prefers_override_then_dropbox_then_daemon() {
        let daemon = ConfigValue::Str("daemon".into());
        let dropbox = ConfigValue::Str("dropbox".into());
        let cli = ConfigValue::Str("cli".into());

        assert_eq!(
            merge_config_value(Some(&daemon), None, None),
            Some(ConfigValue::Str("daemon".into()))
        );
        assert_eq!(
            merge_config_value(Some(&daemon), Some(&dropbox), None),
            Some(ConfigValue::Str("dropbox".into()))
        );
        assert_eq!(
            merge_config_value(Some(&daemon), Some(&dropbox), Some(&cli)),
            Some(ConfigValue::Str("cli".into()))
        );
    }

    #[test]
    fn placeholder_substitution() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
        assert_eq!(
            resolve_placeholders("/archive/{Y}/{M}/{D}", now),
            "/archive/2024/03/07"
        );
    }

    #[test]
    fn parses_dropbox_yaml() {
        let yaml = r#"
package:
  stable_after: 30
  search_paths:
    - /data/incoming
auto_approve: [delete]
transactions:
  delete:
    after_being_stable_for: 86400
"#;
        let cfg: DropboxFileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.package.stable_after, 30);
        assert_eq!(cfg.auto_approve, vec!["delete".to_string()]);
        assert_eq!(
            cfg.transactions["delete"]["after_being_stable_for"].as_int(),
            Some(86400)
        );
    }

    #[test]
    fn thread_count_validation() {
        let mut cfg = DaemonConfig {
            search: SearchConfig {
                paths: vec![],
                max_directory_depth: 1,
                config_file_glob: ".dropbox.yaml".into(),
            },
            check: CheckConfig::default(),
            threads: ThreadsConfig::default(),
            db: DbConfig { url: "sqlite://x".into() },
            authentication: AuthConfig::default(),
        };
        assert!(cfg.validate().is_ok());
        cfg.threads.num_update_threads = 17;
        assert!(cfg.validate().is_err());
    }
}
