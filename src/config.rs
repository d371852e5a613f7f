use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::archive::{ArchivePolicy, ProductArchivePolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub association: AssociationConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssociationConfig {
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: i64,
    #[serde(default = "default_distance_km")]
    pub distance_km: f64,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            time_window_secs: default_time_window_secs(),
            distance_km: default_distance_km(),
        }
    }
}

fn default_time_window_secs() -> i64 {
    16
}
fn default_distance_km() -> f64 {
    100.0
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_archive_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub event_policies: Vec<ArchivePolicy>,
    #[serde(default)]
    pub product_policies: Vec<ProductArchivePolicy>,
}

fn default_archive_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_max_tries")]
    pub default_max_tries: u32,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_max_tries: default_max_tries(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_tries() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub directory: PathBuf,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

/// Misconfiguration is fatal at load time; policies never fail mid-sweep.
pub fn validate(config: &Config) -> Result<()> {
    if config.association.time_window_secs <= 0 {
        anyhow::bail!("association.time_window_secs must be > 0");
    }

    if config.association.distance_km <= 0.0 {
        anyhow::bail!("association.distance_km must be > 0");
    }

    if !config.archive.disabled && config.archive.interval_secs == 0 {
        anyhow::bail!("archive.interval_secs must be > 0 unless archive.disabled = true");
    }

    if config.dispatch.default_max_tries == 0 {
        anyhow::bail!("dispatch.default_max_tries must be >= 1");
    }

    for (i, policy) in config.archive.event_policies.iter().enumerate() {
        policy
            .validate()
            .with_context(|| format!("archive.event_policies[{}]", i))?;
    }

    for (i, policy) in config.archive.product_policies.iter().enumerate() {
        policy
            .validate()
            .with_context(|| format!("archive.product_policies[{}]", i))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_apply() {
        let config = parse(
            r#"
            [db]
            path = "index.db"

            [storage]
            directory = "payloads"
            "#,
        )
        .unwrap();

        assert_eq!(config.association.time_window_secs, 16);
        assert_eq!(config.association.distance_km, 100.0);
        assert_eq!(config.archive.interval_secs, 300);
        assert!(!config.archive.disabled);
        assert_eq!(config.dispatch.default_max_tries, 1);
        assert_eq!(config.dispatch.default_timeout_secs, 30);
    }

    #[test]
    fn rejects_inverted_age_bounds() {
        let err = parse(
            r#"
            [db]
            path = "index.db"

            [storage]
            directory = "payloads"

            [[archive.event_policies]]
            name = "bad"
            min_event_age_secs = 3600
            max_event_age_secs = 60
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("event_policies"), "{}", err);
    }

    #[test]
    fn rejects_mixed_age_and_absolute_time() {
        let err = parse(
            r#"
            [db]
            path = "index.db"

            [storage]
            directory = "payloads"

            [[archive.event_policies]]
            name = "mixed"
            min_event_age_secs = 60
            min_event_time = "2020-01-01T00:00:00Z"
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("event_policies"), "{}", err);
    }

    #[test]
    fn rejects_zero_time_window() {
        let err = parse(
            r#"
            [db]
            path = "index.db"

            [storage]
            directory = "payloads"

            [association]
            time_window_secs = 0
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("time_window_secs"));
    }
}
