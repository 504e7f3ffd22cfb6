use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::api::Extension;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub api: ApiSettings,
    pub crawler: CrawlerSettings,
    pub storage: StorageSettings,
}

/// Settings for the POI service and the boundary lookup service
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub page_size: u32,
    /// Minimum detail level; `all` forces full records whatever fields are exported
    pub extension: Extension,
    pub request_timeout_secs: u64,
    pub boundary_url: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://restapi.amap.com/v3/place/polygon".to_string(),
            page_size: 20,
            extension: Extension::Base,
            request_timeout_secs: 10,
            boundary_url: "https://geo.datav.aliyun.com/areas_v3/bound".to_string(),
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Crawl engine settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Total passes over unfinished jobs, the first one included
    pub retry_rounds: u32,
    /// Total partitioning passes, the first one included
    pub partition_rounds: u32,
    /// Completed jobs buffered before a write to the job store
    pub flush_every: usize,
    pub poll_interval_ms: u64,
    /// Consecutive empty polls before a batch is declared timed out
    pub poll_attempts: u32,
    pub max_split_depth: u32,
    pub large_task_warning: usize,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            retry_rounds: 3,
            partition_rounds: 3,
            flush_every: 50,
            poll_interval_ms: 500,
            poll_attempts: 40,
            max_split_depth: 18,
            large_task_warning: 5000,
        }
    }
}

impl CrawlerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let path = CrawlerConfig::data_dir().join("poi-crawler.db");
        Self {
            database_url: format!("sqlite://{}", path.display()),
        }
    }
}

impl CrawlerConfig {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "poi-crawler", "poi-crawler")
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = match Self::project_dirs() {
            Some(proj_dirs) => proj_dirs.config_dir().to_path_buf(),
            None => PathBuf::from("./config"),
        };

        // Create the profiles directory if it doesn't exist
        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Where the database and log file live by default
    pub fn data_dir() -> PathBuf {
        match Self::project_dirs() {
            Some(proj_dirs) => proj_dirs.data_dir().to_path_buf(),
            None => PathBuf::from("./data"),
        }
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir()
            .join("profiles")
            .join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profiles_dir = Self::config_dir().join("profiles");

        if !profiles_dir.exists() {
            fs::create_dir_all(&profiles_dir)
                .context(format!("Failed to create profiles directory: {}", profiles_dir.display()))?;
        }

        let profile_path = profiles_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let profiles_dir = Self::config_dir().join("profiles");

        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(profiles_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = CrawlerConfig::from_yaml("crawler:\n  retry_rounds: 5\n").unwrap();

        assert_eq!(config.crawler.retry_rounds, 5);
        assert_eq!(config.crawler.partition_rounds, 3);
        assert_eq!(config.api.page_size, 20);
        assert_eq!(config.api.extension, Extension::Base);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles").join("custom.yaml");

        let mut config = CrawlerConfig::default();
        config.api.extension = Extension::All;
        config.crawler.flush_every = 10;
        config.save_to_file(&path).unwrap();

        let loaded = CrawlerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_default_database_is_sqlite() {
        let config = CrawlerConfig::default();
        assert!(config.storage.database_url.starts_with("sqlite://"));
        assert!(config.storage.database_url.ends_with("poi-crawler.db"));
    }
}
