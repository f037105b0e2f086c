//! Configuration discovery and loading
//!
//! Discovery hierarchy:
//! 1. Explicit `--config` path
//! 2. Current directory: ./cotask.toml or ./.cotask/config.toml
//! 3. User config: ~/.cotask/config.toml
//! 4. Built-in defaults

use crate::env;
use crate::scheduler::SchedulerConfig;
use anyhow::{Context, Result};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit override, or the first config found in the hierarchy
    pub fn discover_config(config_override: Option<&Path>) -> Result<SchedulerConfig> {
        if let Some(path) = config_override {
            info!("Loading configuration override from: {:?}", path);
            return SchedulerConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path));
        }

        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return SchedulerConfig::from_toml_file(&config_path)
                .with_context(|| format!("Failed to load configuration from {:?}", config_path));
        }

        info!("No configuration file found, using defaults");
        Ok(SchedulerConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::first_existing(Self::get_config_candidates())
    }

    fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }
        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(current_dir) = std_env::current_dir() {
            candidates.extend(env::local_config_file_paths(&current_dir));
        }
        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }
        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Write the default configuration under `root`'s hidden directory,
    /// leaving an existing file untouched
    pub fn create_default_config(root: &Path) -> Result<PathBuf> {
        let config_dir = env::cotask_dir_path(root);
        let config_path = env::user_config_file_path(root);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            SchedulerConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }
        Ok(config_path)
    }

    /// Print the hierarchy and the effective configuration
    pub fn show_discovery_info(config_override: Option<&Path>) -> Result<()> {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let mut candidates = Vec::new();
        if let Some(path) = config_override {
            candidates.push(path.to_path_buf());
        }
        candidates.extend(Self::get_config_candidates());

        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match config_override
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file)
        {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        let config = Self::discover_config(config_override)?;
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_override_is_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        fs::write(&path, "idle_interval_ms = 7\n").unwrap();

        let config = ConfigDiscovery::discover_config(Some(&path)).unwrap();
        assert_eq!(config.idle_interval_ms, 7);
    }

    #[test]
    fn test_missing_override_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.toml");
        assert!(ConfigDiscovery::discover_config(Some(&path)).is_err());
    }

    #[test]
    fn test_create_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = ConfigDiscovery::create_default_config(temp_dir.path()).unwrap();
        assert!(path.is_file());

        let loaded = SchedulerConfig::from_toml_file(&path).unwrap();
        assert_eq!(
            loaded.idle_interval_ms,
            SchedulerConfig::default().idle_interval_ms
        );

        // second call keeps the existing file
        fs::write(&path, "idle_interval_ms = 3\n").unwrap();
        ConfigDiscovery::create_default_config(temp_dir.path()).unwrap();
        let kept = SchedulerConfig::from_toml_file(&path).unwrap();
        assert_eq!(kept.idle_interval_ms, 3);
    }

    #[test]
    fn test_local_candidates_come_first() {
        let temp_dir = TempDir::new().unwrap();
        let local = env::local_config_file_paths(temp_dir.path());
        assert_eq!(local[0].file_name().unwrap(), "cotask.toml");

        fs::create_dir_all(env::cotask_dir_path(temp_dir.path())).unwrap();
        fs::write(&local[1], "").unwrap();
        assert_eq!(ConfigDiscovery::first_existing(local.clone()), Some(local[1].clone()));
    }
}
