//! Configuration loader

use crate::{Error, Result, WardenConfig};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<WardenConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::file_not_found(path.display().to_string()));
        }

        let content = fs::read_to_string(path).await?;
        let config: WardenConfig = serde_yaml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from default locations
    pub async fn load_default() -> Result<WardenConfig> {
        // Try .warden/config.yaml in current directory
        let local_path = PathBuf::from(".warden/config.yaml");
        if local_path.exists() {
            return Self::load_from_file(&local_path).await;
        }

        // Try ~/.warden/config.yaml
        if let Ok(home) = std::env::var("HOME") {
            let global_path = PathBuf::from(home).join(".warden/config.yaml");
            if global_path.exists() {
                return Self::load_from_file(&global_path).await;
            }
        }

        // Return default config if no file found
        Ok(WardenConfig::default())
    }

    /// Save configuration to file
    pub async fn save_to_file(config: &WardenConfig, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let yaml = serde_yaml::to_string(config)?;
        fs::write(path, yaml).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_default() {
        let config = ConfigLoader::load_default().await.unwrap();
        assert_eq!(config.version, "1.0");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let config = WardenConfig::default();
        ConfigLoader::save_to_file(&config, &path).await.unwrap();

        let loaded = ConfigLoader::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.version, config.version);
        assert_eq!(
            loaded.providers.fixed_cooldown.cooldown_seconds,
            config.providers.fixed_cooldown.cooldown_seconds
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let result = ConfigLoader::load_from_file("/definitely/not/here.yaml").await;
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "compliance:\n  weekly_warning_ratio: 0.95\n  weekly_critical_ratio: 0.87\n",
        )
        .await
        .unwrap();

        let result = ConfigLoader::load_from_file(&path).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
