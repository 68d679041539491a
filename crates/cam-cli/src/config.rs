//! Configuration file management for camctl.
//!
//! Provides a TOML-based config file at `~/.config/cam/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cam_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the camctl config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/cam` or `~/.config/cam`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("cam");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("cam")
}

/// Return the path to the camctl config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CamConfig {
    pub db_config: DbConfig,
}

impl CamConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > `DATABASE_PATH` env > config file > `DbConfig::DEFAULT_PATH`.
    pub fn resolve(cli_db_path: Option<&str>) -> Self {
        let file_config = load_config().ok();

        let db_path = if let Some(path) = cli_db_path {
            path.to_string()
        } else if let Ok(path) = std::env::var("DATABASE_PATH") {
            path
        } else if let Some(cfg) = file_config {
            cfg.database.path
        } else {
            DbConfig::DEFAULT_PATH.to_string()
        };

        Self {
            db_config: DbConfig::new(db_path),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("cam");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                path: "/var/lib/cam/cam.db".to_string(),
            },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.path, original.database.path);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_env() {
        unsafe { std::env::set_var("DATABASE_PATH", "/env/cam.db") };
        let config = CamConfig::resolve(Some("/cli/cam.db"));
        assert_eq!(config.db_config.database_path, "/cli/cam.db");
        unsafe { std::env::remove_var("DATABASE_PATH") };
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        unsafe { std::env::remove_var("DATABASE_PATH") };
        let config = CamConfig::resolve(None);
        assert_eq!(config.db_config.database_path, DbConfig::DEFAULT_PATH);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("cam/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
