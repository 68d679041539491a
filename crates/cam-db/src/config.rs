use std::env;

/// Database configuration.
///
/// Reads from the `DATABASE_PATH` environment variable, falling back to
/// `./data/cam.db` when unset, per SPEC_FULL.md §6.3.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem path to the SQLite database file.
    pub database_path: String,
}

impl DbConfig {
    /// The default database path used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "./data/cam.db";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| Self::DEFAULT_PATH.to_owned());
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// A `sqlx` connection URL for this path, creating the file if absent.
    pub fn connect_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_PATH);
        assert_eq!(cfg.database_path, "./data/cam.db");
    }

    #[test]
    fn connect_url_includes_mode_rwc() {
        let cfg = DbConfig::new("/tmp/cam.db");
        assert_eq!(cfg.connect_url(), "sqlite:///tmp/cam.db?mode=rwc");
    }

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("/var/lib/cam/other.db");
        assert_eq!(cfg.database_path, "/var/lib/cam/other.db");
    }
}
