//! Configuration file management for the `foreman` CLI.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default. The file
//! itself never goes straight to `foreman_core::config::ServiceConfig` — it
//! is applied as an env-var fallback before `ServiceConfig::resolve` runs,
//! so the core crate keeps a single, uniform resolution entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_core::config::{CliOverrides, ServiceConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub tracker: TrackerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Path to the tracker CLI binary used by External Sync.
    pub cli_path: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
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

/// Apply the on-disk config file as an env-var fallback: for each of
/// `FOREMAN_DATABASE_URL` / `FOREMAN_TRACKER_CLI_PATH`, set it from the
/// config file only if the real environment does not already supply it.
/// This keeps `ServiceConfig::resolve`'s env-var tier as the single place
/// that interprets those variables, while still honoring the documented
/// CLI flag > env var > file > default precedence.
fn apply_config_file_env_fallbacks() {
    let Ok(file) = load_config() else {
        return;
    };

    if std::env::var("FOREMAN_DATABASE_URL").is_err() {
        unsafe { std::env::set_var("FOREMAN_DATABASE_URL", &file.database.url) };
    }
    if let Some(cli_path) = file.tracker.cli_path {
        if std::env::var("FOREMAN_TRACKER_CLI_PATH").is_err() {
            unsafe { std::env::set_var("FOREMAN_TRACKER_CLI_PATH", cli_path) };
        }
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Resolve the full service configuration, applying the config-file
/// env-var fallback first, then delegating to `ServiceConfig::resolve` for
/// the CLI-flag > env-var > default chain.
pub fn resolve(cli_database_url: Option<&str>, cli_data_dir: Option<PathBuf>) -> Result<ServiceConfig> {
    apply_config_file_env_fallbacks();

    ServiceConfig::resolve(CliOverrides {
        database_url: cli_database_url.map(str::to_string),
        data_dir: cli_data_dir,
    })
    .context("resolving service configuration")
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = env_lock().lock().unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("foreman");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            tracker: TrackerSection {
                cli_path: Some("/usr/local/bin/tracker".to_string()),
            },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.tracker.cli_path, original.tracker.cli_path);
    }

    #[test]
    fn config_file_without_tracker_section_parses() {
        let toml_str = "[database]\nurl = \"postgresql://localhost:5432/foreman\"\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.tracker.cli_path, None);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_env() {
        let _lock = env_lock().lock().unwrap();
        unsafe { std::env::set_var("FOREMAN_DATABASE_URL", "postgresql://env:5432/envdb") };

        let cfg = resolve(Some("postgresql://cli:5432/clidb"), None).unwrap();
        assert_eq!(cfg.db.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("FOREMAN_DATABASE_URL") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("foreman/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
