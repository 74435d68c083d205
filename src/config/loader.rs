//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/proxyns/config.toml`
//! 3. User config: `~/.config/proxyns/config.toml` of the invoking user
//!    (the one behind sudo, pkexec or doas when run as root)
//! 4. Additional config file (via `--config` flag)
//! 5. `--set key=value` overrides (highest priority)
//!
//! A key set by a later source replaces the earlier value.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::ConfigStore;
use crate::cli::Cli;
use crate::session::{Account, EnvironmentReconstructor};

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/proxyns/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "proxyns";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let invoker = if nix::unistd::geteuid().is_root() {
            EnvironmentReconstructor::from_process()
                .elevating_account()
                .and_then(Result::ok)
        } else {
            None
        };

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir(invoker.as_ref()).join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Path of the user configuration file.
    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file,
    /// invalid TOML or an unknown key is an error.
    pub fn load(&self, cli: &Cli) -> Result<ConfigStore, ConfigError> {
        let mut config = ConfigStore::defaults();
        debug!("Loaded built-in defaults");

        for path in [&self.system_path, &self.user_path] {
            if let Some(file) = self.load_file(path)? {
                config.merge(file);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        for (key, value) in &cli.overrides {
            config.set(key, value)?;
        }
        if !cli.overrides.is_empty() {
            debug!("Applied {} override(s) from CLI flags", cli.overrides.len());
        }

        Ok(config)
    }

    /// Contents of the user file alone.
    pub fn load_user(&self) -> Result<ConfigStore, ConfigError> {
        Ok(self.load_file(&self.user_path)?.unwrap_or_default())
    }

    /// Set one key in the user file, creating it if needed.
    pub fn save_user_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut user = self.load_user()?;
        user.set(key, value)?;

        if let Some(parent) = self.user_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = user.to_toml_string()?;
        fs::write(&self.user_path, contents).map_err(|e| ConfigError::WriteError {
            path: self.user_path.clone(),
            source: e,
        })?;

        debug!("Wrote {} to {:?}", key, self.user_path);
        Ok(())
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<ConfigStore>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let table: toml::Table =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(ConfigStore::from_toml(table)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// `dirs::config_dir` names root's directory under sudo, so an elevating
/// user's passwd home takes precedence.
fn user_config_dir(invoker: Option<&Account>) -> PathBuf {
    let base = match invoker {
        Some(account) if account.uid != 0 => {
            debug!("Using config of invoking user {}", account.name);
            account.home.join(".config")
        }
        _ => dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config")),
    };
    base.join(USER_CONFIG_DIR)
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn create_test_cli(args: &[&str]) -> Cli {
        let mut argv = vec!["proxyns"];
        argv.extend_from_slice(args);
        argv.push("dependencies");
        Cli::parse_from(argv)
    }

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("system.toml"), dir.join("user.toml"))
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let config = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap();

        assert_eq!(config, ConfigStore::defaults());
        assert_eq!(config.get("namespace"), Some("proxied"));
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "ip = \"203.0.113.5\"\nport = 1080\n",
        )
        .unwrap();
        fs::write(dir.path().join("user.toml"), "port = 9050\n").unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli(&[])).unwrap();

        assert_eq!(config.get("ip"), Some("203.0.113.5"));
        assert_eq!(config.get("port"), Some("9050"));
    }

    #[test]
    fn test_cli_config_and_overrides_win() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "namespace = \"user\"\n").unwrap();
        let extra = dir.path().join("extra.toml");
        fs::write(&extra, "namespace = \"extra\"\ncmd = \"firefox\"\n").unwrap();

        let cli = create_test_cli(&[
            "--config",
            extra.to_str().unwrap(),
            "--set",
            "cmd=chromium --incognito",
        ]);
        let config = loader_in(dir.path()).load(&cli).unwrap();

        assert_eq!(config.get("namespace"), Some("extra"));
        assert_eq!(config.get("cmd"), Some("chromium --incognito"));
    }

    #[test]
    fn test_missing_cli_config_is_an_error() {
        let dir = tempdir().unwrap();
        let cli = create_test_cli(&["--config", "/nonexistent/proxyns.toml"]);
        assert!(matches!(
            loader_in(dir.path()).load(&cli),
            Err(ConfigError::ReadError { .. })
        ));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "this is not valid TOML [[[").unwrap();

        let result = loader_in(dir.path()).load(&create_test_cli(&[]));
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_unknown_key_in_file_or_override() {
        let dir = tempdir().unwrap();
        let cli = create_test_cli(&["--set", "protocol=socks5"]);
        assert!(matches!(
            loader_in(dir.path()).load(&cli),
            Err(ConfigError::UnknownKey(_))
        ));

        fs::write(dir.path().join("user.toml"), "colour = \"blue\"\n").unwrap();
        assert!(matches!(
            loader_in(dir.path()).load(&create_test_cli(&[])),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_user_config_of_elevating_user() {
        let alice = Account {
            name: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/alice"),
            shell: PathBuf::from("/bin/bash"),
        };
        assert_eq!(
            user_config_dir(Some(&alice)),
            PathBuf::from("/home/alice/.config/proxyns")
        );

        let root = Account {
            name: "root".to_string(),
            uid: 0,
            home: PathBuf::from("/root"),
            ..alice
        };
        assert_eq!(user_config_dir(Some(&root)), user_config_dir(None));
        assert!(user_config_dir(None).ends_with(USER_CONFIG_DIR));
    }

    #[test]
    fn test_save_user_value() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("system.toml"),
            dir.path().join("nested").join("user.toml"),
        );

        loader.save_user_value("ip", "203.0.113.5").unwrap();
        loader.save_user_value("port", "1080").unwrap();

        let user = loader.load_user().unwrap();
        assert_eq!(user.get("ip"), Some("203.0.113.5"));
        assert_eq!(user.get("port"), Some("1080"));

        let merged = loader.load(&create_test_cli(&[])).unwrap();
        assert_eq!(merged.get("port"), Some("1080"));
        assert_eq!(merged.get("namespace"), Some("proxied"));

        assert!(matches!(
            loader.save_user_value("nope", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }
}
