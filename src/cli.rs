//! Command-line interface definitions for proxyns.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run programs in a network namespace whose traffic goes through a proxy.
///
/// proxyns builds a network namespace wired to the host by a veth pair,
/// routes everything inside it through a TUN device served by tun2socks, and
/// runs commands there as the invoking user with their display, audio and
/// session bus still reachable.
#[derive(Parser, Debug)]
#[command(name = "proxyns")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// Merged on top of the system and user configs.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Override a config key for this invocation (repeatable).
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        global = true
    )]
    pub overrides: Vec<(String, String)>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Cli {
    /// Whether the subcommand changes the host and so belongs in the audit log.
    ///
    /// `setup --dry-run` only prints commands.
    pub fn audited(&self) -> bool {
        !matches!(self.command, Commands::Setup { dry_run: true })
    }
}

/// Subcommands for proxyns.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Check whether a host answers ICMP echo.
    Ping {
        /// Host to ping (defaults to the configured proxy ip).
        host: Option<String>,
    },

    /// Check whether a TCP port accepts connections.
    Port {
        /// Host to connect to (defaults to the configured proxy ip).
        host: Option<String>,
        /// Port to connect to (defaults to the configured proxy port).
        port: Option<u16>,
    },

    /// List missing host tools and privileges.
    Dependencies,

    /// Create the proxied namespace and start the relay.
    Setup {
        /// Print the commands setup would run without changing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop the relay and remove the namespace.
    Clean {
        /// Remove leftovers even when no setup is recorded.
        #[arg(long)]
        force: bool,
    },

    /// Run a command inside the namespace as the invoking user.
    Run {
        /// Command line to run (defaults to the configured `cmd`, then a
        /// login shell).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show the recovered session environment.
    Env {
        /// Rebuild it from the current process instead of the saved copy.
        #[arg(long)]
        refresh: bool,
    },

    /// Inspect or edit configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// `config` subcommands.
#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommand {
    /// Print the merged configuration.
    Show,
    /// Set a key in the user config file.
    Set {
        /// Config key.
        key: String,
        /// New value.
        value: String,
    },
    /// Print the user config file path.
    Path,
}

/// Parse `KEY=VALUE`.
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_basic() {
        let cli = Cli::parse_from(["proxyns", "setup"]);
        assert_eq!(cli.command, Commands::Setup { dry_run: false });
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
        assert!(cli.overrides.is_empty());
    }

    #[test]
    fn test_cli_parse_with_options() {
        let cli = Cli::parse_from([
            "proxyns",
            "-vv",
            "--set",
            "ip=203.0.113.5",
            "--set",
            "cmd=firefox --private-window",
            "setup",
            "--dry-run",
            "-c",
            "/tmp/extra.toml",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.command, Commands::Setup { dry_run: true });
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
        assert_eq!(
            cli.overrides,
            vec![
                ("ip".to_string(), "203.0.113.5".to_string()),
                ("cmd".to_string(), "firefox --private-window".to_string()),
            ]
        );
    }

    #[test]
    fn test_dry_run_is_not_audited() {
        assert!(!Cli::parse_from(["proxyns", "setup", "--dry-run"]).audited());
        assert!(Cli::parse_from(["proxyns", "setup"]).audited());
        assert!(Cli::parse_from(["proxyns", "clean"]).audited());
    }

    #[test]
    fn test_run_passes_arguments_through() {
        let cli = Cli::parse_from(["proxyns", "run", "curl", "-s", "https://example.com"]);
        assert_eq!(
            cli.command,
            Commands::Run {
                command: vec![
                    "curl".to_string(),
                    "-s".to_string(),
                    "https://example.com".to_string()
                ]
            }
        );

        let cli = Cli::parse_from(["proxyns", "run"]);
        assert_eq!(cli.command, Commands::Run { command: vec![] });
    }

    #[test]
    fn test_probe_defaults() {
        let cli = Cli::parse_from(["proxyns", "port"]);
        assert_eq!(
            cli.command,
            Commands::Port {
                host: None,
                port: None
            }
        );

        let cli = Cli::parse_from(["proxyns", "port", "example.com", "443"]);
        assert_eq!(
            cli.command,
            Commands::Port {
                host: Some("example.com".to_string()),
                port: Some(443)
            }
        );
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::parse_from(["proxyns", "config", "set", "port", "9050"]);
        assert_eq!(
            cli.command,
            Commands::Config(ConfigCommand::Set {
                key: "port".to_string(),
                value: "9050".to_string()
            })
        );
        let cli = Cli::parse_from(["proxyns", "clean", "--force"]);
        assert_eq!(cli.command, Commands::Clean { force: true });
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("dns=1.1.1.1,9.9.9.9"),
            Ok(("dns".to_string(), "1.1.1.1,9.9.9.9".to_string()))
        );
        assert_eq!(parse_key_value("cmd="), Ok(("cmd".to_string(), String::new())));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert!(Cli::try_parse_from(["proxyns", "--set", "bad", "setup"]).is_err());
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["proxyns"]).is_err());
    }
}
