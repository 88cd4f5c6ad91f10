#![deny(unsafe_code)]

//! perch CLI: runs the daemon and talks to it over the control socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perch_config::AppConfig;
use perch_core::{Daemon, IpcClient, LogCollector, Message};

/// perch: a desktop companion daemon.
#[derive(Debug, Parser)]
#[command(name = "perch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file [default: $XDG_CONFIG_HOME/perch/perch.toml].
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket path, overriding the configuration.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Send a command to the running daemon.
    ///
    /// Fields are separated by ':', e.g. `perch send brightness set: 40`.
    /// Without words, lists the available commands.
    Send {
        /// Keep the connection open and print messages as they arrive.
        #[arg(short, long)]
        follow: bool,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,

        /// Show the default configuration.
        #[arg(long, conflicts_with = "show")]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(perch_config::paths::default_config_path);
    let config = load_config(&config_path, cli.config.is_some()).await?;

    let collector = LogCollector::default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose, &config.logging.level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(collector.clone())
        .init();

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| perch_config::paths::socket_path(&config));

    match cli.command {
        Commands::Start => cmd_start(config, config_path, socket_path, collector).await?,
        Commands::Send { follow, words } => cmd_send(&socket_path, &words, follow).await?,
        Commands::Config { show, default } => cmd_config(&config, &config_path, show, default)?,
    }

    Ok(())
}

async fn cmd_start(
    config: AppConfig,
    config_path: PathBuf,
    socket_path: PathBuf,
    collector: LogCollector,
) -> Result<()> {
    info!(config = %config_path.display(), "Starting perch daemon");

    let daemon = Daemon::new(config)
        .with_config_path(config_path)
        .with_socket_path(socket_path)
        .with_log_reader(collector.reader());
    daemon.run().await?;

    Ok(())
}

async fn cmd_send(socket_path: &Path, words: &[String], follow: bool) -> Result<()> {
    let request = parse_invocation(words);

    let responses = if follow {
        let mut client = IpcClient::connect(socket_path).await?;
        client.send(&request).await?;
        let mut errors = 0;
        while let Some(response) = client.recv().await? {
            errors += usize::from(print_response(&response));
        }
        errors
    } else {
        IpcClient::oneshot(socket_path, &request)
            .await?
            .iter()
            .map(|response| usize::from(print_response(response)))
            .sum()
    };

    if responses > 0 {
        bail!("daemon reported {responses} error(s)");
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, config_path: &Path, show: bool, default: bool) -> Result<()> {
    if default {
        println!("{}", AppConfig::default().to_toml()?);
    } else if show {
        println!("{}", config.to_toml()?);
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load `path`. A missing file falls back to defaults unless it was named
/// explicitly on the command line.
async fn load_config(path: &Path, explicit: bool) -> Result<AppConfig> {
    let config = if explicit {
        AppConfig::load(path).await
    } else {
        AppConfig::load_or_default(path).await
    };
    config.with_context(|| format!("failed to load configuration from '{}'", path.display()))
}

/// Log filter when `RUST_LOG` is unset: `-v` / `-vv` win over the
/// configured level.
fn default_filter(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Build a request from command-line words: words are joined, fields are
/// split on ':', and whitespace inside each field is collapsed.
fn parse_invocation(words: &[String]) -> Message {
    let line = words.join(" ");
    let mut fields = line
        .split(':')
        .map(|field| field.split_whitespace().collect::<Vec<_>>().join(" "));

    let command = fields.next().unwrap_or_default();
    let value = fields.next().unwrap_or_default();
    Message::new(command, value).with_complement(fields)
}

/// Print one response; errors go to stderr. Returns whether it was an error.
fn print_response(response: &Message) -> bool {
    let line = format_response(response);
    if response.is_error() {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
    response.is_error()
}

fn format_response(response: &Message) -> String {
    std::iter::once(response.command.as_str())
        .chain(std::iter::once(response.value.as_str()))
        .chain(response.complement.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn words(line: &str) -> Vec<String> {
        line.split(' ').map(str::to_string).collect()
    }

    #[test]
    fn test_parse_invocation_splits_fields() {
        assert_eq!(
            parse_invocation(&words("brightness set: 40")),
            Message::new("brightness set", "40")
        );
        assert_eq!(
            parse_invocation(&words("notify :  hello   world : extra")),
            Message::new("notify", "hello world").with_complement(["extra"])
        );
    }

    #[test]
    fn test_parse_invocation_without_value() {
        assert_eq!(
            parse_invocation(&words("b  sub")),
            Message::command("b sub")
        );
        assert_eq!(parse_invocation(&[]), Message::default());
    }

    #[test]
    fn test_format_response() {
        let msg = Message::new("help", "brightness set")
            .with_complement(["Set brightness", "brightness percent"]);
        assert_eq!(
            format_response(&msg),
            "help\tbrightness set\tSet brightness\tbrightness percent"
        );
        assert_eq!(format_response(&Message::new("brightness", "40")), "brightness\t40");
    }

    #[test]
    fn test_default_filter_precedence() {
        assert_eq!(default_filter(0, "warn"), "warn");
        assert_eq!(default_filter(1, "warn"), "debug");
        assert_eq!(default_filter(3, "warn"), "trace");
    }

    #[test]
    fn test_cli_parses_send_with_hyphen_values() {
        let cli = Cli::try_parse_from([
            "perch",
            "-s",
            "/tmp/p.sock",
            "send",
            "brightness",
            "set:",
            "-5",
        ])
        .unwrap();
        assert_eq!(cli.socket.as_deref(), Some(Path::new("/tmp/p.sock")));
        match cli.command {
            Commands::Send { follow, words } => {
                assert!(!follow);
                assert_eq!(words, vec!["brightness", "set:", "-5"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_config_flags_conflict() {
        assert!(Cli::try_parse_from(["perch", "config", "--show", "--default"]).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_load_config_explicit_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(load_config(&path, true).await.is_err());
        assert_eq!(load_config(&path, false).await.unwrap(), AppConfig::default());
    }
}
