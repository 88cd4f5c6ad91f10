//! Daemon process: startup, configuration reload, and shutdown.
//!
//! [`Daemon::run`] binds the control socket, wires collaborators into the
//! command registry, and then waits for a stop request. SIGHUP (or the
//! `configuration reload` command) re-reads the configuration file and
//! announces the new sections to their owners.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use perch_config::{AppConfig, BacklightConfig, ConfigError};

use crate::backlight::Backlight;
use crate::build_info;
use crate::ipc::{CommandError, CommandRegistry, Connection, Message, Server};
use crate::logging::LogReader;
use crate::reload::ReloadBroadcast;

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind { path: PathBuf, source: std::io::Error },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The perch daemon. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Daemon {
    config: Arc<watch::Sender<AppConfig>>,
    config_path: Option<PathBuf>,
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    backlight_reload: ReloadBroadcast<BacklightConfig>,
    logs: Option<LogReader>,
}

impl Daemon {
    /// Create a daemon serving on the socket path resolved from `config`.
    pub fn new(config: AppConfig) -> Self {
        let socket_path = perch_config::paths::socket_path(&config);
        let (config, _) = watch::channel(config);
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config: Arc::new(config),
            config_path: None,
            socket_path,
            shutdown_tx,
            backlight_reload: ReloadBroadcast::new(),
            logs: None,
        }
    }

    /// File re-read on reload. Without one, a reload re-announces the
    /// current configuration.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Override the socket path from the configuration.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Serve captured log entries through `daemon logs`.
    pub fn with_log_reader(mut self, logs: LogReader) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn config(&self) -> AppConfig {
        self.config.borrow().clone()
    }

    /// Receiver notified on every successful reload.
    pub fn config_watch(&self) -> watch::Receiver<AppConfig> {
        self.config.subscribe()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Re-read the configuration and announce it to collaborators. On
    /// failure the current configuration stays in effect.
    pub async fn reload(&self) -> Result<AppConfig, ConfigError> {
        let config = match &self.config_path {
            Some(path) => AppConfig::load_or_default(path).await?,
            None => self.config(),
        };

        let previous = self.config.send_replace(config.clone());
        if previous.daemon.socket_path != config.daemon.socket_path {
            warn!("socket path changes take effect after a restart");
        }

        self.backlight_reload.announce(config.backlight.clone()).await;
        info!("configuration reloaded");
        Ok(config)
    }

    /// Run until `daemon stop`, Ctrl-C, or SIGTERM.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(version = %build_info::version_string(), "perch daemon starting");

        let backlight = Backlight::new(&self.config().backlight);
        let backlight_listener = backlight.listen_reload(&self.backlight_reload);

        let mut commands = self.commands();
        commands.merge(backlight.commands());

        let server =
            Server::bind(&self.socket_path, Arc::new(commands)).map_err(|source| {
                DaemonError::Bind {
                    path: self.socket_path.clone(),
                    source,
                }
            })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let server_task = tokio::spawn(server.serve(self.shutdown_tx.subscribe()));

        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping daemon");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Ctrl-C received, initiating graceful shutdown");
                    self.shutdown();
                    break;
                }
                _ = terminate.recv() => {
                    warn!("SIGTERM received, initiating graceful shutdown");
                    self.shutdown();
                    break;
                }
                _ = hangup.recv() => {
                    debug!("SIGHUP received");
                    if let Err(e) = self.reload().await {
                        warn!(
                            error = %e,
                            "configuration reload failed, keeping current configuration"
                        );
                    }
                }
            }
        }

        match server_task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "IPC server task failed"),
        }
        backlight_listener.stop().await;

        info!("Daemon stopped");
        Ok(())
    }

    /// The `daemon …` and `configuration …` commands.
    pub fn commands(&self) -> CommandRegistry {
        CommandRegistry::new()
            .command("daemon version", "Show the daemon version", &[], |conn, _request| async move {
                reply(&conn, Message::new("version", build_info::version_string())).await
            })
            .command("daemon logs", "Show recent daemon log entries", &[], {
                let logs = self.logs.clone();
                move |conn, _request| {
                    let logs = logs.clone();
                    async move {
                        let logs = logs.ok_or_else(|| {
                            CommandError::Failed("log capture is not enabled".into())
                        })?;
                        for entry in logs.entries() {
                            conn.send(&entry.to_message()).await?;
                        }
                        Ok(())
                    }
                }
            })
            .command("daemon stop", "Stop the daemon", &[], {
                let daemon = self.clone();
                move |conn, _request| {
                    let daemon = daemon.clone();
                    async move {
                        info!("Stop requested via IPC");
                        let sent = reply(&conn, Message::new("daemon", "stopping")).await;
                        daemon.shutdown();
                        sent
                    }
                }
            })
            .command("configuration", "Show the current configuration", &[], {
                let daemon = self.clone();
                move |conn, _request| {
                    let config = daemon.config();
                    async move {
                        let dump = config.to_toml()?;
                        reply(&conn, Message::new("configuration", dump)).await
                    }
                }
            })
            .command(
                "configuration default",
                "Show the default configuration",
                &[],
                |conn, _request| async move {
                    let config = AppConfig::default();
                    reply(&conn, Message::new("configuration", config.to_toml()?)).await
                },
            )
            .command("configuration reload", "Reload the configuration file", &[], {
                let daemon = self.clone();
                move |conn, _request| {
                    let daemon = daemon.clone();
                    async move {
                        daemon.reload().await?;
                        reply(&conn, Message::new("configuration", "reloaded")).await
                    }
                }
            })
    }
}

async fn reply(conn: &Connection, message: Message) -> Result<(), CommandError> {
    conn.send(&message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_socket_path_from_config() {
        let mut config = AppConfig::default();
        config.daemon.socket_path = Some("/tmp/perch-test/perch.sock".into());
        let daemon = Daemon::new(config);
        assert_eq!(daemon.socket_path(), Path::new("/tmp/perch-test/perch.sock"));

        let daemon = daemon.with_socket_path("/tmp/other.sock");
        assert_eq!(daemon.socket_path(), Path::new("/tmp/other.sock"));
    }

    #[tokio::test]
    async fn test_shutdown_without_run_does_not_panic() {
        let daemon = Daemon::new(AppConfig::default());
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_reload_reads_file_and_announces_backlight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.toml");
        std::fs::write(&path, "[backlight]\nstep_percent = 10.0\n").unwrap();

        let daemon = Daemon::new(AppConfig::default()).with_config_path(&path);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _listener = daemon.backlight_reload.listen(move |config: BacklightConfig| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(config.step_percent);
            }
        });

        let mut watch = daemon.config_watch();
        let config = daemon.reload().await.unwrap();
        assert_eq!(config.backlight.step_percent, 10.0);
        assert!(watch.has_changed().unwrap());
        assert_eq!(daemon.config().backlight.step_percent, 10.0);
        assert_eq!(rx.recv().await, Some(10.0));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.toml");
        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();

        let daemon = Daemon::new(AppConfig::default()).with_config_path(&path);
        assert!(daemon.reload().await.is_err());
        assert_eq!(daemon.config(), AppConfig::default());
    }

    #[test]
    fn test_command_names() {
        let daemon = Daemon::new(AppConfig::default());
        let commands = daemon.commands();
        let names: Vec<&str> = commands.names().collect();
        assert_eq!(
            names,
            vec![
                "configuration",
                "configuration default",
                "configuration reload",
                "daemon logs",
                "daemon stop",
                "daemon version",
            ]
        );
    }
}
