//! In-process daemon fixture.
//!
//! [`TestDaemon`] runs a real [`Daemon`] on a socket inside a temporary
//! directory, with a [`FakeBacklight`] as its device and a config file that
//! tests can rewrite before asking for a reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use perch_config::AppConfig;
use perch_core::{Daemon, DaemonError, IpcClient, LogReader, Message};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::backlight::FakeBacklight;
use crate::config::TestConfigBuilder;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon scoped to a test.
///
/// The temp directory (socket and config file) is deleted when this value
/// is dropped; a daemon still running at that point is aborted.
pub struct TestDaemon {
    pub daemon: Daemon,
    pub backlight: FakeBacklight,
    pub config_path: PathBuf,
    task: Option<JoinHandle<Result<(), DaemonError>>>,
    _temp_dir: TempDir,
}

impl TestDaemon {
    /// Start with default settings: a 960-level device at 50 %, polled
    /// every 20 ms.
    pub async fn start() -> Self {
        Self::start_with(TestConfigBuilder::new().poll_interval_ms(20).build(), None).await
    }

    /// Start with `config`. Its socket path and sysfs root are replaced by
    /// the fixture's own.
    pub async fn start_with(mut config: AppConfig, logs: Option<LogReader>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let backlight = FakeBacklight::new("intel_backlight", 960, 480);

        config.daemon.socket_path = Some(temp_dir.path().join("perch.sock").display().to_string());
        config.backlight.sysfs_root = backlight.root().display().to_string();

        let config_path = temp_dir.path().join("perch.toml");
        write_config_file(&config_path, &config).await;

        let mut daemon = Daemon::new(config).with_config_path(config_path.clone());
        if let Some(logs) = logs {
            daemon = daemon.with_log_reader(logs);
        }

        let task = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };

        let fixture = Self {
            daemon,
            backlight,
            config_path,
            task: Some(task),
            _temp_dir: temp_dir,
        };
        fixture.wait_until_listening().await;
        fixture
    }

    async fn wait_until_listening(&self) {
        tokio::time::timeout(STARTUP_TIMEOUT, async {
            while IpcClient::connect(self.socket_path()).await.is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("daemon did not start listening");
    }

    pub fn socket_path(&self) -> &Path {
        self.daemon.socket_path()
    }

    /// Open a new client connection.
    pub async fn client(&self) -> IpcClient {
        IpcClient::connect(self.socket_path())
            .await
            .expect("failed to connect to test daemon")
    }

    /// Send one request and collect every response.
    pub async fn oneshot(&self, message: Message) -> Vec<Message> {
        IpcClient::oneshot(self.socket_path(), &message)
            .await
            .expect("oneshot request failed")
    }

    /// Overwrite the config file (for reload tests). The socket path and
    /// sysfs root are kept.
    pub async fn write_config(&self, mut config: AppConfig) {
        let current = self.daemon.config();
        config.daemon.socket_path = current.daemon.socket_path;
        config.backlight.sysfs_root = current.backlight.sysfs_root;
        write_config_file(&self.config_path, &config).await;
    }

    /// Overwrite the config file with raw content.
    pub async fn write_config_raw(&self, content: &str) {
        tokio::fs::write(&self.config_path, content)
            .await
            .expect("failed to write config");
    }

    /// Request shutdown and wait for the daemon to finish.
    pub async fn stop(mut self) -> Result<(), DaemonError> {
        self.daemon.shutdown();
        let task = self.task.take().expect("daemon already stopped");
        tokio::time::timeout(STARTUP_TIMEOUT, task)
            .await
            .expect("daemon did not stop")
            .expect("daemon task panicked")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn write_config_file(path: &Path, config: &AppConfig) {
    let content = config.to_toml().expect("failed to render config");
    tokio::fs::write(path, content)
        .await
        .expect("failed to write config");
}
