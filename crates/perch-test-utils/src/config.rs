//! Configuration builders for tests.

use perch_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_path("/tmp/perch-test.sock")
///     .step_percent(10.0)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn socket_path(mut self, path: &str) -> Self {
        self.config.daemon.socket_path = Some(path.to_string());
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn backlight_enabled(mut self, enabled: bool) -> Self {
        self.config.backlight.enabled = enabled;
        self
    }

    pub fn sysfs_root(mut self, root: &str) -> Self {
        self.config.backlight.sysfs_root = root.to_string();
        self
    }

    pub fn device_name(mut self, name: &str) -> Self {
        self.config.backlight.device_name = name.to_string();
        self
    }

    pub fn minimum_percent(mut self, percent: f64) -> Self {
        self.config.backlight.minimum_percent = percent;
        self
    }

    pub fn step_percent(mut self, percent: f64) -> Self {
        self.config.backlight.step_percent = percent;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.backlight.poll_interval_ms = ms;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
