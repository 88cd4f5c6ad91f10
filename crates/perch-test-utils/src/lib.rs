#![deny(unsafe_code)]

//! Shared test utilities for the perch workspace.
//!
//! Provides config builders, a fake sysfs backlight device, an in-process
//! daemon bound to a temporary socket, and tracing helpers.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! perch-test-utils = { workspace = true }
//! ```

pub mod backlight;
pub mod config;
pub mod daemon;
pub mod tracing_setup;

pub use backlight::FakeBacklight;
pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use tracing_setup::init_test_tracing;
