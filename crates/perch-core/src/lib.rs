#![deny(unsafe_code)]

//! perch core daemon runtime.
//!
//! Provides the IPC control plane (wire protocol, command registry, server
//! and client), the observable-value engine that streams state changes to
//! subscribed connections, and the daemon that ties collaborators such as
//! the backlight controller to the control socket.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used where handlers and close
/// actions are stored behind `dyn`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Screen backlight collaborator.
pub mod backlight;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Daemon runtime: startup, reload, shutdown.
pub mod daemon;
/// Control socket protocol, server, and client.
pub mod ipc;
/// In-memory log collector behind `daemon logs`.
pub mod logging;
/// Observable values with deduplication and polling.
pub mod pubsub;
/// Configuration reload fan-out.
pub mod reload;

pub use backlight::{Backlight, BacklightError};
pub use daemon::{Daemon, DaemonError, ShutdownSignal};
pub use ipc::{CommandError, CommandRegistry, Connection, IpcClient, IpcClientError, Message};
pub use logging::{LogCollector, LogReader};
pub use pubsub::{Observable, PollConfig, SubscriberId};
pub use reload::{ReloadBroadcast, ReloadListener};
