//! Daemon IPC: the control socket.
//!
//! Clients and the daemon exchange framed [`Message`]s over a Unix domain
//! socket. The daemon resolves each request against a
//! [`CommandRegistry`] and answers with zero or more messages; a
//! subscription keeps pushing messages on the same connection until the
//! client unsubscribes or disconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐        Unix socket         ┌──────────────┐
//! │   CLI    │───────────────────────────▶│  IPC Server  │
//! │  client  │  0x1D / 0x1E framing       │ per-conn loop│
//! └──────────┘                            └──────┬───────┘
//!                                                │ resolve
//!                                         ┌──────▼───────┐
//!                                         │   Commands   │──▶ collaborators
//!                                         └──────────────┘
//! ```

pub mod client;
pub mod commands;
pub mod connection;
pub mod message;
pub mod server;

pub use client::{IpcClient, IpcClientError};
pub use commands::{Command, CommandError, CommandRegistry, Request, ResolveError};
pub use connection::Connection;
pub use message::{Decoder, Message};
pub use server::{Server, handle_connection};
