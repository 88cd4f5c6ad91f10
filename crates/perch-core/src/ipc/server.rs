//! IPC server: accept loop over a Unix domain socket and the
//! per-connection dispatch loop.
//!
//! Each connection is served by its own task. Requests on one connection
//! are handled one at a time, in arrival order; subscription deliveries
//! are written concurrently through the [`Connection`] handle.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::commands::{CommandRegistry, Request};
use super::connection::Connection;
use super::message::Message;
use crate::daemon::ShutdownSignal;

/// Built-in that lists every command name.
pub const LIST_COMMAND: &str = "";

/// Built-in that terminates the connection.
pub const CLOSE_COMMAND: &str = "close";

const HELP_ALIASES: [&str; 3] = ["help", "h", "?"];
const HELP_DESCRIPTION: &str = "Show this help message";
const HELP_ARGUMENT: &str = "command name (optional)";
const CLOSE_DESCRIPTION: &str = "Require the server to close the socket";

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bound control socket, ready to serve.
#[derive(Debug)]
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    commands: Arc<CommandRegistry>,
}

impl Server {
    /// Bind `socket_path`.
    ///
    /// A stale socket file left by a dead daemon is removed first. If a
    /// live daemon still answers on it, binding fails with
    /// [`io::ErrorKind::AddrInUse`].
    pub fn bind(socket_path: &Path, commands: Arc<CommandRegistry>) -> io::Result<Self> {
        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another daemon is listening on {}", socket_path.display()),
                ));
            }
            debug!(path = %socket_path.display(), "removing stale socket file");
            std::fs::remove_file(socket_path)?;
        }

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), commands = commands.len(), "IPC server listening");

        Ok(Self {
            listener,
            path: socket_path.to_path_buf(),
            commands,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until a shutdown signal arrives, then close every
    /// open connection, wait for their cleanup, and remove the socket file.
    pub async fn serve(
        self,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) -> io::Result<()> {
        let (closing_tx, closing_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&self.commands),
                            closing_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished
                        && e.is_panic()
                    {
                        warn!(error = %e, "connection task panicked");
                    }
                }
            }
        }

        info!(open = connections.len(), "IPC server shutting down");
        drop(self.listener);
        closing_tx.send_replace(true);
        while connections.join_next().await.is_some() {}

        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
        }
        Ok(())
    }
}

/// Serve one client until it disconnects, sends `close`, breaks the
/// protocol, or `closing` turns true.
///
/// A command in progress is abandoned when the connection closes or
/// `closing` turns true, so a peer that stops reading cannot hold the
/// connection open. Close actions run in every case.
pub async fn handle_connection<S>(
    stream: S,
    commands: Arc<CommandRegistry>,
    mut closing: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let conn = Arc::new(Connection::new(write_half));
    let mut reader = BufReader::new(read_half);
    debug!(connection = %conn.id(), "client connected");

    loop {
        let message = tokio::select! {
            biased;
            _ = conn.closed() => break,
            _ = closing.wait_for(|closing| *closing) => break,
            read = Message::read_from(&mut reader) => match read {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(connection = %conn.id(), "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(
                        connection = %conn.id(),
                        error = %e,
                        "protocol error, closing connection"
                    );
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = conn.closed() => break,
            _ = closing.wait_for(|closing| *closing) => {
                debug!(connection = %conn.id(), "server closing, abandoning command");
                break;
            }
            () = dispatch(&commands, &conn, message) => {}
        }
    }

    conn.finish().await;
    debug!(connection = %conn.id(), "connection finished");
}

async fn dispatch(commands: &CommandRegistry, conn: &Arc<Connection>, message: Message) {
    let Message {
        command: name,
        value,
        complement,
    } = message;
    trace!(connection = %conn.id(), command = %name, "request received");

    if name == LIST_COMMAND {
        send(conn, command_list(commands)).await;
        return;
    }
    if name == CLOSE_COMMAND {
        debug!(connection = %conn.id(), "close requested");
        conn.close();
        return;
    }
    if HELP_ALIASES.contains(&name.as_str()) {
        send_help(commands, conn, value.trim()).await;
        return;
    }

    let (full_name, command) = match commands.resolve(&name) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!(connection = %conn.id(), command = %name, error = %e, "unresolved command");
            conn.send_error(&e.to_string(), &[name]).await;
            return;
        }
    };

    if let Err(e) = command.call(Arc::clone(conn), Request { value, complement }).await {
        if e.is_transport() {
            debug!(
                connection = %conn.id(),
                command = full_name,
                error = %e,
                "peer gone during command"
            );
            conn.close();
        } else {
            warn!(connection = %conn.id(), command = full_name, error = %e, "command failed");
            conn.send_error(&e.to_string(), &[full_name.to_string()]).await;
        }
    }
}

async fn send(conn: &Connection, message: Message) {
    if let Err(e) = conn.send(&message).await {
        debug!(connection = %conn.id(), error = %e, "failed to send response");
    }
}

fn command_list(commands: &CommandRegistry) -> Message {
    let mut names: Vec<&str> = commands.names().collect();
    names.extend(["help", CLOSE_COMMAND]);
    names.sort_unstable();
    names.dedup();
    Message::command("commands").with_complement(names)
}

fn builtin_help(name: &str) -> Option<Message> {
    match name {
        "help" => Some(
            Message::new("help", "help").with_complement([HELP_DESCRIPTION, HELP_ARGUMENT]),
        ),
        CLOSE_COMMAND => Some(
            Message::new("help", CLOSE_COMMAND).with_complement([CLOSE_DESCRIPTION]),
        ),
        _ => None,
    }
}

async fn send_help(commands: &CommandRegistry, conn: &Connection, name: &str) {
    if name.is_empty() {
        let builtins = ["help", CLOSE_COMMAND].into_iter().filter_map(builtin_help);
        let registered = commands.iter().map(|(name, command)| command.help_message(name));
        for message in builtins.chain(registered) {
            if conn.send(&message).await.is_err() {
                return;
            }
        }
        return;
    }

    if let Some(message) = builtin_help(name) {
        send(conn, message).await;
        return;
    }
    match commands.resolve(name) {
        Ok((full_name, command)) => send(conn, command.help_message(full_name)).await,
        Err(e) => conn.send_error(&e.to_string(), &[name.to_string()]).await,
    }
}
