//! IPC client: connects to the daemon's control socket.
//!
//! Used by the CLI and by integration tests. A connection can either be
//! kept open (subscriptions) or used for a single request through
//! [`IpcClient::oneshot`].

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::message::Message;
use super::server::CLOSE_COMMAND;

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("daemon is not running (no socket at {0})")]
    NotRunning(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("daemon closed the connection")]
    Closed,
}

/// An open connection to the daemon.
#[derive(Debug)]
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connect to the daemon listening on `socket_path`.
    pub async fn connect(socket_path: &Path) -> Result<Self, IpcClientError> {
        if !socket_path.exists() {
            return Err(IpcClientError::NotRunning(socket_path.to_path_buf()));
        }

        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                IpcClientError::NotRunning(socket_path.to_path_buf())
            } else {
                IpcClientError::Connect {
                    path: socket_path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        debug!(path = %socket_path.display(), "connected to daemon");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one request.
    pub async fn send(&mut self, message: &Message) -> Result<(), IpcClientError> {
        message.write_to(&mut self.writer).await?;
        Ok(())
    }

    /// Receive the next message, or `None` once the daemon closed the
    /// connection.
    pub async fn recv(&mut self) -> Result<Option<Message>, IpcClientError> {
        Ok(Message::read_from(&mut self.reader).await?)
    }

    /// Send `message` and wait for the first response.
    pub async fn request(&mut self, message: &Message) -> Result<Message, IpcClientError> {
        self.send(message).await?;
        self.recv().await?.ok_or(IpcClientError::Closed)
    }

    /// Ask the daemon to close this connection.
    pub async fn close(mut self) -> Result<(), IpcClientError> {
        self.send(&Message::command(CLOSE_COMMAND)).await
    }

    /// Connect, send `message` followed by `close`, and collect every
    /// response until the daemon hangs up.
    pub async fn oneshot(
        socket_path: &Path,
        message: &Message,
    ) -> Result<Vec<Message>, IpcClientError> {
        let mut client = Self::connect(socket_path).await?;
        client.send(message).await?;
        client.send(&Message::command(CLOSE_COMMAND)).await?;

        let mut responses = Vec::new();
        while let Some(response) = client.recv().await? {
            responses.push(response);
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_missing_socket_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.sock");
        let err = IpcClient::connect(&path).await.unwrap_err();
        assert!(matches!(err, IpcClientError::NotRunning(p) if p == path));
    }

    #[tokio::test]
    async fn test_connect_stale_socket_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.sock");
        // Bound then dropped: the file stays but nobody listens
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let err = IpcClient::connect(&path).await.unwrap_err();
        assert!(matches!(err, IpcClientError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_oneshot_collects_until_hangup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let request = Message::read_from(&mut reader).await.unwrap().unwrap();
            let close = Message::read_from(&mut reader).await.unwrap().unwrap();
            Message::new("echo", request.value).write_to(&mut write_half).await.unwrap();
            Message::new("echo", "again").write_to(&mut write_half).await.unwrap();
            close
        });

        let responses = IpcClient::oneshot(&path, &Message::new("echo", "hi")).await.unwrap();
        assert_eq!(responses, vec![Message::new("echo", "hi"), Message::new("echo", "again")]);
        assert_eq!(server.await.unwrap(), Message::command("close"));
    }
}
