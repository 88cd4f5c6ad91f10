//! One accepted client connection, as seen by command handlers.
//!
//! Reads happen only in the server's dispatch loop; everything else goes
//! through [`Connection`]: serialized sends (subscription deliveries may race
//! with command responses), the close signal, and cleanup actions that must
//! run when the connection goes away.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use super::message::{Message, sanitize_field};
use crate::BoxFuture;
use crate::pubsub::SubscriberId;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Write side and lifecycle of a client connection.
pub struct Connection {
    id: SubscriberId,
    writer: Mutex<Writer>,
    closed: watch::Sender<bool>,
    cleanups: StdMutex<HashMap<String, Cleanup>>,
}

impl Connection {
    /// Wrap the write half of a stream.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id: SubscriberId::next(),
            writer: Mutex::new(Box::new(writer)),
            closed,
            cleanups: StdMutex::new(HashMap::new()),
        }
    }

    /// Identity used when this connection subscribes to an observable value.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Send one message.
    ///
    /// A message that cannot be framed fails with
    /// [`io::ErrorKind::InvalidInput`] and leaves the connection open. Any
    /// write failure means the peer is gone: the connection is marked closed
    /// and the error is returned. A send still waiting on the writer when the
    /// connection is closed gives up with [`io::ErrorKind::BrokenPipe`].
    pub async fn send(&self, message: &Message) -> io::Result<()> {
        let frame = message.encode()?;

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            () = self.closed() => Err(closed_error()),
            written = write => {
                if let Err(e) = &written {
                    debug!(connection = %self.id, error = %e, "send failed, closing connection");
                    self.close();
                }
                written
            }
        }
    }

    /// Send an `error`-kind response. Delimiter bytes in the text are
    /// replaced. Transport failures are only logged: the peer is gone and
    /// nobody is left to tell.
    pub async fn send_error(&self, text: &str, complement: &[String]) {
        let message = Message::error(sanitize_field(text))
            .with_complement(complement.iter().map(|item| sanitize_field(item)));
        if let Err(e) = self.send(&message).await {
            debug!(connection = %self.id, error = %e, "failed to send error response");
        }
    }

    /// Ask the dispatch loop to terminate. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this cannot fail while we are borrowed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Register an action to run when the connection terminates, replacing
    /// any action previously registered under `key`.
    pub fn on_close<F, Fut>(&self, key: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cleanup: Cleanup = Box::new(move || Box::pin(action()));
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), cleanup);
    }

    /// Drop the close action registered under `key` without running it.
    pub fn cancel_on_close(&self, key: &str) {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Run every pending close action and shut the write half down.
    pub(crate) async fn finish(&self) {
        self.close();

        let cleanups: Vec<(String, Cleanup)> = self
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (key, cleanup) in cleanups {
            debug!(connection = %self.id, key, "running close action");
            cleanup().await;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await
            && e.kind() != io::ErrorKind::NotConnected
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            warn!(connection = %self.id, error = %e, "failed to shut down connection");
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection already closed")
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_send_writes_framed_message() {
        let (client, server) = tokio::io::duplex(256);
        let conn = Connection::new(server);
        let mut client = BufReader::new(client);

        conn.send(&Message::new("brightness", "40")).await.unwrap();
        let received = Message::read_from(&mut client).await.unwrap();
        assert_eq!(received, Some(Message::new("brightness", "40")));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_closes_connection() {
        let (client, server) = tokio::io::duplex(256);
        let conn = Connection::new(server);
        drop(client);

        assert!(conn.send(&Message::new("brightness", "40")).await.is_err());
        assert!(conn.is_closed());
        // Later sends fail fast
        let err = conn.send(&Message::command("x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (client, server) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::new(server));
        let mut client = BufReader::new(client);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                let msg = Message::new("tick", i.to_string()).with_complement(["x".repeat(40)]);
                conn.send(&msg).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let msg = Message::read_from(&mut client).await.unwrap().unwrap();
            assert_eq!(msg.command, "tick");
            assert_eq!(msg.complement, vec!["x".repeat(40)]);
            seen.push(msg.value);
        }
        for task in tasks {
            task.await.unwrap();
        }
        seen.sort();
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn test_unframeable_message_keeps_connection_open() {
        let (client, server) = tokio::io::duplex(256);
        let conn = Connection::new(server);
        let mut client = BufReader::new(client);

        let err = conn.send(&Message::new("brightness", "4\x1e0")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!conn.is_closed());

        conn.send_error("bad\x1dtext", &["brightness\x1eset".to_string()]).await;
        let received = Message::read_from(&mut client).await.unwrap();
        assert_eq!(
            received,
            Some(Message::error("bad text").with_complement(["brightness set"]))
        );
    }

    #[tokio::test]
    async fn test_close_releases_send_blocked_on_full_peer() {
        let (_client, server) = tokio::io::duplex(16);
        let conn = Arc::new(Connection::new(server));

        let blocked = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&Message::new("tick", "x".repeat(64))).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        conn.close();
        let err = tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // The writer is free again, so close actions and shutdown complete
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.finish())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finish_runs_close_actions_once() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Connection::new(server);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        conn.on_close("brightness", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Re-registering under the same key replaces the action
        let counter = Arc::clone(&runs);
        conn.on_close("brightness", move || async move {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        conn.finish().await;
        conn.finish().await;
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_on_close() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Connection::new(server);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        conn.on_close("brightness", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        conn.cancel_on_close("brightness");
        conn.finish().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::new(server));

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
