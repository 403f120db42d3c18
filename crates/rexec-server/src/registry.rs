//! Registry of authenticated client sessions.
//!
//! Each entry maps a connection ID to the peer's address and a shared
//! [`SessionLink`] that lets administrative callers push the `exit` token and
//! close the connection. The map lock is never held across socket I/O.

use chrono::{DateTime, Local};
use rexec_core::protocol::EXIT_TOKEN;
use rexec_core::{RexecError, RexecResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Opaque identity of a live connection.
pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound on each write or shutdown during a forced disconnect, so a
/// peer that stopped reading cannot hold it up.
const DISCONNECT_WRITE_GRACE: Duration = Duration::from_millis(250);

/// Write side of a session, shared between its handler and the registry.
pub struct SessionLink {
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl SessionLink {
    /// Wrap a writer. The returned receiver flips to `true` once the link is
    /// closed, which is how a handler blocked on a read learns about it.
    pub fn new<W>(writer: W) -> (Arc<Self>, watch::Receiver<bool>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, closed_rx) = watch::channel(false);
        let link = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            closed,
        });
        (link, closed_rx)
    }

    /// Write the whole buffer to the peer. Gives up, releasing the writer,
    /// as soon as the link is closed.
    pub async fn send(&self, data: &[u8]) -> RexecResult<()> {
        let mut closed = self.closed.subscribe();
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(RexecError::Transport("connection closed".into()));
        }
        tokio::select! {
            sent = write_flush(&mut writer, data) => sent,
            _ = closed.wait_for(|closed| *closed) => {
                Err(RexecError::Transport("connection closed".into()))
            }
        }
    }

    /// Shut down the write side and wake the handler. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        shutdown_writer(&mut writer).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send the literal `exit` token, then close. Does nothing if the link
    /// is already closed, so a peer sees at most one `exit`.
    ///
    /// The link is marked closed before the writer is taken, which makes a
    /// send stuck on a peer that stopped reading let go of it.
    pub async fn force_disconnect(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(
            DISCONNECT_WRITE_GRACE,
            write_flush(&mut writer, EXIT_TOKEN.as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "could not deliver exit token"),
            Err(_) => warn!("peer did not drain before disconnect, dropping it"),
        }
        shutdown_writer(&mut writer).await;
    }
}

async fn write_flush(writer: &mut BoxedWriter, data: &[u8]) -> RexecResult<()> {
    writer
        .write_all(data)
        .await
        .map_err(|e| RexecError::Transport(format!("send failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RexecError::Transport(format!("flush failed: {e}")))
}

async fn shutdown_writer(writer: &mut BoxedWriter) {
    match tokio::time::timeout(DISCONNECT_WRITE_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "shutdown on closed connection"),
        Err(_) => debug!("shutdown timed out"),
    }
}

struct ClientEntry {
    address: SocketAddr,
    connected_at: DateTime<Local>,
    link: Arc<SessionLink>,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub address: SocketAddr,
    pub connected_at: DateTime<Local>,
}

/// Shared table of authenticated sessions.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, ClientEntry>>,
    next_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection ID.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an authenticated session.
    pub async fn register(&self, id: ConnectionId, address: SocketAddr, link: Arc<SessionLink>) {
        let entry = ClientEntry {
            address,
            connected_at: Local::now(),
            link,
        };
        self.clients.lock().await.insert(id, entry);
        debug!(id, remote = %address, "session registered");
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.clients.lock().await.remove(&id).is_some();
        if removed {
            debug!(id, "session unregistered");
        }
        removed
    }

    /// All registered sessions, ordered by connection ID.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let clients = self.clients.lock().await;
        let mut sessions: Vec<SessionInfo> = clients
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                address: entry.address,
                connected_at: entry.connected_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Address of a registered session.
    pub async fn address_of(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.clients.lock().await.get(&id).map(|e| e.address)
    }

    /// Send `exit` to one session and close it. Missing IDs are a no-op.
    ///
    /// The entry is removed by the session's own handler once it notices the
    /// closed link.
    pub async fn force_disconnect(&self, id: ConnectionId) -> bool {
        let link = {
            let clients = self.clients.lock().await;
            clients.get(&id).map(|e| e.link.clone())
        };
        match link {
            Some(link) => {
                link.force_disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Empty the table and force-disconnect every session that was in it.
    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<Arc<SessionLink>> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, e)| e.link).collect()
        };
        let count = drained.len();
        let tasks: Vec<_> = drained
            .into_iter()
            .map(|link| tokio::spawn(async move { link.force_disconnect().await }))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "disconnect task failed");
            }
        }
        count
    }

    pub async fn count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn register_list_unregister() {
        let registry = ClientRegistry::new();
        let (a, _peer_a) = tokio::io::duplex(64);
        let (b, _peer_b) = tokio::io::duplex(64);
        let (link_a, _) = SessionLink::new(a);
        let (link_b, _) = SessionLink::new(b);

        let id_a = registry.next_id();
        let id_b = registry.next_id();
        assert_ne!(id_a, id_b);

        registry.register(id_a, addr(5000), link_a).await;
        registry.register(id_b, addr(5001), link_b).await;

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, id_a);
        assert_eq!(listed[1].address, addr(5001));

        assert!(registry.unregister(id_a).await);
        assert!(!registry.unregister(id_a).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn force_disconnect_sends_exit_then_closes() {
        let registry = ClientRegistry::new();
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let (link, mut closed_rx) = SessionLink::new(server_side);
        let id = registry.next_id();
        registry.register(id, addr(6000), link.clone()).await;

        assert!(registry.force_disconnect(id).await);

        let mut received = String::new();
        client_side.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "exit");
        assert!(*closed_rx.borrow_and_update());
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn force_disconnect_unknown_id_is_noop() {
        let registry = ClientRegistry::new();
        assert!(!registry.force_disconnect(42).await);
    }

    #[tokio::test]
    async fn disconnect_all_drains_table() {
        let registry = ClientRegistry::new();
        let mut peers = Vec::new();
        for port in 7000..7003 {
            let (server_side, client_side) = tokio::io::duplex(64);
            let (link, _) = SessionLink::new(server_side);
            registry.register(registry.next_id(), addr(port), link).await;
            peers.push(client_side);
        }

        assert_eq!(registry.disconnect_all().await, 3);
        assert_eq!(registry.count().await, 0);
        for mut peer in peers {
            let mut received = String::new();
            peer.read_to_string(&mut received).await.unwrap();
            assert_eq!(received, "exit");
        }
    }

    #[tokio::test]
    async fn force_disconnect_unblocks_stalled_send() {
        let (server_side, mut client_side) = tokio::io::duplex(16);
        let (link, _) = SessionLink::new(server_side);

        let sender = link.clone();
        let send = tokio::spawn(async move { sender.send(&[b'y'; 4096]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished());

        tokio::time::timeout(Duration::from_secs(2), link.force_disconnect())
            .await
            .unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(2), send)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, Err(RexecError::Transport(_))));
        assert!(link.is_closed());

        // The peer only ever gets what fit in the pipe before the close.
        let mut received = Vec::new();
        client_side.read_to_end(&mut received).await.unwrap();
        assert!(received.len() <= 16 + EXIT_TOKEN.len());
    }

    #[tokio::test]
    async fn disconnect_all_does_not_wait_on_each_stalled_peer() {
        let registry = Arc::new(ClientRegistry::new());
        let mut peers = Vec::new();
        let mut sends = Vec::new();
        for port in 7100..7105 {
            let (server_side, client_side) = tokio::io::duplex(16);
            let (link, _) = SessionLink::new(server_side);
            registry.register(registry.next_id(), addr(port), link.clone()).await;
            sends.push(tokio::spawn(async move { link.send(&[b'z'; 4096]).await }));
            peers.push(client_side);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(registry.disconnect_all().await, 5);
        assert!(started.elapsed() < Duration::from_secs(1));
        for send in sends {
            assert!(send.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (server_side, _client_side) = tokio::io::duplex(64);
        let (link, _) = SessionLink::new(server_side);
        link.close().await;
        link.close().await;
        assert!(matches!(link.send(b"late").await, Err(RexecError::Transport(_))));
    }
}
