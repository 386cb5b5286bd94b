//! In-process transport: a connector whose "server" is an [`MemoryAcceptor`]
//! living in the same process.
//!
//! Useful for driving the signaling layer in tests without sockets. Each
//! `connect` creates a connected pair and hands the far end to the
//! acceptor; dropping the acceptor makes further connects fail.

use tokio::sync::{mpsc, Mutex};

use crate::{Connection, ConnectionId, Connector, TransportError};

#[derive(Debug)]
enum MemoryFrame {
    Data(Vec<u8>),
    Close { normal: bool },
}

/// Connector half of an in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

/// Receives the server-side ends of connections made through a
/// [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryConnector {
    /// Creates a connector and the acceptor that receives its connections.
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { accept_tx }, MemoryAcceptor { accept_rx })
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, url: &str) -> Result<Self::Connection, TransportError> {
        let (local, remote) = MemoryConnection::pair();
        self.accept_tx.send(remote).map_err(|_| {
            TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no acceptor listening for {url}"),
            ))
        })?;
        tracing::trace!(id = %local.id, url, "memory connection opened");
        Ok(local)
    }
}

impl MemoryAcceptor {
    /// Waits for the next incoming connection. `None` once every connector
    /// has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accept_rx.recv().await
    }
}

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<MemoryFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<MemoryFrame>>,
}

impl MemoryConnection {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self {
            id: ConnectionId::next(),
            tx: b_tx,
            rx: Mutex::new(a_rx),
        };
        let b = Self {
            id: ConnectionId::next(),
            tx: a_tx,
            rx: Mutex::new(b_rx),
        };
        (a, b)
    }

    /// Closes the connection abnormally, as a dropped network link would.
    /// The remote observes a transient [`TransportError::Closed`].
    pub fn abort(&self) {
        let _ = self.tx.send(MemoryFrame::Close { normal: false });
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(MemoryFrame::Data(data.to_vec()))
            .map_err(|_| TransportError::closed("remote end dropped"))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.lock().await.recv().await {
            Some(MemoryFrame::Data(data)) => Ok(Some(data)),
            Some(MemoryFrame::Close { normal: true }) => Ok(None),
            Some(MemoryFrame::Close { normal: false }) => {
                Err(TransportError::closed("aborted by remote"))
            }
            None => Err(TransportError::closed("remote end dropped")),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        // The remote may already be gone; closing is still a success.
        let _ = self.tx.send(MemoryFrame::Close { normal: true });
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_send_recv_both_directions() {
        let (a, b) = MemoryConnection::pair();
        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        b.send(b"pong").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_is_normal_and_abort_is_abnormal() {
        let (a, b) = MemoryConnection::pair();
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);

        let (c, d) = MemoryConnection::pair();
        c.abort();
        assert!(matches!(d.recv().await, Err(TransportError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_dropped_remote_is_abnormal() {
        let (a, b) = MemoryConnection::pair();
        drop(a);
        assert!(b.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_without_acceptor_fails() {
        let (connector, acceptor) = MemoryConnector::new();
        drop(acceptor);
        let result = connector.connect("mem://nowhere").await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_delivers_remote_end_to_acceptor() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let client = connector.connect("mem://server").await.unwrap();
        let server = acceptor.accept().await.expect("should accept");
        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(b"hello".to_vec()));
    }
}
