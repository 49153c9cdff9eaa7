//! Handshake channel
//!
//! A short-lived loopback TCP listener. The spawned test process connects to
//! it (or writes to it) once its own inspector endpoint is listening, which is
//! the cue to attach. The payload is never interpreted.

use crate::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Events observed on the handshake channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Listening,
    Connected(SocketAddr),
    Received(String),
    SocketClosed(SocketAddr),
    Error(String),
    Closed,
}

impl SignalEvent {
    /// Whether the peer has told us it is ready.
    pub fn is_ready_signal(&self) -> bool {
        matches!(self, SignalEvent::Connected(_) | SignalEvent::Received(_))
    }
}

/// Listening side of the handshake
pub struct SignalChannel {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl SignalChannel {
    /// Bind `127.0.0.1:port` (`0` picks a free port).
    ///
    /// Returns once the socket is listening; a bind failure is returned here.
    pub async fn open(port: u16) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>)> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Signal(format!("Failed to bind 127.0.0.1:{}: {}", port, e)))?;
        let addr = listener.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let _ = tx.send(SignalEvent::Listening);
        debug!("Handshake channel listening on {}", addr);

        tokio::spawn(accept_loop(listener, tx, shutdown.clone()));

        Ok((Self { addr, shutdown }, rx))
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Address handed to the test process
    pub fn url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.addr.port())
    }

    /// Release the listening socket. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing handshake channel on {}", self.addr);
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<SignalEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Handshake peer connected: {}", peer);
                    let _ = tx.send(SignalEvent::Connected(peer));
                    tokio::spawn(read_socket(socket, peer, tx.clone(), shutdown.child_token()));
                }
                Err(e) => {
                    warn!("Handshake accept failed: {}", e);
                    let _ = tx.send(SignalEvent::Error(e.to_string()));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    drop(listener);
    let _ = tx.send(SignalEvent::Closed);
}

async fn read_socket(
    mut socket: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<SignalEvent>,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0u8; 1024];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = socket.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buffer[..n]).into_owned();
                    trace!("Handshake data from {}: {:?}", peer, text);
                    let _ = tx.send(SignalEvent::Received(text));
                }
                Err(e) => {
                    let _ = tx.send(SignalEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }

    let _ = tx.send(SignalEvent::SocketClosed(peer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for signal event")
            .expect("signal channel dropped")
    }

    #[tokio::test]
    async fn test_connect_and_data_are_ready_signals() {
        let (signal, mut rx) = SignalChannel::open(0).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalEvent::Listening);
        assert!(signal.url().starts_with("tcp://127.0.0.1:"));

        let mut peer = TcpStream::connect(("127.0.0.1", signal.port())).await.unwrap();
        let event = next_event(&mut rx).await;
        assert!(matches!(event, SignalEvent::Connected(_)));
        assert!(event.is_ready_signal());

        peer.write_all(b"ready").await.unwrap();
        peer.flush().await.unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event, SignalEvent::Received("ready".to_string()));
        assert!(event.is_ready_signal());

        drop(peer);
        assert!(matches!(next_event(&mut rx).await, SignalEvent::SocketClosed(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_port() {
        let (signal, mut rx) = SignalChannel::open(0).await.unwrap();
        let port = signal.port();
        assert_eq!(next_event(&mut rx).await, SignalEvent::Listening);

        signal.close();
        signal.close();
        assert!(signal.is_closed());
        assert_eq!(next_event(&mut rx).await, SignalEvent::Closed);

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        drop(signal);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = SignalChannel::open(port).await;
        assert!(matches!(result, Err(Error::Signal(_))));
    }
}
