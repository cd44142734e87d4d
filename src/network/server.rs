//! Network Server
//!
//! TCP server accepting connections from peer controllers and feeding every
//! received message into the inbound queue.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::protocol::ClusterMessage;
use super::read_message;
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Channel for incoming messages
    incoming_tx: mpsc::Sender<ClusterMessage>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, incoming_tx: mpsc::Sender<ClusterMessage>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            incoming_tx,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener; call [`NetworkServer::serve`] to accept connections
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        Ok(listener)
    }

    /// Bind and accept connections until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), incoming_tx, conn_shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    incoming_tx: mpsc::Sender<ClusterMessage>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, _writer) = socket.into_split();

    loop {
        let result = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown_rx.changed() => break,
        };

        match result {
            Ok(message) => {
                tracing::trace!("Received {} from {} ({})", message.subject, message.sender, peer_addr);

                // Bounded queue: a saturated worker pool throttles the reader here
                if incoming_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}
