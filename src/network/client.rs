//! Network Client
//!
//! TCP client for sending messages to peer controllers. Messages are
//! one-way; replies, when a protocol needs them, arrive as ordinary
//! inbound messages on the peer's own connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::protocol::ClusterMessage;
use super::write_message;
use crate::error::{Error, Result};

/// Connection pool entry
struct PoolEntry {
    writer: OwnedWriteHalf,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Send timeout
    send_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            send_timeout,
        }
    }

    /// Send a message to a peer without waiting for a response
    pub async fn send(&self, address: &str, message: &ClusterMessage) -> Result<()> {
        match timeout(self.send_timeout, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: &ClusterMessage) -> Result<()> {
        // Try the pooled connection first
        if let Some(entry) = self.get_connection(address).await {
            let mut entry = entry.lock().await;
            if write_message(&mut entry.writer, message).await.is_ok() {
                return Ok(());
            }
            // Connection is dead, remove and reconnect
            drop(entry);
            self.remove_connection(address).await;
        }

        let stream = self.connect(address).await?;
        let (_reader, mut writer) = stream.into_split();
        write_message(&mut writer, message).await?;
        self.store_connection(address.to_string(), writer).await;
        Ok(())
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, writer: OwnedWriteHalf) {
        let mut pool = self.pool.write().await;
        pool.insert(address, Arc::new(Mutex::new(PoolEntry { writer })));
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}
