//! Network Module
//!
//! Handles communication between controller nodes: framed TCP transport,
//! the [`ClusterCommunicator`] contract used by the stores, an in-process
//! hub for simulation and tests, and the subject dispatcher.

mod client;
pub mod communicator;
pub mod dispatch;
pub mod local;
pub mod protocol;
mod server;

pub use client::NetworkClient;
pub use communicator::{ClusterCommunicator, TcpCommunicator};
pub use dispatch::{MessageDispatcher, MessageHandler};
pub use local::{Envelope, LocalCommunicator, LocalHub};
pub use protocol::{subjects, ClusterMessage, FrameHeader};
pub use server::NetworkServer;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<ClusterMessage> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = ClusterMessage::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ClusterMessage,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeId;

    #[tokio::test]
    async fn test_framing_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = ClusterMessage::new(NodeId::from("node-1"), subjects::LINK_REMOVED, &42u64).unwrap();

        write_message(&mut a, &msg).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received.subject, subjects::LINK_REMOVED);
        assert_eq!(received.decode::<u64>().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = ClusterMessage::new(NodeId::from("node-1"), subjects::LINK_UPDATE, &1u8).unwrap();
        let body = msg.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
