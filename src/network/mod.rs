//! Network Module
//!
//! Handles TCP communication between middleware nodes.

mod server;
mod client;
pub mod protocol;

pub use server::{MessageHandler, NetworkServer};
pub use client::NetworkClient;
pub use protocol::{FrameHeader, Message};

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
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
    use crate::distributed::Member;

    #[tokio::test]
    async fn test_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::Heartbeat {
            member: Member::new("node-1", "localhost:7654"),
        };

        write_message(&mut a, &msg).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            Message::Heartbeat { member } => assert_eq!(member.id, "node-1"),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::LeaveAck.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
