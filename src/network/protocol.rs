//! Dispatch Protocol
//!
//! Defines the wire protocol between middleware nodes.

use serde::{Deserialize, Serialize};

use crate::distributed::{Command, CommandOutcome, Member};

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Membership ==========
    /// Join request from a starting node
    Join {
        member: Member,
    },

    /// Join response carrying the responder's peers and state
    JoinAck {
        member: Member,
        members: Vec<Member>,
        state: Vec<u8>,
    },

    /// Leave notification from a stopping node
    Leave {
        member: Member,
    },

    /// Leave acknowledgement
    LeaveAck,

    // ========== Health ==========
    Heartbeat {
        member: Member,
    },

    HeartbeatAck {
        member: Member,
    },

    // ========== Commands ==========
    /// Run a state command on the receiver
    Execute {
        from: Member,
        command: Command,
    },

    /// Outcome of an `Execute`
    ExecuteResult {
        outcome: CommandOutcome,
    },

    // ========== Error ==========
    /// Error response
    Error {
        message: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Join { .. } => "Join",
            Message::JoinAck { .. } => "JoinAck",
            Message::Leave { .. } => "Leave",
            Message::LeaveAck => "LeaveAck",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Execute { .. } => "Execute",
            Message::ExecuteResult { .. } => "ExecuteResult",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseEvent};

    #[test]
    fn test_execute_message_survives_the_wire() {
        let event = DatabaseEvent::new(&Database::new("db2", "10.0.0.2"));
        let msg = Message::Execute {
            from: Member::new("node-1", "10.0.0.1:7654"),
            command: Command::Deactivation(event.clone()),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Execute { from, command } => {
                assert_eq!(from.id, "node-1");
                assert_eq!(command, Command::Deactivation(event));
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(restored.checksum, crc32fast::hash(data));
    }
}
