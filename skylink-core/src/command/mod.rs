//! Opaque command values and their wire form
//!
//! A [`Command`] is produced by an encoder closure filling an empty command,
//! then owned by whoever sends it. The wire layout is
//! `project:u8 | class:u8 | command:u16 LE | payload`.

pub mod log;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};

/// Size of the command header on the wire
pub const HEADER_LEN: usize = 4;

/// Largest payload a single command may carry
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Identifier of a command in the device protocol
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CommandId {
    pub project: u8,
    pub class: u8,
    pub command: u16,
}

impl CommandId {
    pub const fn new(project: u8, class: u8, command: u16) -> Self {
        Self {
            project,
            class,
            command,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.class, self.command)
    }
}

/// Transmission buffer a command travels on
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
pub enum BufferType {
    /// Sent without acknowledgement, may be lost
    NoAck,
    /// Acknowledged and retransmitted
    #[default]
    Ack,
    /// Acknowledged, sent ahead of the regular buffer
    HighPriority,
}

/// A protocol command
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Command {
    pub id: CommandId,
    pub buffer: BufferType,
    pub payload: Bytes,
}

impl Command {
    /// An empty command for an encoder to fill
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(id: CommandId, buffer: BufferType, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            buffer,
            payload: payload.into(),
        }
    }

    /// Replace the payload, enforcing the maximum payload size
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> Result<(), EncodeError> {
        let payload = payload.into();
        check_payload_len(payload.len())?;
        self.payload = payload;
        Ok(())
    }

    /// Check a command is sendable
    ///
    /// `payload` is public, so senders check again before handing the
    /// command to a backend.
    pub fn validate(&self) -> Result<(), EncodeError> {
        check_payload_len(self.payload.len())
    }

    /// Whether the command travels on an acknowledged buffer
    pub fn is_acknowledged(&self) -> bool {
        self.buffer != BufferType::NoAck
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.put_u8(self.id.project);
        out.put_u8(self.id.class);
        out.put_u16_le(self.id.command);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Parse wire bytes received on `buffer`
    pub fn decode(buffer: BufferType, mut raw: Bytes) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(raw.len()));
        }
        if raw.len() - HEADER_LEN > MAX_PAYLOAD_LEN {
            return Err(DecodeError::PayloadTooLarge(raw.len() - HEADER_LEN));
        }
        let project = raw.get_u8();
        let class = raw.get_u8();
        let command = raw.get_u16_le();
        Ok(Self {
            id: CommandId::new(project, class, command),
            buffer,
            payload: raw,
        })
    }
}

fn check_payload_len(size: usize) -> Result<(), EncodeError> {
    if size > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &format_args!("{}", self.id))
            .field("buffer", &self.buffer)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// One-shot encoder filling an empty command
pub type CommandEncoder = Box<dyn FnOnce(&mut Command) -> Result<(), EncodeError> + Send>;

/// Box an encoder closure
pub fn encoder<F>(f: F) -> CommandEncoder
where
    F: FnOnce(&mut Command) -> Result<(), EncodeError> + Send + 'static,
{
    Box::new(f)
}
