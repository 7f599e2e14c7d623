//! Signal characteristic wire codec
//!
//! Every write to the signal characteristic starts with an action byte:
//!
//! ```text
//! payload         [1][len: u16 LE][payload]
//! rssi            [2][rssi: i16 LE]
//! payload sharing [3][rssi: i16 LE][len: u16 LE][payloads]
//! immediate send  [4][len: u16 LE][data]
//! ```
//!
//! Android-style writers split a message into fixed-size chunks, so the
//! server side accumulates bytes per central in a `SignalReassembler` until
//! the message decodes.

use crate::device::TargetIdentifier;
use crate::payload::{PayloadData, PayloadSharingData};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest accepted signal message, header included
pub const MAX_SIGNAL_MESSAGE_BYTES: usize = 1024;

/// Partial messages older than this are discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty signal message")]
    Empty,
    #[error("Unknown action code {0}")]
    UnknownAction(u8),
    #[error("Incomplete message: need {expected} bytes, have {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("Message too long: {0} bytes")]
    TooLong(usize),
}

impl CodecError {
    /// More bytes may still complete the message
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }
}

/// Action byte of a signal message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalAction {
    Payload = 1,
    Rssi = 2,
    PayloadSharing = 3,
    ImmediateSend = 4,
}

impl SignalAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SignalAction::Payload),
            2 => Some(SignalAction::Rssi),
            3 => Some(SignalAction::PayloadSharing),
            4 => Some(SignalAction::ImmediateSend),
            _ => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Payload => write!(f, "payload"),
            SignalAction::Rssi => write!(f, "rssi"),
            SignalAction::PayloadSharing => write!(f, "payload_sharing"),
            SignalAction::ImmediateSend => write!(f, "immediate_send"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Payload(PayloadData),
    Rssi(i16),
    PayloadSharing(PayloadSharingData),
    ImmediateSend(Vec<u8>),
}

fn length_prefix(len: usize) -> Result<[u8; 2], CodecError> {
    u16::try_from(len)
        .map(|l| l.to_le_bytes())
        .map_err(|_| CodecError::TooLong(len))
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, CodecError> {
    if bytes.len() < at + 2 {
        return Err(CodecError::Incomplete {
            expected: at + 2,
            actual: bytes.len(),
        });
    }
    Ok(u16::from_le_bytes([bytes[at], bytes[at + 1]]))
}

fn read_body(bytes: &[u8], at: usize, len: usize) -> Result<Vec<u8>, CodecError> {
    if bytes.len() < at + len {
        return Err(CodecError::Incomplete {
            expected: at + len,
            actual: bytes.len(),
        });
    }
    Ok(bytes[at..at + len].to_vec())
}

impl SignalMessage {
    pub fn action(&self) -> SignalAction {
        match self {
            SignalMessage::Payload(_) => SignalAction::Payload,
            SignalMessage::Rssi(_) => SignalAction::Rssi,
            SignalMessage::PayloadSharing(_) => SignalAction::PayloadSharing,
            SignalMessage::ImmediateSend(_) => SignalAction::ImmediateSend,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![self.action() as u8];
        match self {
            SignalMessage::Payload(payload) => {
                out.extend_from_slice(&length_prefix(payload.len())?);
                out.extend_from_slice(payload.as_bytes());
            }
            SignalMessage::Rssi(rssi) => out.extend_from_slice(&rssi.to_le_bytes()),
            SignalMessage::PayloadSharing(sharing) => {
                out.extend_from_slice(&sharing.rssi.to_le_bytes());
                out.extend_from_slice(&length_prefix(sharing.data.len())?);
                out.extend_from_slice(&sharing.data);
            }
            SignalMessage::ImmediateSend(data) => {
                out.extend_from_slice(&length_prefix(data.len())?);
                out.extend_from_slice(data);
            }
        }
        if out.len() > MAX_SIGNAL_MESSAGE_BYTES {
            return Err(CodecError::TooLong(out.len()));
        }
        Ok(out)
    }

    /// Decode one message. Bytes past the declared length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let action = Self::detect(bytes)?;
        match action {
            SignalAction::Payload => {
                let len = read_u16(bytes, 1)? as usize;
                Ok(SignalMessage::Payload(PayloadData::new(read_body(bytes, 3, len)?)))
            }
            SignalAction::Rssi => {
                let raw = read_u16(bytes, 1)?;
                Ok(SignalMessage::Rssi(raw as i16))
            }
            SignalAction::PayloadSharing => {
                let rssi = read_u16(bytes, 1)? as i16;
                let len = read_u16(bytes, 3)? as usize;
                Ok(SignalMessage::PayloadSharing(PayloadSharingData {
                    rssi,
                    data: read_body(bytes, 5, len)?,
                }))
            }
            SignalAction::ImmediateSend => {
                let len = read_u16(bytes, 1)? as usize;
                Ok(SignalMessage::ImmediateSend(read_body(bytes, 3, len)?))
            }
        }
    }

    /// Classify a buffer by its action byte
    pub fn detect(bytes: &[u8]) -> Result<SignalAction, CodecError> {
        let first = *bytes.first().ok_or(CodecError::Empty)?;
        SignalAction::from_u8(first).ok_or(CodecError::UnknownAction(first))
    }
}

struct PartialSignal {
    buffer: Vec<u8>,
    updated_at: Instant,
}

/// Per-central accumulator for fragmented signal writes
#[derive(Default)]
pub struct SignalReassembler {
    partials: HashMap<TargetIdentifier, PartialSignal>,
}

impl SignalReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes written by `central`. Returns the message once complete,
    /// `None` while more bytes are needed. Any other decode failure discards
    /// the central's buffer.
    pub fn push(
        &mut self,
        central: &TargetIdentifier,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<SignalMessage>, CodecError> {
        let entry = self
            .partials
            .entry(central.clone())
            .or_insert_with(|| PartialSignal {
                buffer: Vec::new(),
                updated_at: now,
            });
        if !entry.buffer.is_empty() && now.duration_since(entry.updated_at) > REASSEMBLY_TIMEOUT {
            debug!(
                "Discarding stale partial signal from {} ({} bytes)",
                central,
                entry.buffer.len()
            );
            entry.buffer.clear();
        }
        entry.buffer.extend_from_slice(bytes);
        entry.updated_at = now;

        if entry.buffer.len() > MAX_SIGNAL_MESSAGE_BYTES {
            let len = entry.buffer.len();
            self.partials.remove(central);
            warn!("Signal from {} exceeded {} bytes", central, MAX_SIGNAL_MESSAGE_BYTES);
            return Err(CodecError::TooLong(len));
        }

        match SignalMessage::decode(&entry.buffer) {
            Ok(message) => {
                self.partials.remove(central);
                Ok(Some(message))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => {
                self.partials.remove(central);
                Err(e)
            }
        }
    }

    /// Drop whatever is buffered for `central`
    pub fn discard(&mut self, central: &TargetIdentifier) {
        self.partials.remove(central);
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
