//! Session-level control messages: START, ABORT, RESUME, and the control ACK
//! used for session-setup errors. Messages travel as self-describing maps of
//! one-character string keys to signed integers; the concrete encoding is a
//! capability chosen at context creation.

use crate::error::TransportError;
use crate::protocol::SessionId;

const MSG_START: i64 = 1;
const MSG_ABORT: i64 = 2;
const MSG_RESUME: i64 = 3;
const MSG_ACK: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Opens a session and fixes its parameters for the object's lifetime.
    Start {
        session_id: SessionId,
        object_size: u64,
        block_size: u16,
        window_size: u16,
        timeout_ms: u32,
        max_retransmits: u32,
        expiry_ms: u32,
    },
    /// Tears a session down, carrying the reporter's error code.
    Abort { session_id: SessionId, code: u8 },
    /// Revives a timed-out session from a window boundary.
    Resume { session_id: SessionId, offset: u64 },
    /// Session-setup reply; per-window acknowledgements use the ACK frame.
    Ack { session_id: SessionId, code: u8 },
}

impl ControlMessage {
    pub fn session_id(&self) -> SessionId {
        match *self {
            ControlMessage::Start { session_id, .. }
            | ControlMessage::Abort { session_id, .. }
            | ControlMessage::Resume { session_id, .. }
            | ControlMessage::Ack { session_id, .. } => session_id,
        }
    }
}

/// Pluggable encoder/decoder for control messages.
pub trait ControlCodec: Send {
    /// Replaces `out` with the encoded message.
    fn encode(&self, msg: &ControlMessage, out: &mut Vec<u8>) -> Result<(), TransportError>;
    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, TransportError>;
}

/// The provided codec: one MessagePack map per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackCodec;

fn write_entry(out: &mut Vec<u8>, key: &str, value: i64) -> Result<(), TransportError> {
    rmp::encode::write_str(out, key).map_err(|_| TransportError::Internal)?;
    rmp::encode::write_sint(out, value).map_err(|_| TransportError::Internal)?;
    Ok(())
}

fn map_header(out: &mut Vec<u8>, entries: u32) -> Result<(), TransportError> {
    rmp::encode::write_map_len(out, entries).map_err(|_| TransportError::Internal)?;
    Ok(())
}

fn field_u8(value: Option<i64>) -> Result<u8, TransportError> {
    u8::try_from(value.ok_or(TransportError::InvalidControl)?)
        .map_err(|_| TransportError::InvalidControl)
}

fn field_u16(value: Option<i64>) -> Result<u16, TransportError> {
    u16::try_from(value.ok_or(TransportError::InvalidControl)?)
        .map_err(|_| TransportError::InvalidControl)
}

fn field_u32(value: Option<i64>) -> Result<u32, TransportError> {
    u32::try_from(value.ok_or(TransportError::InvalidControl)?)
        .map_err(|_| TransportError::InvalidControl)
}

fn field_u64(value: Option<i64>) -> Result<u64, TransportError> {
    u64::try_from(value.ok_or(TransportError::InvalidControl)?)
        .map_err(|_| TransportError::InvalidControl)
}

impl ControlCodec for MsgpackCodec {
    fn encode(&self, msg: &ControlMessage, out: &mut Vec<u8>) -> Result<(), TransportError> {
        out.clear();
        match *msg {
            ControlMessage::Start {
                session_id,
                object_size,
                block_size,
                window_size,
                timeout_ms,
                max_retransmits,
                expiry_ms,
            } => {
                let object_size =
                    i64::try_from(object_size).map_err(|_| TransportError::InvalidParams)?;
                map_header(out, 8)?;
                write_entry(out, "m", MSG_START)?;
                write_entry(out, "i", i64::from(session_id.0))?;
                write_entry(out, "s", object_size)?;
                write_entry(out, "b", i64::from(block_size))?;
                write_entry(out, "w", i64::from(window_size))?;
                write_entry(out, "t", i64::from(timeout_ms))?;
                write_entry(out, "r", i64::from(max_retransmits))?;
                write_entry(out, "x", i64::from(expiry_ms))?;
            }
            ControlMessage::Abort { session_id, code } => {
                map_header(out, 3)?;
                write_entry(out, "m", MSG_ABORT)?;
                write_entry(out, "i", i64::from(session_id.0))?;
                write_entry(out, "e", i64::from(code))?;
            }
            ControlMessage::Resume { session_id, offset } => {
                let offset = i64::try_from(offset).map_err(|_| TransportError::InvalidParams)?;
                map_header(out, 3)?;
                write_entry(out, "m", MSG_RESUME)?;
                write_entry(out, "i", i64::from(session_id.0))?;
                write_entry(out, "s", offset)?;
            }
            ControlMessage::Ack { session_id, code } => {
                map_header(out, 3)?;
                write_entry(out, "m", MSG_ACK)?;
                write_entry(out, "i", i64::from(session_id.0))?;
                write_entry(out, "e", i64::from(code))?;
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, TransportError> {
        let mut rd: &[u8] = bytes;
        let entries =
            rmp::decode::read_map_len(&mut rd).map_err(|_| TransportError::InvalidControl)?;

        let mut m = None;
        let mut i = None;
        let mut s = None;
        let mut b = None;
        let mut w = None;
        let mut t = None;
        let mut r = None;
        let mut x = None;
        let mut e = None;

        for _ in 0..entries {
            let (key, rest) =
                rmp::decode::read_str_from_slice(rd).map_err(|_| TransportError::InvalidControl)?;
            rd = rest;
            let value: i64 =
                rmp::decode::read_int(&mut rd).map_err(|_| TransportError::InvalidControl)?;
            let slot = match key {
                "m" => &mut m,
                "i" => &mut i,
                "s" => &mut s,
                "b" => &mut b,
                "w" => &mut w,
                "t" => &mut t,
                "r" => &mut r,
                "x" => &mut x,
                "e" => &mut e,
                // Unknown keys are skipped for forward compatibility.
                _ => continue,
            };
            if slot.replace(value).is_some() {
                return Err(TransportError::InvalidControl);
            }
        }

        let session_id = SessionId(field_u16(i)?);
        match m.ok_or(TransportError::InvalidControl)? {
            MSG_START => Ok(ControlMessage::Start {
                session_id,
                object_size: field_u64(s)?,
                block_size: field_u16(b)?,
                window_size: field_u16(w)?,
                timeout_ms: field_u32(t)?,
                max_retransmits: field_u32(r)?,
                expiry_ms: field_u32(x)?,
            }),
            MSG_ABORT => Ok(ControlMessage::Abort {
                session_id,
                code: field_u8(e)?,
            }),
            MSG_RESUME => Ok(ControlMessage::Resume {
                session_id,
                offset: field_u64(s)?,
            }),
            MSG_ACK => Ok(ControlMessage::Ack {
                session_id,
                code: field_u8(e)?,
            }),
            _ => Err(TransportError::InvalidControl),
        }
    }
}
