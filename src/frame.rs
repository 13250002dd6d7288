//! Wire framing for the two per-datagram frames: data blocks and window
//! acknowledgements. Both carry the session id in their first two bytes so
//! the demux can route before any further validation.

use crate::error::TransportError;
use crate::protocol::{
    ACK_HEADER_LEN, BlockNumber, DATA_HEADER_LEN, FLAG_LAST, FLAG_RESERVED_PATTERN, FLAG_RESUME,
    SessionId,
};

/// Reads the session id out of any frame without validating the rest.
/// Returns `None` for datagrams too short to be any frame.
pub fn peek_session_id(bytes: &[u8]) -> Option<SessionId> {
    if bytes.len() < 3 {
        return None;
    }
    Some(SessionId(u16::from_le_bytes([bytes[0], bytes[1]])))
}

/// One block of the object on the wire.
///
/// ```text
/// 0..2  session_id    u16 LE
/// 2..4  block_number  u16 LE
/// 4     flags
/// 5..   payload       1..=block_size bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub session_id: SessionId,
    pub block: BlockNumber,
    pub resume: bool,
    pub last: bool,
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    /// Replaces `out` with the encoded datagram.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(DATA_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.session_id.0.to_le_bytes());
        out.extend_from_slice(&self.block.0.to_le_bytes());
        let mut flags = FLAG_RESERVED_PATTERN;
        if self.resume {
            flags |= FLAG_RESUME;
        }
        if self.last {
            flags |= FLAG_LAST;
        }
        out.push(flags);
        out.extend_from_slice(self.payload);
    }

    /// Decodes and validates a data frame against the addressed session's
    /// parameters. The payload must be non-empty and no larger than a block;
    /// the block number must fall inside the modular numbering space.
    pub fn decode(
        bytes: &'a [u8],
        block_size: u16,
        ring: u16,
    ) -> Result<DataFrame<'a>, TransportError> {
        if bytes.len() <= DATA_HEADER_LEN {
            return Err(TransportError::InvalidFrame);
        }
        let payload = &bytes[DATA_HEADER_LEN..];
        if payload.len() > block_size as usize {
            return Err(TransportError::InvalidFrame);
        }
        let flags = bytes[4];
        if flags & !(FLAG_LAST | FLAG_RESUME) != FLAG_RESERVED_PATTERN {
            return Err(TransportError::InvalidFrame);
        }
        let block = BlockNumber(u16::from_le_bytes([bytes[2], bytes[3]]));
        if block.0 >= ring {
            return Err(TransportError::InvalidFrame);
        }
        Ok(DataFrame {
            session_id: SessionId(u16::from_le_bytes([bytes[0], bytes[1]])),
            block,
            resume: flags & FLAG_RESUME != 0,
            last: flags & FLAG_LAST != 0,
            payload,
        })
    }
}

/// Acknowledgement for one window.
///
/// ```text
/// 0..2  session_id    u16 LE
/// 2     error_code    0 = success, nonzero = peer-reported fatal
/// 3..5  window_start  u16 LE, first block number of the window being ACKed
/// 5..   missing-blocks bitmap
/// ```
///
/// An empty bitmap acknowledges the entire window; otherwise the bitmap is
/// `ceil(ring / 8)` bytes and bit `i` set means block number `i` of the
/// window was not received. `window_start` lets the sender drop stale ACKs
/// from windows it has already advanced past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame<'a> {
    pub session_id: SessionId,
    pub error: u8,
    pub window_start: BlockNumber,
    pub missing: &'a [u8],
}

impl<'a> AckFrame<'a> {
    /// Replaces `out` with the encoded datagram.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(ACK_HEADER_LEN + self.missing.len());
        out.extend_from_slice(&self.session_id.0.to_le_bytes());
        out.push(self.error);
        out.extend_from_slice(&self.window_start.0.to_le_bytes());
        out.extend_from_slice(self.missing);
    }

    /// Decodes an ACK, rejecting any length that contradicts the addressed
    /// session's declared window size.
    pub fn decode(
        bytes: &'a [u8],
        bitmap_len: usize,
        ring: u16,
    ) -> Result<AckFrame<'a>, TransportError> {
        if bytes.len() != ACK_HEADER_LEN && bytes.len() != ACK_HEADER_LEN + bitmap_len {
            return Err(TransportError::InvalidFrame);
        }
        let window_start = BlockNumber(u16::from_le_bytes([bytes[3], bytes[4]]));
        if window_start.0 >= ring {
            return Err(TransportError::InvalidFrame);
        }
        Ok(AckFrame {
            session_id: SessionId(u16::from_le_bytes([bytes[0], bytes[1]])),
            error: bytes[2],
            window_start,
            missing: &bytes[ACK_HEADER_LEN..],
        })
    }
}
