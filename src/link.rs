use crate::error::TransportError;
use crate::protocol::SessionId;

/// Capability interface to the datagram link underneath the transport.
///
/// The link must deliver bounded-size datagrams uncorrupted; it may reorder,
/// duplicate, or drop them. `send_datagram` is synchronous and non-blocking
/// at this layer; a partial write is treated as a network error by the core.
pub trait DatagramLink: Send + Sync {
    fn send_datagram(&self, bytes: &[u8]) -> Result<usize, TransportError>;
}

/// Application-side sink for received object bytes.
///
/// Calls arrive in strictly ascending, contiguous offset order starting at
/// zero; every call but the last carries exactly one full block.
pub trait ReceiveHandler: Send {
    fn on_block(&mut self, session: SessionId, offset: u64, data: &[u8]);
}

pub(crate) fn transmit(link: &dyn DatagramLink, bytes: &[u8]) -> Result<(), TransportError> {
    match link.send_datagram(bytes) {
        Ok(n) if n == bytes.len() => Ok(()),
        Ok(_) => Err(TransportError::NetworkError),
        Err(err) => Err(err),
    }
}
