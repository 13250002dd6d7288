//! # blocklink
//!
//! A reliable, windowed, block-oriented transport for byte objects of known
//! length over connection-oriented datagram links whose MTU is too small to
//! carry application payloads in one piece. The canonical deployment is a
//! BLE GATT pipe between a constrained device and a companion gateway, but
//! the design is link-agnostic.
//!
//! ## Architecture
//!
//! - **Reliability**: windowed ARQ with selective-retransmit bitmap ACKs;
//!   block numbers run modulo `2 * window_size` so retransmits from window
//!   `k` can never be confused with fresh blocks from window `k + 1`.
//! - **Framing**: 5-byte data-frame headers and bitmap ACK frames, one frame
//!   per datagram.
//! - **Sessions**: a parity-split 16-bit id space lets symmetric peers run
//!   independent send and receive sessions over one link without collision;
//!   the [`Context`] demultiplexes inbound datagrams across its session
//!   tables.
//! - **Capabilities**: the datagram link and the control-message encoding
//!   are trait objects injected at context creation; the core never names a
//!   concrete implementation.
//! - **Timing**: sans-IO. Every operation takes `now: Instant`; the embedder
//!   calls [`Context::poll`] whenever [`Context::next_wakeup`] comes due.
//!   There are no suspension points and no background threads.

pub use rmp;

pub mod bitmap;
pub mod context;
pub mod control;
pub mod error;
pub mod frame;
pub mod link;
pub mod protocol;
pub mod receive;
pub mod send;

/// Session lifecycle notifications, drained through [`Context::poll_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The peer acknowledged the final window.
    SendComplete(SessionId),
    /// The retry budget for one window is exhausted; the session lingers and
    /// may be revived with [`Context::resume`].
    SendTimedOut(SessionId),
    /// The session failed fatally (peer report, expiry, or network).
    SendFailed(SessionId, TransportError),
    /// An inbound START was admitted.
    ReceiveStarted(SessionId),
    /// The terminal block was delivered and the final ACK emitted.
    ReceiveComplete(SessionId),
    /// The session failed fatally (peer abort, expiry, or network).
    ReceiveFailed(SessionId, TransportError),
}

pub use bitmap::BlockBitmap;
pub use context::{Config, Context};
pub use control::{ControlCodec, ControlMessage, MsgpackCodec};
pub use error::TransportError;
pub use frame::{AckFrame, DataFrame};
pub use link::{DatagramLink, ReceiveHandler};
pub use protocol::{BlockNumber, IdParity, SessionId, SessionParams};
pub use receive::{RecvPhase, RecvSession};
pub use send::{SendPhase, SendSession};
