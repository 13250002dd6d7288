//! Receiver half of the windowed ARQ: accumulates blocks into a per-window
//! buffer and bitmap, coalesces acknowledgements on a timer, and delivers
//! completed windows to the application in order.

use crate::TransferEvent;
use crate::bitmap::BlockBitmap;
use crate::control::{ControlCodec, ControlMessage};
use crate::error::TransportError;
use crate::frame::{AckFrame, DataFrame};
use crate::link::{self, DatagramLink, ReceiveHandler};
use crate::protocol::{BlockNumber, SessionId, SessionParams};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvPhase {
    Receiving,
    /// Transient while a completed window is handed to the application.
    Delivering,
    Complete,
    Failed(TransportError),
    Aborted,
}

impl RecvPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecvPhase::Complete | RecvPhase::Failed(_) | RecvPhase::Aborted
        )
    }
}

pub struct RecvSession {
    pub id: SessionId,
    params: SessionParams,
    total_len: usize,
    /// Exactly `window_size * block_size` bytes, reused for every window.
    buffer: Vec<u8>,
    /// Indexed by absolute block number; a set bit means the block is in the
    /// buffer exactly once.
    received: BlockBitmap,
    window_base: usize,
    first_block: BlockNumber,
    /// Whether at least one window has completed. Until then an
    /// out-of-half block cannot be a previous-window retransmit.
    advanced: bool,
    /// The final ACK of the previous window may have been lost; re-send it on
    /// the next ACK deadline.
    reack_pending: bool,
    phase: RecvPhase,
    ack_at: Option<Instant>,
    expires_at: Instant,
    scratch: Vec<u8>,
}

impl RecvSession {
    /// Admits a session from an inbound START. The window buffer is the one
    /// allocation the session ever makes; failure refuses admission with
    /// `NoMemory` instead of aborting the process.
    pub fn admit(
        id: SessionId,
        params: SessionParams,
        total_len: u64,
        now: Instant,
    ) -> Result<Self, TransportError> {
        params.validate()?;
        if total_len == 0 {
            return Err(TransportError::InvalidParams);
        }
        let total_len = usize::try_from(total_len).map_err(|_| TransportError::InvalidParams)?;
        let cap = params.window_size as usize * params.block_size() as usize;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(cap)
            .map_err(|_| TransportError::NoMemory)?;
        buffer.resize(cap, 0);
        Ok(Self {
            id,
            received: BlockBitmap::new(params.ring() as usize),
            ack_at: Some(now + params.timeout),
            expires_at: now + params.session_expiry,
            params,
            total_len,
            buffer,
            window_base: 0,
            first_block: BlockNumber(0),
            advanced: false,
            reack_pending: false,
            phase: RecvPhase::Receiving,
            scratch: Vec::new(),
        })
    }

    pub fn phase(&self) -> RecvPhase {
        self.phase
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn window_base(&self) -> usize {
        self.window_base
    }

    fn block_size(&self) -> usize {
        self.params.block_size() as usize
    }

    fn remaining(&self) -> usize {
        self.total_len.saturating_sub(self.window_base)
    }

    fn blocks_in_window(&self) -> u16 {
        self.remaining()
            .div_ceil(self.block_size())
            .min(self.params.window_size as usize) as u16
    }

    fn window_complete(&self) -> bool {
        let first = self.first_block.0 as usize;
        !self
            .received
            .any_missing_in_range(first, first + self.blocks_in_window() as usize)
    }

    /// Accepts one data frame for this session. Blocks are buffered whether
    /// or not a handler is installed yet; only window completion needs one.
    pub fn on_data(
        &mut self,
        frame: &DataFrame<'_>,
        link: &dyn DatagramLink,
        handler: Option<&mut (dyn ReceiveHandler + 'static)>,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if self.phase != RecvPhase::Receiving {
            return;
        }
        let ring = self.params.ring();
        let idx = frame.block.offset_from(self.first_block, ring);
        if idx >= self.params.window_size {
            // Out of the current half. The sender never runs ahead of us, so
            // once we have advanced this is a previous-window retransmit:
            // our final ACK was lost.
            if self.advanced {
                debug!(
                    "stale block {} on session {}, re-ack pending",
                    frame.block, self.id
                );
                self.reack_pending = true;
            } else {
                debug!(
                    "dropping out-of-window block {} on session {}",
                    frame.block, self.id
                );
            }
            return;
        }
        if idx >= self.blocks_in_window() {
            warn!(
                "dropping block {} beyond object end on session {}",
                frame.block, self.id
            );
            return;
        }
        let bs = self.block_size();
        let offset = self.window_base + idx as usize * bs;
        let expected = bs.min(self.total_len - offset);
        let is_terminal = offset + expected == self.total_len;
        if frame.payload.len() != expected || frame.last != is_terminal {
            warn!(
                "dropping malformed block {} on session {} ({} bytes, last={})",
                frame.block,
                self.id,
                frame.payload.len(),
                frame.last
            );
            return;
        }
        if !self.received.set(frame.block.0 as usize) {
            debug!("duplicate block {} on session {}", frame.block, self.id);
            return;
        }
        self.buffer[idx as usize * bs..idx as usize * bs + expected].copy_from_slice(frame.payload);
        if self.window_complete() {
            // Window full: fire the ACK path immediately instead of waiting
            // for the coalescing deadline.
            match handler {
                Some(handler) => self.finish_window(link, handler, events, now),
                None => debug!(
                    "session {} window complete, waiting for a receive handler",
                    self.id
                ),
            }
        }
    }

    /// Acknowledges the completed window, delivers it in block order, and
    /// advances to the next window or completion.
    fn finish_window(
        &mut self,
        link: &dyn DatagramLink,
        handler: &mut (dyn ReceiveHandler + 'static),
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if let Err(err) = self.send_ack(link, self.first_block, &[]) {
            // An unsent ACK deadlocks the transfer; fail loudly instead.
            warn!("ack for session {} not sent: {}", self.id, err);
            self.fail(TransportError::NetworkError, events);
            return;
        }
        let n = self.blocks_in_window() as usize;
        let bs = self.block_size();
        self.phase = RecvPhase::Delivering;
        for j in 0..n {
            let offset = self.window_base + j * bs;
            let len = bs.min(self.total_len - offset);
            handler.on_block(self.id, offset as u64, &self.buffer[j * bs..j * bs + len]);
        }
        self.received.clear_all();
        self.first_block = self
            .first_block
            .advanced_by(self.params.window_size, self.params.ring());
        self.window_base += self.params.window_size as usize * bs;
        self.advanced = true;
        self.reack_pending = false;
        if self.window_base >= self.total_len {
            self.ack_at = None;
            self.phase = RecvPhase::Complete;
            debug!("receive session {} complete", self.id);
            events.push_back(TransferEvent::ReceiveComplete(self.id));
        } else {
            self.phase = RecvPhase::Receiving;
            self.ack_at = Some(now + self.params.timeout);
        }
    }

    fn send_ack(
        &mut self,
        link: &dyn DatagramLink,
        window_start: BlockNumber,
        missing: &[u8],
    ) -> Result<(), TransportError> {
        let frame = AckFrame {
            session_id: self.id,
            error: 0,
            window_start,
            missing,
        };
        frame.encode(&mut self.scratch);
        link::transmit(link, &self.scratch)
    }

    /// Drives the ACK-coalescing and expiry deadlines.
    pub fn poll(
        &mut self,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        handler: Option<&mut (dyn ReceiveHandler + 'static)>,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if self.phase != RecvPhase::Receiving {
            return;
        }
        if now >= self.expires_at {
            warn!("receive session {} exceeded its expiry budget", self.id);
            self.ack_at = None;
            self.send_abort(link, codec, TransportError::Expired.wire_code());
            self.fail(TransportError::Expired, events);
            return;
        }
        if let Some(at) = self.ack_at {
            if now >= at {
                self.on_ack_timer(link, handler, events, now);
            }
        }
    }

    fn on_ack_timer(
        &mut self,
        link: &dyn DatagramLink,
        handler: Option<&mut (dyn ReceiveHandler + 'static)>,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if self.reack_pending {
            self.reack_pending = false;
            let ring = self.params.ring();
            let prev = self
                .first_block
                .advanced_by(ring - self.params.window_size, ring);
            if self.send_ack(link, prev, &[]).is_err() {
                self.fail(TransportError::NetworkError, events);
                return;
            }
            if self.received.count_set() == 0 {
                self.ack_at = Some(now + self.params.timeout);
                return;
            }
        }
        if self.window_complete() {
            // No delivery without a handler; the ack is withheld too, so the
            // sender retransmits rather than advances.
            match handler {
                Some(handler) => self.finish_window(link, handler, events, now),
                None => self.ack_at = Some(now + self.params.timeout),
            }
            return;
        }
        // Selective-retransmit ACK: flag every missing block of the window.
        let mut missing = BlockBitmap::new(self.params.ring() as usize);
        let first = self.first_block.0 as usize;
        let limit = first + self.blocks_in_window() as usize;
        let mut cursor = first;
        while let Some(hole) = self.received.next_missing(cursor, limit) {
            missing.set(hole);
            cursor = hole + 1;
        }
        let mut wire = Vec::with_capacity(missing.wire_len());
        missing.write_wire(&mut wire);
        if self.send_ack(link, self.first_block, &wire).is_err() {
            self.fail(TransportError::NetworkError, events);
            return;
        }
        self.ack_at = Some(now + self.params.timeout);
    }

    /// Sender-side resume lands here. The sender always resumes from a window
    /// boundary; any disagreement about where that boundary lies is fatal.
    pub fn on_resume(
        &mut self,
        offset: u64,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if self.phase != RecvPhase::Receiving {
            return;
        }
        if offset == self.window_base as u64 {
            debug!("session {} resumed at offset {}", self.id, offset);
            self.reack_pending = false;
            self.ack_at = Some(now + self.params.timeout);
        } else {
            warn!(
                "resume offset {} does not match window base {} on session {}, aborting",
                offset, self.window_base, self.id
            );
            self.ack_at = None;
            self.send_abort(link, codec, TransportError::InvalidControl.wire_code());
            self.phase = RecvPhase::Aborted;
            events.push_back(TransferEvent::ReceiveFailed(
                self.id,
                TransportError::InvalidControl,
            ));
        }
    }

    /// Synchronous teardown: cancels deadlines, emits ABORT best-effort.
    pub fn abort(&mut self, link: &dyn DatagramLink, codec: &dyn ControlCodec, code: u8) {
        self.ack_at = None;
        self.send_abort(link, codec, code);
        self.phase = RecvPhase::Aborted;
    }

    fn send_abort(&mut self, link: &dyn DatagramLink, codec: &dyn ControlCodec, code: u8) {
        let msg = ControlMessage::Abort {
            session_id: self.id,
            code,
        };
        match codec.encode(&msg, &mut self.scratch) {
            Ok(()) => {
                if let Err(err) = link::transmit(link, &self.scratch) {
                    warn!("abort for session {} not delivered: {}", self.id, err);
                }
            }
            Err(err) => warn!("abort for session {} not encoded: {}", self.id, err),
        }
    }

    fn fail(&mut self, err: TransportError, events: &mut VecDeque<TransferEvent>) {
        self.ack_at = None;
        self.phase = RecvPhase::Failed(err);
        events.push_back(TransferEvent::ReceiveFailed(self.id, err));
    }

    /// Terminal failure reported by the peer (inbound ABORT).
    pub fn fail_peer(&mut self, err: TransportError, events: &mut VecDeque<TransferEvent>) {
        self.fail(err, events);
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.phase != RecvPhase::Receiving {
            return None;
        }
        match self.ack_at {
            Some(at) => Some(at.min(self.expires_at)),
            None => Some(self.expires_at),
        }
    }
}
