//! Sender half of the windowed ARQ: emits one window of blocks, waits for the
//! window acknowledgement, retransmits whole windows on timeout and single
//! blocks on selective ACKs.

use crate::TransferEvent;
use crate::bitmap;
use crate::control::{ControlCodec, ControlMessage};
use crate::error::TransportError;
use crate::frame::{AckFrame, DataFrame};
use crate::link::{self, DatagramLink};
use crate::protocol::{self, BlockNumber, SessionId, SessionParams};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Init,
    Starting,
    /// The current window is in flight and more windows follow.
    Sending,
    /// The current window carries the terminal block.
    Draining,
    Complete,
    Failed(TransportError),
    Aborted,
}

impl SendPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SendPhase::Complete | SendPhase::Failed(_) | SendPhase::Aborted
        )
    }
}

pub struct SendSession {
    pub id: SessionId,
    params: SessionParams,
    object: Vec<u8>,
    phase: SendPhase,
    /// Byte offset of the first block of the current window.
    window_base: usize,
    first_block: BlockNumber,
    retries_left: u32,
    /// Armed iff blocks are unacknowledged in flight and the phase is not
    /// terminal.
    retransmit_at: Option<Instant>,
    expires_at: Instant,
    resume_flag_pending: bool,
    scratch: Vec<u8>,
}

impl SendSession {
    pub fn new(
        id: SessionId,
        object: Vec<u8>,
        params: SessionParams,
        now: Instant,
    ) -> Result<Self, TransportError> {
        params.validate()?;
        if object.is_empty() {
            // The LAST flag rides on a data block; an empty object has none.
            return Err(TransportError::InvalidParams);
        }
        Ok(Self {
            id,
            expires_at: now + params.session_expiry,
            retries_left: params.max_retransmits,
            params,
            object,
            phase: SendPhase::Init,
            window_base: 0,
            first_block: BlockNumber(0),
            retransmit_at: None,
            resume_flag_pending: false,
            scratch: Vec::new(),
        })
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn window_base(&self) -> usize {
        self.window_base
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    fn block_size(&self) -> usize {
        self.params.block_size() as usize
    }

    fn remaining(&self) -> usize {
        self.object.len().saturating_sub(self.window_base)
    }

    fn blocks_in_window(&self) -> u16 {
        self.remaining()
            .div_ceil(self.block_size())
            .min(self.params.window_size as usize) as u16
    }

    fn window_has_last(&self) -> bool {
        self.remaining() <= self.params.window_size as usize * self.block_size()
    }

    /// Emits START and the first window, arming the retransmit timer.
    pub fn start(
        &mut self,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.phase != SendPhase::Init {
            return Err(TransportError::SessionInProgress);
        }
        let msg = ControlMessage::Start {
            session_id: self.id,
            object_size: self.object.len() as u64,
            block_size: self.params.block_size(),
            window_size: self.params.window_size,
            timeout_ms: protocol::duration_to_ms(self.params.timeout),
            max_retransmits: self.params.max_retransmits,
            expiry_ms: protocol::duration_to_ms(self.params.session_expiry),
        };
        codec.encode(&msg, &mut self.scratch)?;
        link::transmit(link, &self.scratch)?;
        self.phase = SendPhase::Starting;
        self.arm_retransmit(now);
        self.emit_window(link);
        Ok(())
    }

    fn arm_retransmit(&mut self, now: Instant) {
        self.retransmit_at = Some(now + self.params.retransmit_interval());
    }

    /// Emits every block of the current window in ascending block-number
    /// order. A failed block send is transient: the rest of the window still
    /// goes out and the retransmit timer recovers whatever the link dropped.
    fn emit_window(&mut self, link: &dyn DatagramLink) {
        let n = self.blocks_in_window();
        for idx in 0..n {
            self.emit_block(link, idx);
        }
        self.phase = if self.window_has_last() {
            SendPhase::Draining
        } else {
            SendPhase::Sending
        };
    }

    fn emit_block(&mut self, link: &dyn DatagramLink, window_index: u16) {
        let bs = self.block_size();
        let start = self.window_base + window_index as usize * bs;
        let end = (start + bs).min(self.object.len());
        let block = self.first_block.advanced_by(window_index, self.params.ring());
        let resume = self.resume_flag_pending && window_index == 0;
        let frame = DataFrame {
            session_id: self.id,
            block,
            resume,
            last: end == self.object.len(),
            payload: &self.object[start..end],
        };
        frame.encode(&mut self.scratch);
        debug!(
            "sending block {} of session {} ({} bytes)",
            block,
            self.id,
            end - start
        );
        if let Err(err) = link::transmit(link, &self.scratch) {
            warn!("block {} of session {} not sent: {}", block, self.id, err);
        }
        if resume {
            self.resume_flag_pending = false;
        }
    }

    /// Consumes one window acknowledgement.
    pub fn on_ack(
        &mut self,
        ack: &AckFrame<'_>,
        link: &dyn DatagramLink,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if !matches!(self.phase, SendPhase::Sending | SendPhase::Draining) {
            return;
        }
        if ack.error != 0 {
            let err = TransportError::from_wire(ack.error);
            warn!("peer failed session {}: {}", self.id, err);
            self.fail_peer(err, events);
            return;
        }
        if ack.window_start != self.first_block {
            // Stale ACK from a window already advanced past; the timer is
            // deliberately left running.
            debug!(
                "dropping stale ack for session {} (window {}, expected {})",
                self.id, ack.window_start, self.first_block
            );
            return;
        }
        self.retransmit_at = None;
        if ack.missing.is_empty() {
            self.advance_window(link, events, now);
        } else {
            self.retransmit_missing(ack.missing, link);
            self.arm_retransmit(now);
        }
    }

    fn advance_window(
        &mut self,
        link: &dyn DatagramLink,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        let ws = self.params.window_size;
        self.first_block = self.first_block.advanced_by(ws, self.params.ring());
        self.window_base += ws as usize * self.block_size();
        if self.window_base >= self.object.len() {
            self.phase = SendPhase::Complete;
            debug!("send session {} complete", self.id);
            events.push_back(TransferEvent::SendComplete(self.id));
            return;
        }
        self.retries_left = self.params.max_retransmits;
        self.arm_retransmit(now);
        self.emit_window(link);
    }

    /// Re-emits exactly the blocks the receiver flagged as missing. The
    /// window base is unchanged; only a full-window ACK advances it.
    fn retransmit_missing(&mut self, missing: &[u8], link: &dyn DatagramLink) {
        let ring = self.params.ring();
        let in_window = self.blocks_in_window();
        for bit in bitmap::wire_ones(missing) {
            if bit >= ring as usize {
                continue;
            }
            let idx = BlockNumber(bit as u16).offset_from(self.first_block, ring);
            if idx < in_window {
                self.emit_block(link, idx);
            }
        }
    }

    /// Drives the retransmit and expiry deadlines. Call whenever
    /// `next_wakeup` comes due; a late call is harmless.
    pub fn poll(
        &mut self,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        match self.phase {
            SendPhase::Failed(TransportError::TimedOut) => {
                // Lingering for resume; the expiry budget still applies.
                if now >= self.expires_at {
                    self.expire(link, codec, events);
                }
                return;
            }
            _ if self.phase.is_terminal() => return,
            _ => {}
        }
        if now >= self.expires_at {
            self.expire(link, codec, events);
            return;
        }
        if let Some(at) = self.retransmit_at {
            if now >= at {
                self.on_retransmit_timer(link, events, now);
            }
        }
    }

    fn expire(
        &mut self,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        events: &mut VecDeque<TransferEvent>,
    ) {
        warn!("send session {} exceeded its expiry budget", self.id);
        self.retransmit_at = None;
        self.send_abort(link, codec, TransportError::Expired.wire_code());
        self.phase = SendPhase::Failed(TransportError::Expired);
        events.push_back(TransferEvent::SendFailed(self.id, TransportError::Expired));
    }

    fn on_retransmit_timer(
        &mut self,
        link: &dyn DatagramLink,
        events: &mut VecDeque<TransferEvent>,
        now: Instant,
    ) {
        if self.retries_left == 0 {
            warn!(
                "send session {} timed out after {} window retransmits",
                self.id, self.params.max_retransmits
            );
            self.retransmit_at = None;
            self.phase = SendPhase::Failed(TransportError::TimedOut);
            events.push_back(TransferEvent::SendTimedOut(self.id));
            return;
        }
        self.retries_left -= 1;
        debug!(
            "retransmitting window {} of session {} ({} retries left)",
            self.first_block, self.id, self.retries_left
        );
        self.arm_retransmit(now);
        self.emit_window(link);
    }

    /// Revives a session that failed with `TimedOut`. The RESUME control
    /// carries the window base; the first block out again carries the RESUME
    /// flag. No START is re-sent; the receiver still holds the parameters.
    pub fn resume(
        &mut self,
        link: &dyn DatagramLink,
        codec: &dyn ControlCodec,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.phase != SendPhase::Failed(TransportError::TimedOut) {
            return Err(TransportError::SessionInProgress);
        }
        let msg = ControlMessage::Resume {
            session_id: self.id,
            offset: self.window_base as u64,
        };
        codec.encode(&msg, &mut self.scratch)?;
        link::transmit(link, &self.scratch)?;
        debug!(
            "resuming session {} from offset {}",
            self.id, self.window_base
        );
        self.retries_left = self.params.max_retransmits;
        self.resume_flag_pending = true;
        self.arm_retransmit(now);
        self.emit_window(link);
        Ok(())
    }

    /// Synchronous teardown: cancels the timer, emits ABORT best-effort.
    pub fn abort(&mut self, link: &dyn DatagramLink, codec: &dyn ControlCodec, code: u8) {
        self.retransmit_at = None;
        self.send_abort(link, codec, code);
        self.phase = SendPhase::Aborted;
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

    /// Terminal failure reported by the peer (ACK error byte, control ACK,
    /// or inbound ABORT).
    pub fn fail_peer(&mut self, err: TransportError, events: &mut VecDeque<TransferEvent>) {
        self.retransmit_at = None;
        self.phase = SendPhase::Failed(err);
        events.push_back(TransferEvent::SendFailed(self.id, err));
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.phase {
            SendPhase::Failed(TransportError::TimedOut) => Some(self.expires_at),
            _ if self.phase.is_terminal() => None,
            _ => match self.retransmit_at {
                Some(at) => Some(at.min(self.expires_at)),
                None => Some(self.expires_at),
            },
        }
    }
}
