//! Owns the session tables and routes every inbound datagram to the right
//! session, admitting new receive sessions on inbound START.

use crate::TransferEvent;
use crate::control::{ControlCodec, ControlMessage};
use crate::error::TransportError;
use crate::frame::{self, AckFrame, DataFrame};
use crate::link::{self, DatagramLink, ReceiveHandler};
use crate::protocol::{DATA_HEADER_LEN, IdParity, SessionId, SessionParams};
use crate::receive::RecvSession;
use crate::send::{SendPhase, SendSession};
use rand::RngCore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Parameters applied to outbound sessions.
    pub params: SessionParams,
    pub max_send_sessions: usize,
    pub max_recv_sessions: usize,
    /// Half of the id space this context allocates from; the peer must use
    /// the opposite parity.
    pub parity: IdParity,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            params: SessionParams::default(),
            max_send_sessions: 4,
            max_recv_sessions: 4,
            parity: IdParity::Odd,
        }
    }
}

/// One transport endpoint over one link connection.
///
/// Every method takes `&mut self`: inbound datagrams, deadline ticks, and
/// public-API calls all mutate session state on one logical execution
/// context. A multi-threaded host serializes the three event sources through
/// a mutex around the context.
pub struct Context {
    link: Arc<dyn DatagramLink>,
    codec: Box<dyn ControlCodec>,
    handler: Option<Box<dyn ReceiveHandler>>,
    send_sessions: Vec<Option<SendSession>>,
    recv_sessions: Vec<Option<RecvSession>>,
    events: VecDeque<TransferEvent>,
    defaults: SessionParams,
    parity: IdParity,
    next_id: u16,
    scratch: Vec<u8>,
}

impl Context {
    pub fn new(
        link: Arc<dyn DatagramLink>,
        codec: Box<dyn ControlCodec>,
        config: Config,
        rng: &mut dyn RngCore,
    ) -> Result<Self, TransportError> {
        config.params.validate()?;
        let next_id = config.parity.align(rng.next_u32() as u16);
        Ok(Self {
            link,
            codec,
            handler: None,
            send_sessions: (0..config.max_send_sessions).map(|_| None).collect(),
            recv_sessions: (0..config.max_recv_sessions).map(|_| None).collect(),
            events: VecDeque::new(),
            defaults: config.params,
            parity: config.parity,
            next_id,
            scratch: Vec::new(),
        })
    }

    /// Installs the application sink for received object bytes. Sessions are
    /// admitted and buffer blocks without one, but a completed window is
    /// neither acknowledged nor delivered until a handler is present.
    pub fn set_receive_handler(&mut self, handler: Box<dyn ReceiveHandler>) {
        self.handler = Some(handler);
    }

    /// Starts sending `object` to the peer. On success the START control
    /// message and the first window are already on the wire.
    pub fn send(&mut self, object: Vec<u8>, now: Instant) -> Result<SessionId, TransportError> {
        let slot = self
            .send_sessions
            .iter()
            .position(Option::is_none)
            .ok_or(TransportError::MaxSessionsReached)?;
        let id = self.allocate_id();
        let mut session = SendSession::new(id, object, self.defaults, now)?;
        session.start(self.link.as_ref(), self.codec.as_ref(), now)?;
        self.send_sessions[slot] = Some(session);
        Ok(id)
    }

    /// Never hands out an id that still has live state (a lingering
    /// timed-out session keeps its id reserved until it is destroyed).
    fn allocate_id(&mut self) -> SessionId {
        loop {
            let candidate = SessionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(2);
            if self.send_index(candidate).is_none() {
                return candidate;
            }
        }
    }

    fn send_index(&self, id: SessionId) -> Option<usize> {
        self.send_sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == id))
    }

    fn recv_index(&self, id: SessionId) -> Option<usize> {
        self.recv_sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == id))
    }

    /// The link's receive path. Routes by session id: a send session consumes
    /// it as an ACK, a receive session as a data block; anything else is
    /// tried as a control message. Malformed or unroutable datagrams are
    /// dropped silently; the peer times out rather than being answered.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) {
        let Some(id) = frame::peek_session_id(bytes) else {
            debug!("dropping short datagram ({} bytes)", bytes.len());
            return;
        };
        if let Some(i) = self.send_index(id) {
            let Context {
                link,
                send_sessions,
                events,
                ..
            } = self;
            if let Some(session) = send_sessions[i].as_mut() {
                let params = *session.params();
                match AckFrame::decode(bytes, params.bitmap_wire_len(), params.ring()) {
                    Ok(ack) => session.on_ack(&ack, link.as_ref(), events, now),
                    Err(err) => debug!("dropping invalid ack for session {}: {}", id, err),
                }
            }
            self.reap_send(i);
            return;
        }
        if let Some(i) = self.recv_index(id) {
            let Context {
                link,
                recv_sessions,
                handler,
                events,
                ..
            } = self;
            if let Some(session) = recv_sessions[i].as_mut() {
                let params = *session.params();
                match DataFrame::decode(bytes, params.block_size(), params.ring()) {
                    Ok(data) => {
                        session.on_data(&data, link.as_ref(), handler.as_deref_mut(), events, now)
                    }
                    Err(err) => debug!("dropping invalid data frame for session {}: {}", id, err),
                }
            }
            self.reap_recv(i);
            return;
        }
        match self.codec.decode(bytes) {
            Ok(msg) => self.on_control(msg, now),
            Err(err) => debug!(
                "dropping unroutable datagram for session {} ({} bytes): {}",
                id,
                bytes.len(),
                err
            ),
        }
    }

    fn on_control(&mut self, msg: ControlMessage, now: Instant) {
        match msg {
            ControlMessage::Start {
                session_id,
                object_size,
                block_size,
                window_size,
                timeout_ms,
                max_retransmits,
                expiry_ms,
            } => {
                let params = block_size.checked_add(DATA_HEADER_LEN as u16).map(|mtu| {
                    SessionParams {
                        mtu,
                        window_size,
                        timeout: Duration::from_millis(u64::from(timeout_ms)),
                        max_retransmits,
                        session_expiry: Duration::from_millis(u64::from(expiry_ms)),
                    }
                });
                self.admit_start(session_id, object_size, params, now);
            }
            ControlMessage::Abort { session_id, code } => self.on_peer_abort(session_id, code),
            ControlMessage::Resume { session_id, offset } => {
                self.on_peer_resume(session_id, offset, now)
            }
            ControlMessage::Ack { session_id, code } => self.on_control_ack(session_id, code),
        }
    }

    fn admit_start(
        &mut self,
        id: SessionId,
        object_size: u64,
        params: Option<SessionParams>,
        now: Instant,
    ) {
        if self.parity.matches(id) {
            warn!("dropping START with local-parity id {}", id);
            return;
        }
        if self.recv_index(id).is_some() {
            // The link may duplicate datagrams; a second START for a live
            // session must not disturb it. The ACK timer tells the sender
            // where we are.
            debug!("dropping duplicate START for live session {}", id);
            return;
        }
        let Some(slot) = self.recv_sessions.iter().position(Option::is_none) else {
            warn!("no receive slot for session {}", id);
            self.reply_control_ack(id, TransportError::MaxSessionsReached);
            return;
        };
        let Some(params) = params else {
            self.reply_control_ack(id, TransportError::InvalidParams);
            return;
        };
        match RecvSession::admit(id, params, object_size, now) {
            Ok(session) => {
                debug!("admitted receive session {} ({} bytes)", id, object_size);
                self.recv_sessions[slot] = Some(session);
                self.events.push_back(TransferEvent::ReceiveStarted(id));
            }
            Err(err) => {
                warn!("refusing session {}: {}", id, err);
                self.reply_control_ack(id, err);
            }
        }
    }

    fn reply_control_ack(&mut self, id: SessionId, err: TransportError) {
        let msg = ControlMessage::Ack {
            session_id: id,
            code: err.wire_code(),
        };
        match self.codec.encode(&msg, &mut self.scratch) {
            Ok(()) => {
                if let Err(err) = link::transmit(self.link.as_ref(), &self.scratch) {
                    warn!("control ack for session {} not delivered: {}", id, err);
                }
            }
            Err(err) => warn!("control ack for session {} not encoded: {}", id, err),
        }
    }

    fn on_peer_abort(&mut self, id: SessionId, code: u8) {
        let err = TransportError::from_wire(code);
        if let Some(i) = self.send_index(id) {
            warn!("peer aborted send session {}: {}", id, err);
            if let Some(session) = self.send_sessions[i].as_mut() {
                session.fail_peer(err, &mut self.events);
            }
            self.send_sessions[i] = None;
        } else if let Some(i) = self.recv_index(id) {
            warn!("peer aborted receive session {}: {}", id, err);
            if let Some(session) = self.recv_sessions[i].as_mut() {
                session.fail_peer(err, &mut self.events);
            }
            self.recv_sessions[i] = None;
        } else {
            debug!("abort for unknown session {}", id);
        }
    }

    fn on_peer_resume(&mut self, id: SessionId, offset: u64, now: Instant) {
        if let Some(i) = self.recv_index(id) {
            let Context {
                link,
                codec,
                recv_sessions,
                events,
                ..
            } = self;
            if let Some(session) = recv_sessions[i].as_mut() {
                session.on_resume(offset, link.as_ref(), codec.as_ref(), events, now);
            }
            self.reap_recv(i);
        } else {
            debug!("resume for unknown session {}", id);
        }
    }

    fn on_control_ack(&mut self, id: SessionId, code: u8) {
        if code == 0 {
            return;
        }
        if let Some(i) = self.send_index(id) {
            let err = TransportError::from_wire(code);
            warn!("peer refused session {}: {}", id, err);
            if let Some(session) = self.send_sessions[i].as_mut() {
                session.fail_peer(err, &mut self.events);
            }
            self.send_sessions[i] = None;
        } else {
            debug!("control ack for unknown session {}", id);
        }
    }

    /// Fires every due retransmit, ACK, and expiry deadline. Call when
    /// `next_wakeup` comes due; late or early calls are harmless.
    pub fn poll(&mut self, now: Instant) {
        for i in 0..self.send_sessions.len() {
            let Context {
                link,
                codec,
                send_sessions,
                events,
                ..
            } = self;
            if let Some(session) = send_sessions[i].as_mut() {
                session.poll(link.as_ref(), codec.as_ref(), events, now);
            }
            self.reap_send(i);
        }
        for i in 0..self.recv_sessions.len() {
            let Context {
                link,
                codec,
                recv_sessions,
                handler,
                events,
                ..
            } = self;
            if let Some(session) = recv_sessions[i].as_mut() {
                session.poll(
                    link.as_ref(),
                    codec.as_ref(),
                    handler.as_deref_mut(),
                    events,
                    now,
                );
            }
            self.reap_recv(i);
        }
    }

    /// Earliest deadline across all sessions, clamped to `now`.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        let send = self.send_sessions.iter().flatten().filter_map(SendSession::next_wakeup);
        let recv = self.recv_sessions.iter().flatten().filter_map(RecvSession::next_wakeup);
        send.chain(recv).min().map(|at| at.max(now))
    }

    /// Drains one lifecycle event.
    pub fn poll_event(&mut self) -> Option<TransferEvent> {
        self.events.pop_front()
    }

    /// Synchronously tears down a session, emitting ABORT best-effort.
    pub fn abort(&mut self, id: SessionId, code: u8) -> Result<(), TransportError> {
        if let Some(i) = self.send_index(id) {
            let Context {
                link,
                codec,
                send_sessions,
                ..
            } = self;
            if let Some(session) = send_sessions[i].as_mut() {
                session.abort(link.as_ref(), codec.as_ref(), code);
            }
            self.send_sessions[i] = None;
            return Ok(());
        }
        if let Some(i) = self.recv_index(id) {
            let Context {
                link,
                codec,
                recv_sessions,
                ..
            } = self;
            if let Some(session) = recv_sessions[i].as_mut() {
                session.abort(link.as_ref(), codec.as_ref(), code);
            }
            self.recv_sessions[i] = None;
            return Ok(());
        }
        Err(TransportError::SessionNotFound)
    }

    /// Revives a send session that failed with `TimedOut`.
    pub fn resume(&mut self, id: SessionId, now: Instant) -> Result<(), TransportError> {
        let Some(i) = self.send_index(id) else {
            return Err(TransportError::SessionNotFound);
        };
        let Context {
            link,
            codec,
            send_sessions,
            ..
        } = self;
        match send_sessions[i].as_mut() {
            Some(session) => session.resume(link.as_ref(), codec.as_ref(), now),
            None => Err(TransportError::SessionNotFound),
        }
    }

    /// Destroys the context's session state. Refused while any session is
    /// still in a non-terminal phase.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        let busy = self
            .send_sessions
            .iter()
            .flatten()
            .any(|s| !s.phase().is_terminal())
            || self
                .recv_sessions
                .iter()
                .flatten()
                .any(|s| !s.phase().is_terminal());
        if busy {
            return Err(TransportError::SessionInProgress);
        }
        self.send_sessions.iter_mut().for_each(|s| *s = None);
        self.recv_sessions.iter_mut().for_each(|s| *s = None);
        Ok(())
    }

    pub fn send_session(&self, id: SessionId) -> Option<&SendSession> {
        self.send_index(id)
            .and_then(|i| self.send_sessions[i].as_ref())
    }

    pub fn recv_session(&self, id: SessionId) -> Option<&RecvSession> {
        self.recv_index(id)
            .and_then(|i| self.recv_sessions[i].as_ref())
    }

    fn reap_send(&mut self, i: usize) {
        let destroy = self.send_sessions[i].as_ref().is_some_and(|s| match s.phase() {
            // Timed-out sessions linger so resume() can find them; the
            // expiry deadline bounds how long.
            SendPhase::Failed(TransportError::TimedOut) => false,
            phase => phase.is_terminal(),
        });
        if destroy {
            self.send_sessions[i] = None;
        }
    }

    fn reap_recv(&mut self, i: usize) {
        let destroy = self.recv_sessions[i]
            .as_ref()
            .is_some_and(|s| s.phase().is_terminal());
        if destroy {
            self.recv_sessions[i] = None;
        }
    }
}
