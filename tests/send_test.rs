use blocklink::control::{ControlCodec, ControlMessage, MsgpackCodec};
use blocklink::frame::{AckFrame, DataFrame};
use blocklink::protocol::{BlockNumber, SessionId, SessionParams};
use blocklink::send::{SendPhase, SendSession};
use blocklink::{DatagramLink, TransferEvent, TransportError};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct TestLink {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl DatagramLink for TestLink {
    fn send_datagram(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(bytes.len())
    }
}

impl TestLink {
    fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

fn params() -> SessionParams {
    SessionParams {
        mtu: 105,
        window_size: 4,
        timeout: Duration::from_millis(50),
        max_retransmits: 2,
        session_expiry: Duration::from_secs(10),
    }
}

fn object(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn full_ack(id: SessionId, window_start: u16) -> AckFrame<'static> {
    AckFrame {
        session_id: id,
        error: 0,
        window_start: BlockNumber(window_start),
        missing: &[],
    }
}

fn started_session(len: usize, link: &TestLink, now: Instant) -> SendSession {
    let mut session = SendSession::new(SessionId(7), object(len), params(), now).unwrap();
    session.start(link, &MsgpackCodec, now).unwrap();
    session
}

#[test]
fn test_start_emits_start_control_and_first_window() {
    let link = TestLink::default();
    let now = Instant::now();
    let session = started_session(350, &link, now);
    assert_eq!(session.phase(), SendPhase::Draining);

    let sent = link.drain();
    assert_eq!(sent.len(), 5);
    match MsgpackCodec.decode(&sent[0]).unwrap() {
        ControlMessage::Start {
            session_id,
            object_size,
            block_size,
            window_size,
            ..
        } => {
            assert_eq!(session_id, SessionId(7));
            assert_eq!(object_size, 350);
            assert_eq!(block_size, 100);
            assert_eq!(window_size, 4);
        }
        other => panic!("expected START, got {other:?}"),
    }
    for (i, datagram) in sent[1..].iter().enumerate() {
        let frame = DataFrame::decode(datagram, 100, 8).unwrap();
        assert_eq!(frame.block, BlockNumber(i as u16));
        assert_eq!(frame.last, i == 3);
        assert_eq!(frame.payload.len(), if i == 3 { 50 } else { 100 });
        assert!(!frame.resume);
    }
}

#[test]
fn test_empty_object_is_rejected() {
    assert_eq!(
        SendSession::new(SessionId(7), Vec::new(), params(), Instant::now()).err(),
        Some(TransportError::InvalidParams)
    );
}

#[test]
fn test_full_window_ack_completes_single_window_object() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    session.on_ack(&full_ack(SessionId(7), 0), &link, &mut events, now);
    assert_eq!(session.phase(), SendPhase::Complete);
    assert_eq!(
        events.pop_front(),
        Some(TransferEvent::SendComplete(SessionId(7)))
    );
    assert!(link.drain().is_empty());
    assert_eq!(session.next_wakeup(), None);
}

#[test]
fn test_full_window_ack_advances_to_next_window() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(1000, &link, now);
    assert_eq!(session.phase(), SendPhase::Sending);
    link.drain();

    session.on_ack(&full_ack(SessionId(7), 0), &link, &mut events, now);
    assert_eq!(session.phase(), SendPhase::Sending);
    assert_eq!(session.window_base(), 400);
    let sent = link.drain();
    assert_eq!(sent.len(), 4);
    for (i, datagram) in sent.iter().enumerate() {
        let frame = DataFrame::decode(datagram, 100, 8).unwrap();
        assert_eq!(frame.block, BlockNumber(4 + i as u16));
    }

    // Third window wraps the block numbering back to zero.
    session.on_ack(&full_ack(SessionId(7), 4), &link, &mut events, now);
    assert_eq!(session.window_base(), 800);
    assert_eq!(session.phase(), SendPhase::Draining);
    let sent = link.drain();
    assert_eq!(sent.len(), 2);
    let frame = DataFrame::decode(&sent[0], 100, 8).unwrap();
    assert_eq!(frame.block, BlockNumber(0));
    let frame = DataFrame::decode(&sent[1], 100, 8).unwrap();
    assert_eq!(frame.block, BlockNumber(1));
    assert!(frame.last);

    session.on_ack(&full_ack(SessionId(7), 0), &link, &mut events, now);
    assert_eq!(session.phase(), SendPhase::Complete);
    assert!(events.iter().any(|e| *e == TransferEvent::SendComplete(SessionId(7))));
}

#[test]
fn test_selective_ack_retransmits_only_missing_blocks() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    // Block 1 missing.
    let ack = AckFrame {
        session_id: SessionId(7),
        error: 0,
        window_start: BlockNumber(0),
        missing: &[0b0000_0010],
    };
    session.on_ack(&ack, &link, &mut events, now);
    assert_eq!(session.phase(), SendPhase::Draining);
    assert_eq!(session.window_base(), 0);

    let sent = link.drain();
    assert_eq!(sent.len(), 1);
    let frame = DataFrame::decode(&sent[0], 100, 8).unwrap();
    assert_eq!(frame.block, BlockNumber(1));
    assert!(!frame.last);
    assert_eq!(frame.payload.len(), 100);
    assert!(events.is_empty());
}

#[test]
fn test_selective_ack_sets_last_flag_on_terminal_block() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    let ack = AckFrame {
        session_id: SessionId(7),
        error: 0,
        window_start: BlockNumber(0),
        missing: &[0b0000_1000],
    };
    session.on_ack(&ack, &link, &mut events, now);
    let sent = link.drain();
    assert_eq!(sent.len(), 1);
    let frame = DataFrame::decode(&sent[0], 100, 8).unwrap();
    assert_eq!(frame.block, BlockNumber(3));
    assert!(frame.last);
    assert_eq!(frame.payload.len(), 50);
}

#[test]
fn test_stale_ack_is_dropped_silently() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(1000, &link, now);
    link.drain();

    // Advance past window 0, then replay its ACK.
    session.on_ack(&full_ack(SessionId(7), 0), &link, &mut events, now);
    assert_eq!(session.window_base(), 400);
    link.drain();
    let wakeup_before = session.next_wakeup();

    session.on_ack(&full_ack(SessionId(7), 0), &link, &mut events, now);
    assert_eq!(session.window_base(), 400, "duplicate ACK must not advance");
    assert!(link.drain().is_empty());
    assert_eq!(session.next_wakeup(), wakeup_before, "timer must be untouched");
}

#[test]
fn test_retransmit_timer_re_emits_whole_window() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();
    assert_eq!(session.retries_left(), 2);

    let fire = now + Duration::from_millis(100);
    session.poll(&link, &MsgpackCodec, &mut events, fire);
    assert_eq!(session.retries_left(), 1);
    let sent = link.drain();
    assert_eq!(sent.len(), 4);
    for (i, datagram) in sent.iter().enumerate() {
        let frame = DataFrame::decode(datagram, 100, 8).unwrap();
        assert_eq!(frame.block, BlockNumber(i as u16));
        assert!(!frame.resume, "ordinary retransmits never carry RESUME");
    }
}

#[test]
fn test_retry_budget_exhaustion_times_out() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    let mut at = now;
    for _ in 0..2 {
        at += Duration::from_millis(100);
        session.poll(&link, &MsgpackCodec, &mut events, at);
        assert!(!session.phase().is_terminal());
    }
    // Initial emission plus max_retransmits copies have now been sent.
    at += Duration::from_millis(100);
    session.poll(&link, &MsgpackCodec, &mut events, at);
    assert_eq!(session.phase(), SendPhase::Failed(TransportError::TimedOut));
    assert_eq!(
        events.pop_front(),
        Some(TransferEvent::SendTimedOut(SessionId(7)))
    );
    // No further window copies after the failure.
    assert!(link.drain().len() == 8);
}

#[test]
fn test_resume_after_timeout() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);

    let mut at = now;
    for _ in 0..3 {
        at += Duration::from_millis(100);
        session.poll(&link, &MsgpackCodec, &mut events, at);
    }
    assert_eq!(session.phase(), SendPhase::Failed(TransportError::TimedOut));
    link.drain();
    events.clear();

    session.resume(&link, &MsgpackCodec, at).unwrap();
    assert_eq!(session.phase(), SendPhase::Draining);
    assert_eq!(session.retries_left(), 2);

    let sent = link.drain();
    assert_eq!(sent.len(), 5);
    match MsgpackCodec.decode(&sent[0]).unwrap() {
        ControlMessage::Resume { session_id, offset } => {
            assert_eq!(session_id, SessionId(7));
            assert_eq!(offset, 0);
        }
        other => panic!("expected RESUME, got {other:?}"),
    }
    // RESUME flag rides on the first block only.
    let first = DataFrame::decode(&sent[1], 100, 8).unwrap();
    assert!(first.resume);
    for datagram in &sent[2..] {
        assert!(!DataFrame::decode(datagram, 100, 8).unwrap().resume);
    }
}

#[test]
fn test_resume_requires_timed_out_phase() {
    let link = TestLink::default();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    assert_eq!(
        session.resume(&link, &MsgpackCodec, now),
        Err(TransportError::SessionInProgress)
    );
}

#[test]
fn test_peer_error_ack_fails_session() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    let ack = AckFrame {
        session_id: SessionId(7),
        error: TransportError::NoMemory.wire_code(),
        window_start: BlockNumber(0),
        missing: &[],
    };
    session.on_ack(&ack, &link, &mut events, now);
    assert_eq!(session.phase(), SendPhase::Failed(TransportError::NoMemory));
    assert_eq!(
        events.pop_front(),
        Some(TransferEvent::SendFailed(SessionId(7), TransportError::NoMemory))
    );
}

#[test]
fn test_session_expiry_fails_and_emits_abort() {
    let link = TestLink::default();
    let mut events = VecDeque::new();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    session.poll(&link, &MsgpackCodec, &mut events, now + Duration::from_secs(11));
    assert_eq!(session.phase(), SendPhase::Failed(TransportError::Expired));
    assert_eq!(
        events.pop_front(),
        Some(TransferEvent::SendFailed(SessionId(7), TransportError::Expired))
    );
    let sent = link.drain();
    assert_eq!(sent.len(), 1);
    match MsgpackCodec.decode(&sent[0]).unwrap() {
        ControlMessage::Abort { session_id, code } => {
            assert_eq!(session_id, SessionId(7));
            assert_eq!(TransportError::from_wire(code), TransportError::Expired);
        }
        other => panic!("expected ABORT, got {other:?}"),
    }
}

#[test]
fn test_abort_emits_abort_control() {
    let link = TestLink::default();
    let now = Instant::now();
    let mut session = started_session(350, &link, now);
    link.drain();

    session.abort(&link, &MsgpackCodec, 0);
    assert_eq!(session.phase(), SendPhase::Aborted);
    assert_eq!(session.next_wakeup(), None);
    let sent = link.drain();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        MsgpackCodec.decode(&sent[0]).unwrap(),
        ControlMessage::Abort { .. }
    ));
}
