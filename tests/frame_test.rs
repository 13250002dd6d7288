use blocklink::frame::{AckFrame, DataFrame, peek_session_id};
use blocklink::protocol::{BlockNumber, SessionId};
use blocklink::TransportError;

#[test]
fn test_data_frame_roundtrip() {
    let payload = [7u8; 100];
    let frame = DataFrame {
        session_id: SessionId(0x0102),
        block: BlockNumber(5),
        resume: false,
        last: true,
        payload: &payload,
    };
    let mut wire = Vec::new();
    frame.encode(&mut wire);
    assert_eq!(wire.len(), 105);
    assert_eq!(&wire[0..2], &[0x02, 0x01]); // little-endian id
    assert_eq!(&wire[2..4], &[0x05, 0x00]);

    let decoded = DataFrame::decode(&wire, 100, 8).unwrap();
    assert_eq!(decoded, frame);
    assert_eq!(peek_session_id(&wire), Some(SessionId(0x0102)));
}

#[test]
fn test_data_frame_flags() {
    let frame = DataFrame {
        session_id: SessionId(1),
        block: BlockNumber(0),
        resume: true,
        last: false,
        payload: &[1, 2, 3],
    };
    let mut wire = Vec::new();
    frame.encode(&mut wire);
    // Reserved pattern in bits 7..5, RESUME in bit 1.
    assert_eq!(wire[4], 0b1010_0010);
    let decoded = DataFrame::decode(&wire, 10, 8).unwrap();
    assert!(decoded.resume);
    assert!(!decoded.last);
}

#[test]
fn test_data_frame_rejects_bad_reserved_bits() {
    let frame = DataFrame {
        session_id: SessionId(1),
        block: BlockNumber(0),
        resume: false,
        last: false,
        payload: &[9],
    };
    let mut wire = Vec::new();
    frame.encode(&mut wire);
    for bad in [0u8, 0b0010_0000, 0b1110_0000, 0b1010_0100] {
        let mut corrupt = wire.clone();
        corrupt[4] = bad;
        assert_eq!(
            DataFrame::decode(&corrupt, 10, 8),
            Err(TransportError::InvalidFrame),
            "flags {bad:#010b} must be rejected"
        );
    }
}

#[test]
fn test_data_frame_rejects_bad_lengths() {
    // Too short for a header plus one payload byte.
    assert!(DataFrame::decode(&[0; 5], 10, 8).is_err());
    assert!(DataFrame::decode(&[], 10, 8).is_err());

    // Payload longer than a block.
    let frame = DataFrame {
        session_id: SessionId(1),
        block: BlockNumber(0),
        resume: false,
        last: false,
        payload: &[0u8; 11],
    };
    let mut wire = Vec::new();
    frame.encode(&mut wire);
    assert_eq!(
        DataFrame::decode(&wire, 10, 8),
        Err(TransportError::InvalidFrame)
    );
}

#[test]
fn test_data_frame_rejects_block_outside_ring() {
    let frame = DataFrame {
        session_id: SessionId(1),
        block: BlockNumber(8),
        resume: false,
        last: false,
        payload: &[9],
    };
    let mut wire = Vec::new();
    frame.encode(&mut wire);
    assert_eq!(
        DataFrame::decode(&wire, 10, 8),
        Err(TransportError::InvalidFrame)
    );
}

#[test]
fn test_ack_frame_full_window_roundtrip() {
    let ack = AckFrame {
        session_id: SessionId(0xBEEF),
        error: 0,
        window_start: BlockNumber(4),
        missing: &[],
    };
    let mut wire = Vec::new();
    ack.encode(&mut wire);
    assert_eq!(wire.len(), 5);

    let decoded = AckFrame::decode(&wire, 1, 8).unwrap();
    assert_eq!(decoded, ack);
    assert!(decoded.missing.is_empty());
}

#[test]
fn test_ack_frame_selective_roundtrip() {
    let ack = AckFrame {
        session_id: SessionId(3),
        error: 0,
        window_start: BlockNumber(0),
        missing: &[0b0000_0110],
    };
    let mut wire = Vec::new();
    ack.encode(&mut wire);
    assert_eq!(wire.len(), 6);

    let decoded = AckFrame::decode(&wire, 1, 8).unwrap();
    assert_eq!(decoded, ack);
}

#[test]
fn test_ack_frame_rejects_length_mismatch() {
    // Bitmap length must be zero or exactly ceil(ring / 8) for the session.
    let ack = AckFrame {
        session_id: SessionId(3),
        error: 0,
        window_start: BlockNumber(0),
        missing: &[0xFF, 0xFF],
    };
    let mut wire = Vec::new();
    ack.encode(&mut wire);
    assert_eq!(
        AckFrame::decode(&wire, 1, 8),
        Err(TransportError::InvalidFrame)
    );
    assert!(AckFrame::decode(&wire[..4], 1, 8).is_err());
}

#[test]
fn test_ack_frame_carries_error_code() {
    let ack = AckFrame {
        session_id: SessionId(3),
        error: TransportError::Expired.wire_code(),
        window_start: BlockNumber(0),
        missing: &[],
    };
    let mut wire = Vec::new();
    ack.encode(&mut wire);
    let decoded = AckFrame::decode(&wire, 1, 8).unwrap();
    assert_eq!(TransportError::from_wire(decoded.error), TransportError::Expired);
}

#[test]
fn test_peek_session_id_needs_three_bytes() {
    assert_eq!(peek_session_id(&[]), None);
    assert_eq!(peek_session_id(&[1, 0]), None);
    assert_eq!(peek_session_id(&[1, 0, 0]), Some(SessionId(1)));
}
