// Fixed byte vectors for the on-wire frame layout. These pin the exact
// encoding so codec refactors cannot silently change what peers see.
use bytes::Bytes;
use quill_wire::{Command, Frame, FRAME_TYPE_MESSAGE, MessageFrame, MessageId};

#[test]
fn response_frame_bytes() {
    let frame = Frame::Response(Bytes::from_static(b"OK"));
    let expected: &[u8] = &[
        0x00, 0x00, 0x00, 0x06, // length = type + payload
        0x00, 0x00, 0x00, 0x00, // frame type 0
        b'O', b'K',
    ];
    assert_eq!(frame.encode().expect("encode").as_ref(), expected);
}

#[test]
fn message_frame_bytes() {
    let message = MessageFrame {
        timestamp: 0x0102_0304_0506_0708,
        attempts: 2,
        id: MessageId(*b"0123456789abcdef"),
        body: Bytes::from_static(b"hi"),
    };
    let encoded = Frame::Message(message.clone()).encode().expect("encode");
    // length = 4 (type) + 8 + 2 + 16 + 2
    assert_eq!(&encoded[..4], &32u32.to_be_bytes());
    assert_eq!(&encoded[4..8], &FRAME_TYPE_MESSAGE.to_be_bytes());
    assert_eq!(&encoded[8..16], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    assert_eq!(&encoded[16..18], &[0x00, 0x02]);
    assert_eq!(&encoded[18..34], b"0123456789abcdef");
    assert_eq!(&encoded[34..], b"hi");

    let decoded = Frame::decode(FRAME_TYPE_MESSAGE, encoded.slice(8..)).expect("decode");
    assert_eq!(decoded, Frame::Message(message));
}

#[test]
fn identify_command_bytes() {
    let command = Command::Identify {
        body: Bytes::from_static(b"{}"),
    };
    let encoded = command.encode().expect("encode");
    assert_eq!(&encoded[..9], b"IDENTIFY\n");
    assert_eq!(&encoded[9..13], &2u32.to_be_bytes());
    assert_eq!(&encoded[13..], b"{}");
}
