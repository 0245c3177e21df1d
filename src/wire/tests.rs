use std::num::NonZeroU32;

use super::{decode_message, encode_message, frame_size, padding_to};
use crate::message::Message;
use crate::object_path::ObjectPath;
use crate::protocol::Endianness;
use crate::signature::Signature;
use crate::value::{Array, Dict, Value};

fn serial(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).expect("nonzero serial")
}

#[test]
fn padding() {
    assert_eq!(padding_to(0, 8), 0);
    assert_eq!(padding_to(1, 8), 7);
    assert_eq!(padding_to(8, 8), 0);
    assert_eq!(padding_to(13, 4), 3);
}

#[test]
fn golden_method_return() {
    let m = Message::method_return(serial(1)).with_arg(42u32);
    let frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();

    #[rustfmt::skip]
    let expected: &[u8] = &[
        // endianness, type, flags, version
        b'l', 2, 0, 1,
        // body length
        4, 0, 0, 0,
        // serial
        2, 0, 0, 0,
        // header field array, 15 bytes
        15, 0, 0, 0,
        // REPLY_SERIAL (5): g "u", value 1
        5, 1, b'u', 0, 1, 0, 0, 0,
        // SIGNATURE (8): g "g", value "u"
        8, 1, b'g', 0, 1, b'u', 0,
        // padding to 8
        0,
        // body
        42, 0, 0, 0,
    ];

    assert_eq!(frame, expected);

    let fixed: &[u8; 16] = frame[..16].try_into().unwrap();
    assert_eq!(frame_size(fixed).unwrap(), frame.len());

    let decoded = decode_message(&frame, &mut Vec::new()).unwrap();
    assert_eq!(decoded.serial(), Some(serial(2)));
    assert_eq!(decoded.reply_serial(), Some(serial(1)));
    assert_eq!(decoded.body(), &[Value::Uint32(42)]);
}

#[test]
fn round_trip_nested_body() {
    let mut dict = Dict::new(Signature::STRING, Signature::VARIANT);
    dict.insert(
        Value::from("age"),
        Value::Variant(Box::new(Value::Uint32(7))),
    );
    dict.insert(
        Value::from("name"),
        Value::Variant(Box::new(Value::from("ziggy"))),
    );

    let mut longs = Array::new(Signature::new_const(b"x"));
    longs.push(Value::Int64(-1));
    longs.push(Value::Int64(i64::MAX));

    let path = ObjectPath::new_const(b"/com/example/Object");

    let body = vec![
        Value::Byte(0xfe),
        Value::Dict(dict),
        Value::Struct(vec![
            Value::Bool(true),
            Value::Double(1.5),
            Value::from(path),
        ]),
        Value::Array(longs),
        Value::from("trailing"),
        Value::Uint16(513),
    ];

    for endianness in [Endianness::LITTLE, Endianness::BIG] {
        let m = Message::method_call(path, "Frobnicate")
            .with_interface("com.example.Iface")
            .with_destination("com.example.Dest")
            .with_body(body.clone());

        assert_eq!(m.signature().as_str(), "ya{sv}(bdo)axsq");

        let frame = encode_message(&m, serial(9), endianness).unwrap();
        let decoded = decode_message(&frame, &mut Vec::new()).unwrap();

        assert_eq!(decoded.body(), &body[..]);
        assert_eq!(decoded.path().map(ObjectPath::as_str), Some("/com/example/Object"));
        assert_eq!(decoded.member(), Some("Frobnicate"));
        assert_eq!(decoded.interface(), Some("com.example.Iface"));
        assert_eq!(decoded.destination(), Some("com.example.Dest"));
    }
}

#[test]
fn empty_containers_round_trip() {
    let body = vec![
        Value::Array(Array::new(Signature::new_const(b"a{ss}"))),
        Value::Dict(Dict::new(Signature::STRING, Signature::UINT32)),
    ];

    let m = Message::signal(ObjectPath::ROOT, "com.example.Iface", "Pulse")
        .with_body(body.clone());

    let frame = encode_message(&m, serial(3), Endianness::LITTLE).unwrap();
    let decoded = decode_message(&frame, &mut Vec::new()).unwrap();
    assert_eq!(decoded.body(), &body[..]);
    assert_eq!(decoded.signature().as_str(), "aa{ss}a{su}");
}

#[test]
fn signal_requires_interface() {
    let m = Message {
        kind: crate::message::MessageKind::Signal {
            path: ObjectPath::ROOT.to_owned(),
            member: "Pulse".into(),
        },
        serial: None,
        flags: crate::protocol::Flags::EMPTY,
        interface: None,
        destination: None,
        sender: None,
        body: Vec::new(),
        fds: Vec::new(),
    };

    assert!(encode_message(&m, serial(1), Endianness::LITTLE).is_err());
}

#[test]
fn truncated_frames_are_rejected() {
    let m = Message::method_return(serial(1)).with_arg("payload");
    let frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();

    for cut in [frame.len() - 1, frame.len() - 4, 17] {
        assert!(decode_message(&frame[..cut], &mut Vec::new()).is_err(), "{cut}");
    }
}

#[test]
fn invalid_utf8_is_rejected() {
    let m = Message::method_return(serial(1)).with_arg("abcd");
    let mut frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();

    // Corrupt the string payload at the end of the frame.
    let at = frame.len() - 3;
    frame[at] = 0xff;

    assert!(decode_message(&frame, &mut Vec::new()).is_err());
}

#[test]
fn invalid_boolean_is_rejected() {
    let m = Message::method_return(serial(1)).with_arg(true);
    let mut frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();

    let at = frame.len() - 4;
    frame[at] = 2;

    assert!(decode_message(&frame, &mut Vec::new()).is_err());
}

#[test]
fn missing_required_field_is_rejected() {
    // A method return whose type byte claims to be a method call is missing
    // the required PATH and MEMBER fields.
    let m = Message::method_return(serial(1));
    let mut frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();
    frame[1] = 1;

    assert!(decode_message(&frame, &mut Vec::new()).is_err());
}

#[test]
fn oversized_message_is_rejected() {
    let m = Message::method_return(serial(1));
    let mut frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();

    // Claim a body just past the 128 MiB limit.
    frame[4..8].copy_from_slice(&(128 * 1024 * 1024u32).to_le_bytes());

    let fixed: &[u8; 16] = frame[..16].try_into().unwrap();
    assert!(frame_size(fixed).is_err());
}

#[test]
fn zero_serial_is_rejected() {
    let m = Message::method_return(serial(1));
    let mut frame = encode_message(&m, serial(2), Endianness::LITTLE).unwrap();
    frame[8..12].copy_from_slice(&[0, 0, 0, 0]);

    let fixed: &[u8; 16] = frame[..16].try_into().unwrap();
    assert!(frame_size(fixed).is_err());
}

#[test]
fn array_element_mismatch_is_rejected() {
    let mut array = Array::new(Signature::UINT32);
    array.push(Value::from("oops"));

    let m = Message::method_return(serial(1)).with_arg(Value::Array(array));
    assert!(encode_message(&m, serial(2), Endianness::LITTLE).is_err());
}
