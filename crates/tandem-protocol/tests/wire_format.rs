//! Byte-level checks of the public wire format.

use std::sync::Arc;

use tandem_protocol::{
    CodecRegistry, Cursor, Decode, Decoded, Encode, PeerId, SignalingEnvelope, SignalingMessage,
    Tagged, WireCodec, WireError, WireMessage, Writer,
};

fn join(source: &str, target: &str) -> WireMessage {
    SignalingEnvelope::new(PeerId::new(source), PeerId::new(target), SignalingMessage::PeerJoin)
        .into()
}

#[test]
fn signaling_envelope_layout() {
    let bytes = join("a", "b").to_bytes();
    assert_eq!(
        bytes,
        vec![
            0x01, 0x00, // signaling tag
            0x01, 0x00, 0x00, 0x00, b'a', // source
            0x01, 0x00, 0x00, 0x00, b'b', // target
            0x05, // peer-join
        ]
    );
}

#[test]
fn batch_layout_has_offset_table_with_sentinel() {
    let one = join("a", "b").to_bytes();
    let batch = WireMessage::Batch(vec![join("a", "b"), join("a", "b")]).to_bytes();

    let mut cur = Cursor::new(&batch);
    assert_eq!(cur.read::<u16>().unwrap(), 0x0003);
    assert_eq!(cur.read::<u32>().unwrap(), 2);
    let offsets: Vec<u32> = (0..3).map(|_| cur.read::<u32>().unwrap()).collect();
    let len = one.len() as u32;
    assert_eq!(offsets, vec![0, len, 2 * len]);
    assert_eq!(cur.remaining(), 2 * one.len());
}

#[test]
fn unknown_signaling_kind_is_an_error_not_a_panic() {
    let mut bytes = join("a", "b").to_bytes();
    *bytes.last_mut().unwrap() = 0x7f;
    let err = WireMessage::decode(&mut Cursor::new(&bytes)).unwrap_err();
    assert_eq!(err, WireError::UnknownTag(0x7f));
}

#[derive(Debug, PartialEq)]
struct Heartbeat {
    seq: u64,
}

impl Tagged for Heartbeat {
    const TAG: u16 = 0x4000;
}

impl Encode for Heartbeat {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, w: &mut Writer) {
        self.seq.encode(w);
    }
}

impl Decode for Heartbeat {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self { seq: cur.read()? })
    }
}

#[test]
fn registered_extension_survives_a_trip_through_the_codec() {
    let codec = WireCodec::with_registry(Arc::new(
        CodecRegistry::builder().typed::<Heartbeat>().build(),
    ));
    let bytes = codec.encode_value(&Heartbeat { seq: 42 }).unwrap();
    assert_eq!(&bytes[..2], &[0x00, 0x40]);

    let Decoded::Extension { value, .. } = codec.decode_message(&bytes).unwrap() else {
        panic!("expected an extension");
    };
    assert_eq!(value.downcast_ref::<Heartbeat>(), Some(&Heartbeat { seq: 42 }));
}

#[test]
fn codec_without_module_reports_unknown() {
    let sender = WireCodec::with_registry(Arc::new(
        CodecRegistry::builder().typed::<Heartbeat>().build(),
    ));
    let receiver = WireCodec::new();
    let bytes = sender.encode_value(&Heartbeat { seq: 1 }).unwrap();
    assert!(matches!(
        receiver.decode_message(&bytes).unwrap(),
        Decoded::Unknown { tag: 0x4000 }
    ));
}
