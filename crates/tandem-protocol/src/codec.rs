//! The codec that turns whole messages into bytes and back.
//!
//! [`WireCodec`] knows the built-in message types directly and falls back
//! to its [`CodecRegistry`] for everything else. Inbound decoding is
//! forgiving: [`WireCodec::decode_message`] never fails on a single bad
//! element of a batch. It reports that element as [`Decoded::Malformed`]
//! and keeps going, because indexed framing tells it exactly where the
//! next element starts.
//!
//! ```text
//! bytes ─► decode_message ─► Decoded::{Signaling, Frame, Batch, Extension, Unknown, Malformed}
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::framing::IndexedReader;
use crate::registry::{CodecRegistry, DynValue};
use crate::types::{BATCH_TAG, FRAME_TAG, MAX_BATCH_DEPTH, SIGNALING_TAG};
use crate::wire::{Cursor, Decode, Encode};
use crate::{Frame, SignalingEnvelope, WireError, WireMessage};

/// The result of decoding one inbound message.
#[derive(Debug)]
pub enum Decoded {
    /// A control-plane envelope.
    Signaling(SignalingEnvelope),
    /// An application frame.
    Frame(Frame),
    /// A batch; each element decoded independently.
    Batch(Vec<Decoded>),
    /// A value handled by a registered extension module.
    Extension {
        /// The value's tag.
        tag: u16,
        /// The decoded value. Downcast to the registered type.
        value: DynValue,
    },
    /// No built-in type or module claims this tag. The message was skipped.
    Unknown {
        /// The unclaimed tag.
        tag: u16,
    },
    /// A batch element that failed to decode.
    Malformed {
        /// Position of the element inside its batch.
        index: usize,
        /// What went wrong.
        error: WireError,
    },
}

impl Decoded {
    /// Flattens batches into a single in-order list of leaf messages.
    pub fn flatten(self) -> Vec<Decoded> {
        match self {
            Self::Batch(items) => items.into_iter().flat_map(Decoded::flatten).collect(),
            other => vec![other],
        }
    }
}

/// Encodes and decodes wire messages.
///
/// Cheap to clone; the registry is shared.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    registry: Arc<CodecRegistry>,
}

impl WireCodec {
    /// A codec with no extension modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// A codec that falls back to `registry` for unknown types.
    pub fn with_registry(registry: Arc<CodecRegistry>) -> Self {
        Self { registry }
    }

    /// The extension registry.
    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    /// Encodes a built-in value.
    pub fn encode<T: Encode + ?Sized>(&self, value: &T) -> Vec<u8> {
        value.to_bytes()
    }

    /// Decodes a built-in value that must fill `bytes` exactly.
    pub fn decode<T: Decode>(&self, bytes: &[u8]) -> Result<T, WireError> {
        let mut cur = Cursor::new(bytes);
        let value = T::decode(&mut cur)?;
        if !cur.is_empty() {
            return Err(WireError::TrailingBytes(cur.remaining()));
        }
        Ok(value)
    }

    /// Encodes an extension value through the registry.
    pub fn encode_value<T: Any>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        self.registry.encode(value)
    }

    /// Decodes an extension value through the registry.
    pub fn decode_value<T: Any>(&self, bytes: &[u8]) -> Result<T, WireError> {
        let mut cur = Cursor::new(bytes);
        let value = self.registry.decode::<T>(&mut cur)?;
        if !cur.is_empty() {
            return Err(WireError::TrailingBytes(cur.remaining()));
        }
        Ok(value)
    }

    /// Encodes a top-level message.
    pub fn encode_message(&self, message: &WireMessage) -> Vec<u8> {
        message.to_bytes()
    }

    /// Decodes one top-level message.
    ///
    /// Returns `Err` only when the outermost message itself is unreadable.
    /// Failures inside a batch are reported in place, including batches
    /// nested deeper than [`MAX_BATCH_DEPTH`].
    pub fn decode_message(&self, bytes: &[u8]) -> Result<Decoded, WireError> {
        let mut cur = Cursor::new(bytes);
        let decoded = self.decode_one(&mut cur, 0)?;
        if !cur.is_empty() {
            tracing::warn!(trailing = cur.remaining(), "ignoring trailing bytes after message");
        }
        Ok(decoded)
    }

    fn decode_one(&self, cur: &mut Cursor<'_>, depth: usize) -> Result<Decoded, WireError> {
        match cur.peek_u16()? {
            SIGNALING_TAG => {
                cur.read::<u16>()?;
                Ok(Decoded::Signaling(cur.read()?))
            }
            FRAME_TAG => {
                cur.read::<u16>()?;
                Ok(Decoded::Frame(cur.read()?))
            }
            BATCH_TAG if depth >= MAX_BATCH_DEPTH => Err(WireError::TooDeep(MAX_BATCH_DEPTH)),
            BATCH_TAG => self.decode_batch(cur, depth),
            tag if self.registry.handles_tag(tag) => {
                let value = self.registry.decode_dyn(cur)?;
                Ok(Decoded::Extension { tag, value })
            }
            tag => {
                tracing::debug!(tag, "skipping message with unknown tag");
                // Consume the rest so the caller does not see trailing bytes.
                cur.take(cur.remaining())?;
                Ok(Decoded::Unknown { tag })
            }
        }
    }

    fn decode_batch(&self, cur: &mut Cursor<'_>, depth: usize) -> Result<Decoded, WireError> {
        let reader = IndexedReader::open(cur, BATCH_TAG)?;
        let mut items = Vec::with_capacity(reader.len());
        for (index, window) in reader.enumerate() {
            let item = window.and_then(|mut element| {
                let decoded = self.decode_one(&mut element, depth + 1)?;
                if !element.is_empty() {
                    return Err(WireError::TrailingBytes(element.remaining()));
                }
                Ok(decoded)
            });
            items.push(item.unwrap_or_else(|error| {
                tracing::warn!(index, %error, "dropping malformed batch element");
                Decoded::Malformed { index, error }
            }));
        }
        Ok(Decoded::Batch(items))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::framing::IndexesArray;
    use crate::wire::{Tagged, Writer};
    use crate::{PayloadCategory, PeerId, SignalingMessage};

    fn envelope() -> SignalingEnvelope {
        SignalingEnvelope::new(
            PeerId::new("alice"),
            PeerId::new("bob"),
            SignalingMessage::Offer { sdp: "v=0".into() },
        )
    }

    fn frame() -> Frame {
        Frame {
            source: PeerId::new("alice"),
            targets: BTreeSet::from([PeerId::new("bob")]),
            category: PayloadCategory::Data,
            reliable: true,
            payload: vec![1, 2, 3],
        }
    }

    /// A message whose bytes are always garbage.
    struct Garbage;

    impl Encode for Garbage {
        fn encoded_len(&self) -> usize {
            3
        }

        fn encode(&self, w: &mut Writer) {
            w.put_u16(SIGNALING_TAG);
            w.put_u8(0xff);
        }
    }

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    impl Tagged for Ping {
        const TAG: u16 = 0x2000;
    }

    impl Encode for Ping {
        fn encoded_len(&self) -> usize {
            4
        }

        fn encode(&self, w: &mut Writer) {
            self.0.encode(w);
        }
    }

    impl Decode for Ping {
        fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
            Ok(Self(cur.read()?))
        }
    }

    #[test]
    fn test_decode_message_signaling() {
        let codec = WireCodec::new();
        let bytes = codec.encode_message(&envelope().into());
        match codec.decode_message(&bytes).unwrap() {
            Decoded::Signaling(decoded) => assert_eq!(decoded, envelope()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_message_batch_keeps_order() {
        let codec = WireCodec::new();
        let batch = WireMessage::Batch(vec![frame().into(), envelope().into()]);
        let items = codec.decode_message(&codec.encode_message(&batch)).unwrap().flatten();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Decoded::Frame(f) if *f == frame()));
        assert!(matches!(&items[1], Decoded::Signaling(e) if *e == envelope()));
    }

    #[test]
    fn test_malformed_batch_element_does_not_lose_neighbours() {
        let good_a = WireMessage::from(frame());
        let good_b = WireMessage::from(envelope());
        let a = good_a.to_bytes();
        let bad = Garbage.to_bytes();
        let b = good_b.to_bytes();
        let parts: Vec<&[u8]> = vec![&a, &bad, &b];

        // Hand-assemble the indexed batch so the middle element is garbage.
        let mut w = Writer::new();
        w.put_u16(BATCH_TAG);
        w.put_u32(3);
        let mut offset = 0u32;
        w.put_u32(0);
        for part in &parts {
            offset += part.len() as u32;
            w.put_u32(offset);
        }
        for part in &parts {
            w.put_bytes(part);
        }

        let codec = WireCodec::new();
        let items = codec.decode_message(&w.into_inner()).unwrap().flatten();
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Decoded::Frame(_)));
        assert!(matches!(&items[1], Decoded::Malformed { index: 1, .. }));
        assert!(matches!(&items[2], Decoded::Signaling(_)));
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let codec = WireCodec::new();
        let decoded = codec.decode_message(&[0xef, 0xbe, 9, 9, 9]).unwrap();
        assert!(matches!(decoded, Decoded::Unknown { tag: 0xbeef }));
    }

    #[test]
    fn test_extension_decoded_through_registry() {
        let registry = Arc::new(CodecRegistry::builder().typed::<Ping>().build());
        let codec = WireCodec::with_registry(registry);
        let bytes = codec.encode_value(&Ping(7)).unwrap();

        match codec.decode_message(&bytes).unwrap() {
            Decoded::Extension { tag, value } => {
                assert_eq!(tag, Ping::TAG);
                assert_eq!(value.downcast_ref::<Ping>(), Some(&Ping(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(codec.decode_value::<Ping>(&bytes).unwrap(), Ping(7));
    }

    #[test]
    fn test_extension_inside_batch() {
        let registry = Arc::new(CodecRegistry::builder().typed::<Ping>().build());
        let codec = WireCodec::with_registry(registry);
        let ping = codec.encode_value(&Ping(1)).unwrap();
        let signal = WireMessage::from(envelope()).to_bytes();

        let mut w = Writer::new();
        w.put_u16(BATCH_TAG);
        w.put_u32(2);
        w.put_u32(0);
        w.put_u32(ping.len() as u32);
        w.put_u32((ping.len() + signal.len()) as u32);
        w.put_bytes(&ping);
        w.put_bytes(&signal);

        let items = codec.decode_message(&w.into_inner()).unwrap().flatten();
        assert!(matches!(&items[0], Decoded::Extension { tag: 0x2000, .. }));
        assert!(matches!(&items[1], Decoded::Signaling(_)));
    }

    /// Wraps `inner` in `levels` single-element batches.
    fn nest(inner: &[u8], levels: usize) -> Vec<u8> {
        // Each batch header is 14 bytes: tag, count and two offsets.
        let mut w = Writer::new();
        for level in 0..levels {
            let below = 14 * (levels - 1 - level) + inner.len();
            w.put_u16(BATCH_TAG);
            w.put_u32(1);
            w.put_u32(0);
            w.put_u32(below as u32);
        }
        w.put_bytes(inner);
        w.into_inner()
    }

    #[test]
    fn test_nested_batches_within_depth_decode() {
        let codec = WireCodec::new();
        let bytes = nest(&WireMessage::from(frame()).to_bytes(), MAX_BATCH_DEPTH);
        let items = codec.decode_message(&bytes).unwrap().flatten();
        assert!(matches!(&items[..], [Decoded::Frame(f)] if *f == frame()));
        assert_eq!(codec.decode::<WireMessage>(&bytes).map(|_| ()), Ok(()));
    }

    #[test]
    fn test_nested_batches_past_depth_are_malformed() {
        let codec = WireCodec::new();
        let bytes = nest(&WireMessage::from(frame()).to_bytes(), MAX_BATCH_DEPTH + 1);
        let items = codec.decode_message(&bytes).unwrap().flatten();
        assert!(matches!(
            &items[..],
            [Decoded::Malformed { index: 0, error: WireError::TooDeep(MAX_BATCH_DEPTH) }]
        ));
        assert_eq!(
            codec.decode::<WireMessage>(&bytes).unwrap_err(),
            WireError::TooDeep(MAX_BATCH_DEPTH)
        );
    }

    #[test]
    fn test_hostile_nesting_does_not_exhaust_stack() {
        let codec = WireCodec::new();
        let bytes = nest(&[], 100_000);
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                let decoded = codec.decode_message(&bytes).map(Decoded::flatten);
                let direct = codec.decode::<WireMessage>(&bytes);
                (decoded, direct)
            })
            .unwrap();
        let (decoded, direct) = handle.join().unwrap();
        assert!(matches!(
            &decoded.unwrap()[..],
            [Decoded::Malformed { error: WireError::TooDeep(_), .. }]
        ));
        assert_eq!(direct.unwrap_err(), WireError::TooDeep(MAX_BATCH_DEPTH));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let codec = WireCodec::new();
        let mut bytes = codec.encode(&envelope());
        bytes.push(0);
        let err = codec.decode::<SignalingEnvelope>(&bytes).unwrap_err();
        assert_eq!(err, WireError::TrailingBytes(1));
    }

    #[test]
    fn test_truncated_top_level_is_error() {
        let codec = WireCodec::new();
        let bytes = codec.encode_message(&frame().into());
        let err = codec.decode_message(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_strict_batch_decode_matches_wire_message() {
        let batch = WireMessage::Batch(vec![frame().into()]);
        let bytes = batch.to_bytes();
        let strict = IndexesArray::<WireMessage>::decode_strict(&mut Cursor::new(&bytes), BATCH_TAG)
            .unwrap();
        assert_eq!(strict.items, vec![WireMessage::from(frame())]);
    }
}
