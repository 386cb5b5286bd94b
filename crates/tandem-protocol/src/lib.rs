//! Wire protocol for Tandem.
//!
//! Everything that crosses a socket is encoded here:
//!
//! - **Primitives** ([`wire`]): a little-endian [`Writer`]/[`Cursor`] pair,
//!   the [`Encode`]/[`Decode`] traits, and deferred [`Bytable`] encodings.
//! - **Framing**: [`CountArray`] for homogeneous lists and
//!   [`IndexesArray`] for heterogeneous ones whose elements can be skipped
//!   without being understood.
//! - **Types**: [`SignalingEnvelope`], [`Frame`], [`WireMessage`] and the
//!   identifiers they carry.
//! - **Codec**: [`WireCodec`], which decodes inbound bytes into
//!   [`Decoded`] and consults an extension [`CodecRegistry`] for tags it
//!   does not know.
//!
//! ```text
//! Transport (bytes) → Protocol (WireMessage) → Session (peers, channels)
//! ```

mod codec;
mod error;
mod framing;
mod registry;
mod types;
pub mod wire;

pub use codec::{Decoded, WireCodec};
pub use error::WireError;
pub use framing::{CountArray, IndexedReader, IndexesArray};
pub use registry::{CodecModule, CodecRegistry, CodecRegistryBuilder, DynValue, TypedModule};
pub use types::{
    ChannelSpec, Frame, IceCandidate, PayloadCategory, PeerId, RemoteStatus, SignalingEnvelope,
    SignalingMessage, Token, WireMessage, BATCH_TAG, FRAME_TAG, MAX_BATCH_DEPTH, PEER_LIST_TAG,
    SIGNALING_TAG,
};
pub use wire::{Bytable, Cursor, Decode, Encode, Tagged, Writer};
