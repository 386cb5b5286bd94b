//! Core wire types: peers, channel specs, frames, tokens, and the signaling
//! envelope.
//!
//! Every top-level message on the wire starts with a `u16` tag:
//!
//! | Tag      | Message                      |
//! |----------|------------------------------|
//! | `0x0001` | [`SignalingEnvelope`]        |
//! | `0x0002` | [`Frame`]                    |
//! | `0x0003` | batch of messages (indexed)  |
//!
//! Inside a signaling envelope, a `u8` kind selects the
//! [`SignalingMessage`] variant.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::framing::{CountArray, IndexedReader, IndexesArray};
use crate::wire::{Cursor, Decode, Encode, Tagged, Writer};
use crate::WireError;

/// Tag of a [`SignalingEnvelope`].
pub const SIGNALING_TAG: u16 = 0x0001;
/// Tag of a [`Frame`].
pub const FRAME_TAG: u16 = 0x0002;
/// Tag of a batch of messages with indexed framing.
pub const BATCH_TAG: u16 = 0x0003;
/// How many batch levels may nest inside one message.
pub const MAX_BATCH_DEPTH: usize = 8;
/// Element tag of a counted list of [`PeerId`]s.
pub const PEER_LIST_TAG: u16 = 0x0100;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Opaque identifier for a peer (endpoint) in the session.
///
/// The id [`PeerId::SERVER`] is reserved for the hosting server, which
/// takes part in the session as a virtual peer reachable only through the
/// relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// The reserved id of the server peer.
    pub const SERVER: &'static str = "server";

    /// Wraps a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The server virtual peer.
    pub fn server() -> Self {
        Self(Self::SERVER.to_owned())
    }

    /// The id used before the server has assigned one.
    pub fn unassigned() -> Self {
        Self(String::new())
    }

    /// `true` for the server virtual peer.
    pub fn is_server(&self) -> bool {
        self.0 == Self::SERVER
    }

    /// `true` before an id has been assigned.
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<unassigned>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl Tagged for PeerId {
    const TAG: u16 = PEER_LIST_TAG;
}

impl Encode for PeerId {
    fn encoded_len(&self) -> usize {
        self.0.encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.0.encode(w);
    }
}

impl Decode for PeerId {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self(String::decode(cur)?))
    }
}

// ---------------------------------------------------------------------------
// PayloadCategory
// ---------------------------------------------------------------------------

/// What kind of application payload a channel or frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadCategory {
    /// Generic application data (entity updates, RPCs).
    Data = 0,
    /// High-frequency pose/tracking updates.
    Tracking = 1,
    /// Opaque audio chunks.
    Audio = 2,
    /// Opaque video chunks.
    Video = 3,
    /// Control traffic carried on a data channel.
    Signaling = 4,
}

impl TryFrom<u8> for PayloadCategory {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Data),
            1 => Ok(Self::Tracking),
            2 => Ok(Self::Audio),
            3 => Ok(Self::Video),
            4 => Ok(Self::Signaling),
            other => Err(WireError::InvalidValue(format!("payload category {other}"))),
        }
    }
}

impl fmt::Display for PayloadCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Tracking => "tracking",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Signaling => "signaling",
        };
        f.write_str(name)
    }
}

impl Encode for PayloadCategory {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u8(*self as u8);
    }
}

impl Decode for PayloadCategory {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Self::try_from(u8::decode(cur)?)
    }
}

// ---------------------------------------------------------------------------
// ChannelSpec
// ---------------------------------------------------------------------------

/// The identity of a logical channel: its label plus delivery guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Unique (per peer) channel label.
    pub label: String,
    /// `true` for reliable-ordered delivery.
    pub reliable: bool,
    /// Payload carried on the channel.
    pub category: PayloadCategory,
}

impl ChannelSpec {
    /// Creates a channel spec.
    pub fn new(label: impl Into<String>, reliable: bool, category: PayloadCategory) -> Self {
        Self {
            label: label.into(),
            reliable,
            category,
        }
    }
}

impl Encode for ChannelSpec {
    fn encoded_len(&self) -> usize {
        self.label.encoded_len() + 1 + 1
    }

    fn encode(&self, w: &mut Writer) {
        self.label.encode(w);
        self.reliable.encode(w);
        self.category.encode(w);
    }
}

impl Decode for ChannelSpec {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self {
            label: cur.read()?,
            reliable: cur.read()?,
            category: cur.read()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One application payload addressed from one peer to a set of peers.
///
/// Frames travel over direct channels and, wrapped in
/// [`SignalingMessage::Relay`], over the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sending peer.
    pub source: PeerId,
    /// Receiving peers.
    pub targets: BTreeSet<PeerId>,
    /// Payload kind.
    pub category: PayloadCategory,
    /// Whether the frame was sent reliably.
    pub reliable: bool,
    /// Application bytes.
    pub payload: Vec<u8>,
}

impl Tagged for Frame {
    const TAG: u16 = FRAME_TAG;
}

impl Encode for Frame {
    fn encoded_len(&self) -> usize {
        self.source.encoded_len()
            + 2
            + 4
            + self.targets.iter().map(Encode::encoded_len).sum::<usize>()
            + 1
            + 1
            + self.payload.encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.source.encode(w);
        // Same bytes as `CountArray<PeerId>`, without cloning the set.
        w.put_u16(PeerId::TAG);
        w.put_u32(u32::try_from(self.targets.len()).unwrap_or(u32::MAX));
        for target in &self.targets {
            target.encode(w);
        }
        self.category.encode(w);
        self.reliable.encode(w);
        self.payload.encode(w);
    }
}

impl Decode for Frame {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self {
            source: cur.read()?,
            targets: cur.read::<CountArray<PeerId>>()?.into_inner().into_iter().collect(),
            category: cur.read()?,
            reliable: cur.read()?,
            payload: cur.read()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A bearer credential.
///
/// `issued_at` is milliseconds since the Unix epoch as stamped by the
/// issuer; a newer token always has a larger `issued_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The bearer string.
    pub value: String,
    /// Issue time, ms since the Unix epoch.
    pub issued_at: u64,
}

impl Token {
    /// Creates a token.
    pub fn new(value: impl Into<String>, issued_at: u64) -> Self {
        Self {
            value: value.into(),
            issued_at,
        }
    }
}

impl Encode for Token {
    fn encoded_len(&self) -> usize {
        self.value.encoded_len() + 8
    }

    fn encode(&self, w: &mut Writer) {
        self.value.encode(w);
        self.issued_at.encode(w);
    }
}

impl Decode for Token {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self {
            value: cur.read()?,
            issued_at: cur.read()?,
        })
    }
}

// ---------------------------------------------------------------------------
// RemoteStatus
// ---------------------------------------------------------------------------

/// Session status as reported by the server.
///
/// Travels as a plain string both on the wire and in HTTP bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteStatus {
    /// The session exists but is not joinable yet.
    Waiting,
    /// The session is joinable.
    Ready,
    /// The session is over.
    Ended,
    /// Any status this client does not know.
    Other(String),
}

impl RemoteStatus {
    /// The wire spelling.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Ended => "ended",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for RemoteStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "waiting" => Self::Waiting,
            "ready" => Self::Ready,
            "ended" => Self::Ended,
            _ => Self::Other(s),
        }
    }
}

impl From<RemoteStatus> for String {
    fn from(status: RemoteStatus) -> Self {
        status.as_str().to_owned()
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// A transport-discovered connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// The candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Creates a candidate with no media association.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

impl Encode for IceCandidate {
    fn encoded_len(&self) -> usize {
        self.candidate.encoded_len()
            + self.sdp_mid.encoded_len()
            + self.sdp_m_line_index.encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.candidate.encode(w);
        self.sdp_mid.encode(w);
        self.sdp_m_line_index.encode(w);
    }
}

impl Decode for IceCandidate {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self {
            candidate: cur.read()?,
            sdp_mid: cur.read()?,
            sdp_m_line_index: cur.read()?,
        })
    }
}

/// The control-plane messages exchanged over the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Session description offer.
    Offer {
        /// Offer SDP.
        sdp: String,
    },
    /// Session description answer.
    Answer {
        /// Answer SDP.
        sdp: String,
    },
    /// Connectivity candidate.
    IceCandidate(IceCandidate),
    /// A channel the sender has opened (or confirms) toward the target.
    ChannelAnnounce(ChannelSpec),
    /// The source peer joined the session.
    PeerJoin,
    /// The source peer left the session.
    PeerLeave,
    /// The source peer's connection is gone for good.
    ConnectionClose,
    /// A fresh credential.
    TokenRefresh(Token),
    /// The session status changed.
    StatusChange(RemoteStatus),
    /// Identity handshake, sent first on every socket.
    Handshake {
        /// Client name/version string.
        client: String,
        /// Current bearer token, if any.
        token: Option<String>,
    },
    /// The server's reply to a handshake, carrying our assigned id.
    HandshakeAck {
        /// Id assigned to this client.
        peer: PeerId,
    },
    /// Ask the target to start offer/answer over from scratch.
    RestartNegotiation,
    /// An application frame tunnelled through signaling.
    Relay(Frame),
}

impl SignalingMessage {
    fn kind(&self) -> u8 {
        match self {
            Self::Offer { .. } => 1,
            Self::Answer { .. } => 2,
            Self::IceCandidate(_) => 3,
            Self::ChannelAnnounce(_) => 4,
            Self::PeerJoin => 5,
            Self::PeerLeave => 6,
            Self::ConnectionClose => 7,
            Self::TokenRefresh(_) => 8,
            Self::StatusChange(_) => 9,
            Self::Handshake { .. } => 10,
            Self::HandshakeAck { .. } => 11,
            Self::RestartNegotiation => 12,
            Self::Relay(_) => 13,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::ChannelAnnounce(_) => "channel-announce",
            Self::PeerJoin => "peer-join",
            Self::PeerLeave => "peer-leave",
            Self::ConnectionClose => "connection-close",
            Self::TokenRefresh(_) => "token-refresh",
            Self::StatusChange(_) => "status-change",
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake-ack",
            Self::RestartNegotiation => "restart-negotiation",
            Self::Relay(_) => "relay",
        }
    }
}

impl Encode for SignalingMessage {
    fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Offer { sdp } | Self::Answer { sdp } => sdp.encoded_len(),
            Self::IceCandidate(c) => c.encoded_len(),
            Self::ChannelAnnounce(spec) => spec.encoded_len(),
            Self::PeerJoin
            | Self::PeerLeave
            | Self::ConnectionClose
            | Self::RestartNegotiation => 0,
            Self::TokenRefresh(token) => token.encoded_len(),
            Self::StatusChange(status) => status.as_str().encoded_len(),
            Self::Handshake { client, token } => client.encoded_len() + token.encoded_len(),
            Self::HandshakeAck { peer } => peer.encoded_len(),
            Self::Relay(frame) => frame.encoded_len(),
        }
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.kind());
        match self {
            Self::Offer { sdp } | Self::Answer { sdp } => sdp.encode(w),
            Self::IceCandidate(c) => c.encode(w),
            Self::ChannelAnnounce(spec) => spec.encode(w),
            Self::PeerJoin
            | Self::PeerLeave
            | Self::ConnectionClose
            | Self::RestartNegotiation => {}
            Self::TokenRefresh(token) => token.encode(w),
            Self::StatusChange(status) => status.as_str().encode(w),
            Self::Handshake { client, token } => {
                client.encode(w);
                token.encode(w);
            }
            Self::HandshakeAck { peer } => peer.encode(w),
            Self::Relay(frame) => frame.encode(w),
        }
    }
}

impl Decode for SignalingMessage {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let kind = u8::decode(cur)?;
        Ok(match kind {
            1 => Self::Offer { sdp: cur.read()? },
            2 => Self::Answer { sdp: cur.read()? },
            3 => Self::IceCandidate(cur.read()?),
            4 => Self::ChannelAnnounce(cur.read()?),
            5 => Self::PeerJoin,
            6 => Self::PeerLeave,
            7 => Self::ConnectionClose,
            8 => Self::TokenRefresh(cur.read()?),
            9 => Self::StatusChange(RemoteStatus::from(cur.read::<String>()?)),
            10 => Self::Handshake {
                client: cur.read()?,
                token: cur.read()?,
            },
            11 => Self::HandshakeAck { peer: cur.read()? },
            12 => Self::RestartNegotiation,
            13 => Self::Relay(cur.read()?),
            other => return Err(WireError::UnknownTag(u16::from(other))),
        })
    }
}

/// A signaling message with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    /// Sending peer.
    pub source: PeerId,
    /// Receiving peer.
    pub target: PeerId,
    /// The message.
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    /// Creates an envelope.
    pub fn new(source: PeerId, target: PeerId, message: SignalingMessage) -> Self {
        Self {
            source,
            target,
            message,
        }
    }
}

impl Tagged for SignalingEnvelope {
    const TAG: u16 = SIGNALING_TAG;
}

impl Encode for SignalingEnvelope {
    fn encoded_len(&self) -> usize {
        self.source.encoded_len() + self.target.encoded_len() + self.message.encoded_len()
    }

    fn encode(&self, w: &mut Writer) {
        self.source.encode(w);
        self.target.encode(w);
        self.message.encode(w);
    }
}

impl Decode for SignalingEnvelope {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Ok(Self {
            source: cur.read()?,
            target: cur.read()?,
            message: cur.read()?,
        })
    }
}

// ---------------------------------------------------------------------------
// WireMessage: the top-level wire format
// ---------------------------------------------------------------------------

/// Every message on the wire, introduced by its `u16` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Control-plane envelope.
    Signaling(SignalingEnvelope),
    /// Application frame.
    Frame(Frame),
    /// Several messages sent together with indexed framing.
    Batch(Vec<WireMessage>),
}

impl WireMessage {
    fn tag(&self) -> u16 {
        match self {
            Self::Signaling(_) => SIGNALING_TAG,
            Self::Frame(_) => FRAME_TAG,
            Self::Batch(_) => BATCH_TAG,
        }
    }
}

impl From<SignalingEnvelope> for WireMessage {
    fn from(envelope: SignalingEnvelope) -> Self {
        Self::Signaling(envelope)
    }
}

impl From<Frame> for WireMessage {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl Encode for WireMessage {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Signaling(envelope) => 2 + envelope.encoded_len(),
            Self::Frame(frame) => 2 + frame.encoded_len(),
            // The indexed header carries the batch tag itself.
            Self::Batch(items) => batch_header_len(items.len())
                + items.iter().map(Encode::encoded_len).sum::<usize>(),
        }
    }

    fn encode(&self, w: &mut Writer) {
        match self {
            Self::Signaling(envelope) => {
                w.put_u16(self.tag());
                envelope.encode(w);
            }
            Self::Frame(frame) => {
                w.put_u16(self.tag());
                frame.encode(w);
            }
            Self::Batch(items) => {
                let array = IndexesArray::new(BATCH_TAG, items.iter().collect());
                array.encode(w);
            }
        }
    }
}

impl Decode for WireMessage {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        Self::decode_nested(cur, 0)
    }
}

impl WireMessage {
    fn decode_nested(cur: &mut Cursor<'_>, depth: usize) -> Result<Self, WireError> {
        match cur.peek_u16()? {
            SIGNALING_TAG => {
                cur.read::<u16>()?;
                Ok(Self::Signaling(cur.read()?))
            }
            FRAME_TAG => {
                cur.read::<u16>()?;
                Ok(Self::Frame(cur.read()?))
            }
            BATCH_TAG => {
                if depth >= MAX_BATCH_DEPTH {
                    return Err(WireError::TooDeep(MAX_BATCH_DEPTH));
                }
                let reader = IndexedReader::open(cur, BATCH_TAG)?;
                let mut items = Vec::with_capacity(reader.len());
                for element in reader {
                    items.push(Self::decode_nested(&mut element?, depth + 1)?);
                }
                Ok(Self::Batch(items))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn batch_header_len(count: usize) -> usize {
    2 + 4 + 4 * (count + 1)
}
