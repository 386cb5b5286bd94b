//! Frame-carrying sinks: the relay fallback and direct data channels.
//!
//! Both paths put the same bytes on the wire, an encoded [`Frame`], so an
//! inbound payload is unwrapped identically whichever way it arrived and
//! the application cannot tell them apart.

use std::collections::BTreeSet;
use std::sync::Arc;

use tandem_protocol::{ChannelSpec, Encode, Frame, PayloadCategory, PeerId, WireMessage};
use tracing::trace;

use crate::channel::ChannelSink;
use crate::SessionError;

/// Accepts frames bound for the relay (the signaling socket).
pub trait FrameSink: Send + Sync {
    /// Queues `frame` for transmission.
    fn send_frame(&self, frame: Frame) -> Result<(), SessionError>;
}

/// A peer-transport data channel carrying raw bytes.
pub trait DataChannel: Send {
    /// Sends one message.
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), SessionError>;

    /// Closes the channel.
    fn close(&mut self);
}

/// An inbound application payload, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sending peer.
    pub peer: PeerId,
    /// What the payload is.
    pub category: PayloadCategory,
    /// Whether it arrived on a reliable path.
    pub reliable: bool,
    /// The payload.
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Unwraps a frame.
    pub fn from_frame(frame: Frame) -> Self {
        Self {
            peer: frame.source,
            category: frame.category,
            reliable: frame.reliable,
            payload: frame.payload,
        }
    }
}

fn frame_for(local: &PeerId, remote: &PeerId, spec: &ChannelSpec, payload: &[u8]) -> Frame {
    Frame {
        source: local.clone(),
        targets: BTreeSet::from([remote.clone()]),
        category: spec.category,
        reliable: spec.reliable,
        payload: payload.to_vec(),
    }
}

/// A [`ChannelSink`] that tunnels payloads through signaling.
pub struct RelaySink {
    local: PeerId,
    remote: PeerId,
    spec: ChannelSpec,
    frames: Arc<dyn FrameSink>,
}

impl RelaySink {
    /// A relay sink from `local` to `remote` for the channel `spec`.
    pub fn new(local: PeerId, remote: PeerId, spec: ChannelSpec, frames: Arc<dyn FrameSink>) -> Self {
        Self {
            local,
            remote,
            spec,
            frames,
        }
    }
}

impl ChannelSink for RelaySink {
    fn transmit(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        trace!(to = %self.remote, label = %self.spec.label, len = payload.len(), "relay send");
        self.frames
            .send_frame(frame_for(&self.local, &self.remote, &self.spec, payload))
    }

    fn is_relay(&self) -> bool {
        true
    }
}

/// A [`ChannelSink`] over a direct [`DataChannel`].
pub struct DirectSink {
    local: PeerId,
    remote: PeerId,
    spec: ChannelSpec,
    channel: Box<dyn DataChannel>,
}

impl DirectSink {
    /// Wraps a data channel opened for `spec`.
    pub fn new(local: PeerId, remote: PeerId, spec: ChannelSpec, channel: Box<dyn DataChannel>) -> Self {
        Self {
            local,
            remote,
            spec,
            channel,
        }
    }
}

impl ChannelSink for DirectSink {
    fn transmit(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let frame = frame_for(&self.local, &self.remote, &self.spec, payload);
        self.channel.send(WireMessage::Frame(frame).to_bytes())
    }

    fn close(&mut self) {
        self.channel.close();
    }
}
