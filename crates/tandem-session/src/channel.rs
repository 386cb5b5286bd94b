//! A single logical conduit to one peer.
//!
//! ```text
//!  request / announce        transport confirms          transport closes
//!  ──────────────────► Opening ────────────────► Open ─────────────────► Closed
//!                         │ send → queue            │ send → sink            │ send → ChannelClosed
//!                         └────────── close() discards the queue ──────────┘
//! ```

use std::collections::VecDeque;

use tandem_protocol::{ChannelSpec, PayloadCategory, PeerId};
use tracing::{debug, warn};

use crate::SessionError;

/// Where a channel's bytes go once it is open.
///
/// Implemented by direct peer-transport data channels and by the relay.
pub trait ChannelSink: Send {
    /// Hands one payload to the underlying transport.
    fn transmit(&mut self, payload: &[u8]) -> Result<(), SessionError>;

    /// Releases the underlying transport resource.
    fn close(&mut self) {}

    /// `true` for sinks that tunnel through signaling.
    fn is_relay(&self) -> bool {
        false
    }
}

/// Lifecycle of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the transport to confirm; sends are queued.
    Opening,
    /// Sends go straight to the sink.
    Open,
    /// Terminal.
    Closed,
}

/// A typed, reliability-tagged conduit to a peer.
pub struct Channel {
    peer: PeerId,
    spec: ChannelSpec,
    state: ChannelState,
    pending: VecDeque<Vec<u8>>,
    sink: Box<dyn ChannelSink>,
}

impl Channel {
    /// A new channel in [`ChannelState::Opening`].
    pub fn new(peer: PeerId, spec: ChannelSpec, sink: Box<dyn ChannelSink>) -> Self {
        Self {
            peer,
            spec,
            state: ChannelState::Opening,
            pending: VecDeque::new(),
            sink,
        }
    }

    /// Remote peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Label, reliability, and category.
    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// Label.
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Sends queued while opening.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `true` if the sink tunnels through signaling.
    pub fn is_relay(&self) -> bool {
        self.sink.is_relay()
    }

    /// Opening → Open. The queue is flushed in FIFO order before this
    /// returns, so it drains ahead of any send made afterwards.
    ///
    /// Opening an already open or closed channel does nothing.
    pub fn open(&mut self) -> Result<(), SessionError> {
        if self.state != ChannelState::Opening {
            debug!(peer = %self.peer, label = %self.spec.label, state = ?self.state, "open ignored");
            return Ok(());
        }
        self.state = ChannelState::Open;
        debug!(
            peer = %self.peer,
            label = %self.spec.label,
            queued = self.pending.len(),
            "channel open"
        );
        while let Some(payload) = self.pending.pop_front() {
            if let Err(err) = self.sink.transmit(&payload) {
                warn!(peer = %self.peer, label = %self.spec.label, %err, "flush failed, dropping queued sends");
                self.pending.clear();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Sends or queues `payload` according to the state.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        match self.state {
            ChannelState::Open => self.sink.transmit(&payload),
            ChannelState::Opening => {
                self.pending.push_back(payload);
                Ok(())
            }
            ChannelState::Closed => {
                warn!(peer = %self.peer, label = %self.spec.label, "send on closed channel dropped");
                Err(SessionError::ChannelClosed {
                    peer: self.peer.clone(),
                    label: self.spec.label.clone(),
                })
            }
        }
    }

    /// → Closed. Queued sends are discarded, not flushed. Returns `true`
    /// if the channel was not already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        if !self.pending.is_empty() {
            debug!(
                peer = %self.peer,
                label = %self.spec.label,
                discarded = self.pending.len(),
                "discarding queued sends"
            );
        }
        self.pending.clear();
        self.state = ChannelState::Closed;
        self.sink.close();
        true
    }

    /// `true` if this channel carries `reliable`/`category` traffic.
    pub fn matches(&self, reliable: bool, category: PayloadCategory) -> bool {
        self.spec.reliable == reliable && self.spec.category == category
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}
