//! In-memory fakes for the peer transport and relay.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tandem_protocol::{ChannelSpec, Frame, IceCandidate, PeerId};

use crate::peer::{PeerConnector, PeerConnectorFactory, PeerEventSink};
use crate::relay::{DataChannel, FrameSink};
use crate::SessionError;

#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    pub(crate) local_descriptions: Vec<String>,
    pub(crate) remote_descriptions: Vec<String>,
    pub(crate) candidates: Vec<IceCandidate>,
    pub(crate) rollbacks: u32,
    pub(crate) opened: Vec<String>,
    pub(crate) sent: Vec<Vec<u8>>,
    pub(crate) closed: bool,
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    log: Arc<Mutex<FakeLog>>,
    offers: u32,
}

impl FakeConnector {
    pub(crate) fn log(&self) -> Arc<Mutex<FakeLog>> {
        Arc::clone(&self.log)
    }
}

impl PeerConnector for FakeConnector {
    fn create_offer(&mut self) -> Result<String, SessionError> {
        self.offers += 1;
        Ok(format!("offer-{}", self.offers))
    }

    fn create_answer(&mut self) -> Result<String, SessionError> {
        Ok("answer".into())
    }

    fn set_local_description(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.log.lock().unwrap().local_descriptions.push(sdp.into());
        Ok(())
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.log.lock().unwrap().remote_descriptions.push(sdp.into());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SessionError> {
        self.log.lock().unwrap().rollbacks += 1;
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.log.lock().unwrap().candidates.push(candidate.clone());
        Ok(())
    }

    fn open_channel(&mut self, spec: &ChannelSpec) -> Result<Box<dyn DataChannel>, SessionError> {
        self.log.lock().unwrap().opened.push(spec.label.clone());
        Ok(Box::new(FakeData(Arc::clone(&self.log))))
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

struct FakeData(Arc<Mutex<FakeLog>>);

impl DataChannel for FakeData {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.0.lock().unwrap().sent.push(bytes);
        Ok(())
    }

    fn close(&mut self) {}
}

/// Hands out [`FakeConnector`]s and remembers each one's log.
#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) logs: Mutex<BTreeMap<PeerId, Arc<Mutex<FakeLog>>>>,
    pub(crate) connects: Mutex<u32>,
}

impl PeerConnectorFactory for FakeFactory {
    fn connect(
        &self,
        peer: &PeerId,
        _events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnector>, SessionError> {
        let connector = FakeConnector::default();
        self.logs.lock().unwrap().insert(peer.clone(), connector.log());
        *self.connects.lock().unwrap() += 1;
        Ok(Box::new(connector))
    }
}

#[derive(Default)]
pub(crate) struct RecordingFrames(Mutex<Vec<Frame>>);

impl RecordingFrames {
    pub(crate) fn taken(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl FrameSink for RecordingFrames {
    fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        self.0.lock().unwrap().push(frame);
        Ok(())
    }
}
