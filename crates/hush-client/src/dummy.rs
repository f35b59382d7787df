//! Synthetic media and peer-connection providers.
//!
//! No devices and no network: streams are track descriptors, SDP is generated text, and a
//! connection reports itself connected once both descriptions are in place and at least one
//! remote candidate has arrived. Used by the CLI and by tests.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hush_common::{CallType, Error, Result};
use tracing::debug;

use crate::peer::{
    DataChannel, IceCandidate, MediaProvider, MediaStream, MediaTrack, PeerConnection,
    PeerConnector, PeerEvent, PeerEventSink, PeerState, SdpType, SessionDescription, TrackKind,
};

const CANDIDATES_PER_DESCRIPTION: u16 = 2;

#[derive(Debug, Default)]
pub struct DummyMediaProvider {
    next_id: u64,
    fail_capture: bool,
    live: Arc<AtomicUsize>,
}

impl DummyMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose every capture is denied.
    pub fn failing() -> Self {
        Self {
            fail_capture: true,
            ..Self::default()
        }
    }

    /// Counter of streams captured and not yet stopped.
    pub fn live_streams(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }

    fn stream(&mut self, kinds: &[(&str, TrackKind)]) -> DummyStream {
        self.next_id += 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        let tracks = kinds
            .iter()
            .map(|(prefix, kind)| {
                (
                    MediaTrack {
                        id: format!("{prefix}-{}", self.next_id),
                        kind: *kind,
                    },
                    true,
                )
            })
            .collect();
        DummyStream {
            tracks,
            stopped: false,
            live: self.live.clone(),
        }
    }
}

impl MediaProvider for DummyMediaProvider {
    type Stream = DummyStream;

    fn capture(&mut self, call_type: CallType) -> Result<DummyStream> {
        if self.fail_capture {
            return Err(Error::media("permission denied for microphone/camera"));
        }
        let stream = match call_type {
            CallType::Voice => self.stream(&[("mic", TrackKind::Audio)]),
            CallType::Video => {
                self.stream(&[("mic", TrackKind::Audio), ("cam", TrackKind::Video)])
            }
        };
        Ok(stream)
    }

    fn capture_screen(&mut self) -> Result<DummyStream> {
        if self.fail_capture {
            return Err(Error::media("screen capture not permitted"));
        }
        Ok(self.stream(&[("screen", TrackKind::Video)]))
    }
}

#[derive(Debug)]
pub struct DummyStream {
    tracks: Vec<(MediaTrack, bool)>,
    stopped: bool,
    live: Arc<AtomicUsize>,
}

impl DummyStream {
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .any(|(track, enabled)| track.kind == kind && *enabled)
    }
}

impl MediaStream for DummyStream {
    fn tracks(&self) -> Vec<MediaTrack> {
        if self.stopped {
            return Vec::new();
        }
        self.tracks.iter().map(|(track, _)| track.clone()).collect()
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        for (track, flag) in &mut self.tracks {
            if track.kind == kind {
                *flag = enabled;
            }
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for DummyStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
pub struct DummyPeerConnector;

impl PeerConnector for DummyPeerConnector {
    type Connection = DummyPeerConnection;

    fn connect(&mut self, events: PeerEventSink) -> Result<DummyPeerConnection> {
        Ok(DummyPeerConnection::new(events))
    }
}

pub struct DummyPeerConnection {
    events: PeerEventSink,
    session_id: u32,
    state: PeerState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<MediaTrack>,
    video: Option<MediaTrack>,
    remote_candidates: Vec<IceCandidate>,
    has_data_channel: bool,
    channel_open: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl DummyPeerConnection {
    fn new(events: PeerEventSink) -> Self {
        Self {
            events,
            session_id: rand::random(),
            state: PeerState::New,
            local: None,
            remote: None,
            tracks: Vec::new(),
            video: None,
            remote_candidates: Vec::new(),
            has_data_channel: false,
            channel_open: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Track currently feeding the outgoing video sender.
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    /// Everything written to the auxiliary channel so far, still sealed.
    pub fn sent_data(&self) -> Vec<String> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Pretend the transport changed state, as a real stack would on ICE failure.
    pub fn simulate_state(&mut self, state: PeerState) {
        self.state = state;
        self.events.emit(PeerEvent::StateChanged(state));
    }

    /// Deliver an inbound auxiliary-channel message.
    pub fn simulate_data(&self, text: impl Into<String>) {
        self.events.emit(PeerEvent::DataMessage(text.into()));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == PeerState::Closed {
            return Err(Error::transport("peer connection is closed"));
        }
        Ok(())
    }

    fn data_channel(&self, label: &str) -> DummyDataChannel {
        DummyDataChannel {
            label: label.to_string(),
            open: self.channel_open.clone(),
            sent: self.sent.clone(),
        }
    }

    fn render_sdp(&self, with_data: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id
        );
        let mut mid = 0;
        for track in &self.tracks {
            let media = match track.kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            let _ = write!(sdp, "m={media}\r\na=mid:{mid}\r\na=msid:- {}\r\n", track.id);
            mid += 1;
        }
        if with_data {
            let _ = write!(
                sdp,
                "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{mid}\r\n"
            );
        }
        sdp
    }

    fn gather_candidates(&self) {
        let base_port = 50_000 + (self.session_id % 10_000) as u16;
        for n in 0..CANDIDATES_PER_DESCRIPTION {
            self.events.emit(PeerEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    n + 1,
                    base_port + n
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
        }
    }

    fn maybe_connect(&mut self) {
        if self.local.is_none()
            || self.remote.is_none()
            || self.remote_candidates.is_empty()
            || self.state == PeerState::Connected
        {
            return;
        }
        self.state = PeerState::Connecting;
        self.events.emit(PeerEvent::StateChanged(PeerState::Connecting));
        self.state = PeerState::Connected;
        self.events.emit(PeerEvent::StateChanged(PeerState::Connected));

        if self.has_data_channel {
            self.channel_open.store(true, Ordering::SeqCst);
            self.events.emit(PeerEvent::DataChannelOpen);
        }
    }
}

impl PeerConnection for DummyPeerConnection {
    fn add_track(&mut self, track: &MediaTrack) -> Result<()> {
        self.ensure_open()?;
        if track.kind == TrackKind::Video {
            self.video = Some(track.clone());
        }
        self.tracks.push(track.clone());
        Ok(())
    }

    fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()> {
        self.ensure_open()?;
        self.video = track.cloned();
        Ok(())
    }

    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>> {
        self.ensure_open()?;
        self.has_data_channel = true;
        Ok(Box::new(self.data_channel(label)))
    }

    fn create_offer(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.render_sdp(self.has_data_channel))
    }

    fn create_answer(&mut self) -> Result<String> {
        self.ensure_open()?;
        match &self.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                let with_data = remote.sdp.contains("m=application");
                Ok(self.render_sdp(with_data))
            }
            _ => Err(Error::state("cannot answer without a remote offer")),
        }
    }

    fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.local = Some(desc);
        self.gather_candidates();
        self.maybe_connect();
        Ok(())
    }

    fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let announces_channel =
            desc.sdp_type == SdpType::Offer && desc.sdp.contains("m=application");
        self.remote = Some(desc);

        if announces_channel && !self.has_data_channel {
            self.has_data_channel = true;
            self.events
                .emit(PeerEvent::DataChannel(Box::new(self.data_channel("aux"))));
        }
        self.maybe_connect();
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        debug!(candidate = %candidate.candidate, "remote candidate added");
        self.remote_candidates.push(candidate);
        self.maybe_connect();
        Ok(())
    }

    fn close(&mut self) {
        self.state = PeerState::Closed;
        self.channel_open.store(false, Ordering::SeqCst);
    }
}

pub struct DummyDataChannel {
    label: String,
    open: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl DataChannel for DummyDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&mut self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::transport("data channel is not open"));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(text.to_string()),
            Err(poisoned) => poisoned.into_inner().push(text.to_string()),
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
