//! Media and peer-connection collaborators.
//!
//! The negotiator never talks to a media stack directly. It drives these traits, and the
//! provider reports asynchronous happenings (ICE candidates, state changes, remote tracks,
//! data-channel traffic) back as [`PeerEvent`]s through a [`PeerEventSink`].

use hush_common::{CallType, Result};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Connection state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A set of local tracks (microphone, camera or screen).
pub trait MediaStream: Send {
    fn tracks(&self) -> Vec<MediaTrack>;
    fn set_enabled(&mut self, kind: TrackKind, enabled: bool);
    /// Stop every track and release the capture device.
    fn stop(&mut self);

    fn video_track(&self) -> Option<MediaTrack> {
        self.tracks()
            .into_iter()
            .find(|track| track.kind == TrackKind::Video)
    }
}

pub trait MediaProvider: Send {
    type Stream: MediaStream;

    /// Microphone for voice calls, microphone and camera for video calls.
    fn capture(&mut self, call_type: CallType) -> Result<Self::Stream>;
    fn capture_screen(&mut self) -> Result<Self::Stream>;
}

pub trait DataChannel: Send {
    fn label(&self) -> &str;
    fn send(&mut self, text: &str) -> Result<()>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
}

pub trait PeerConnection: Send {
    fn add_track(&mut self, track: &MediaTrack) -> Result<()>;
    /// Swap the outgoing video source in place, without renegotiation.
    fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()>;
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>>;
    fn create_offer(&mut self) -> Result<String>;
    fn create_answer(&mut self) -> Result<String>;
    fn set_local_description(&mut self, desc: SessionDescription) -> Result<()>;
    fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()>;
    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;
    fn close(&mut self);
}

pub trait PeerConnector: Send {
    type Connection: PeerConnection;

    fn connect(&mut self, events: PeerEventSink) -> Result<Self::Connection>;
}

pub enum PeerEvent {
    IceCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(MediaTrack),
    /// The remote side opened the auxiliary channel.
    DataChannel(Box<dyn DataChannel>),
    DataChannelOpen,
    DataMessage(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(t).finish(),
            Self::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            Self::DataChannelOpen => write!(f, "DataChannelOpen"),
            Self::DataMessage(_) => write!(f, "DataMessage(..)"),
        }
    }
}

/// Peer events stamped with the session generation they belong to.
pub type PeerEventReceiver = mpsc::UnboundedReceiver<(u64, PeerEvent)>;

/// Where a peer connection reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the negotiator is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}
