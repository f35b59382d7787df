//! Call session negotiation.
//!
//! One [`Negotiator`] owns at most one call session at a time and moves it through
//! `Idle -> Negotiating -> Connected -> Closed -> Idle`. All offer/answer/ICE traffic is
//! sealed with the process [`SymmetricChannel`] and travels through the relay as opaque
//! `encrypted_signaling` payloads.
//!
//! A session is bound to one remote member: the sender of the offer it answered, or the sender
//! of the first answer to its own offer. Signaling from anyone else in the room is dropped.
//!
//! Input arrives through three entry points:
//! - [`Negotiator::handle_signal`] for payloads the relay delivered
//! - [`Negotiator::handle_peer_event`] for provider callbacks, tagged with a session generation
//! - the command methods (`start_call`, `end_call`, screen share, mute, camera)
//!
//! [`Negotiator::run`] drives all three from channels.

use std::time::Duration;

use hush_common::{CallType, ClientMessage, Error, Result, ServerMessage};
use hush_crypto::SymmetricChannel;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::payload::{AuxMessage, SignalPayload};
use crate::peer::{
    DataChannel, IceCandidate, MediaProvider, MediaStream, MediaTrack, PeerConnection,
    PeerConnector, PeerEvent, PeerEventReceiver, PeerEventSink, PeerState, SessionDescription,
    TrackKind,
};

/// How long a failed call lingers before the client falls back to chat.
pub const RETURN_TO_CHAT_GRACE: Duration = Duration::from_secs(3);

pub const AUX_CHANNEL_LABEL: &str = "hush-aux";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    Negotiating(CallRole),
    Connected,
    Disconnected,
    Closed,
}

/// What the negotiator reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    StateChanged(NegotiatorState),
    RemoteTrack(MediaTrack),
    ScreenShare { active: bool },
    PeerStatus(AuxMessage),
    CallFailed { reason: String, retry_after: Duration },
    CallEnded { duration: Option<Duration> },
    ReturnedToChat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    Start(CallType),
    End,
    StartScreenShare,
    StopScreenShare,
    SetMuted(bool),
    SetCameraEnabled(bool),
    ReportQuality { rtt_ms: u32, packet_loss_pct: f32 },
}

/// Seals signaling payloads and hands them to the relay connection.
struct SignalSender {
    channel: SymmetricChannel,
    relay: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalSender {
    fn send(&self, payload: &SignalPayload) -> Result<()> {
        let data = self.channel.encrypt(payload)?;
        self.relay
            .send(ClientMessage::EncryptedSignaling { data })
            .map_err(|_| Error::transport("relay connection closed"))
    }
}

struct Session<S, C> {
    generation: u64,
    role: CallRole,
    call_type: CallType,
    /// Member on the other end; unset while an offer waits for its first answer.
    remote: Option<String>,
    peer: C,
    local: S,
    screen: Option<S>,
    remote_tracks: Vec<MediaTrack>,
    aux: Option<Box<dyn DataChannel>>,
    /// Sealed aux messages waiting for the channel to open.
    pending_aux: Vec<String>,
    /// Local candidates gathered before the remote member is known.
    pending_candidates: Vec<IceCandidate>,
    offer_outstanding: bool,
    connected_at: Option<Instant>,
}

impl<S: MediaStream, C: PeerConnection> Session<S, C> {
    fn attach_local_tracks(&mut self) -> Result<()> {
        for track in self.local.tracks() {
            self.peer.add_track(&track)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut screen) = self.screen.take() {
            screen.stop();
        }
        self.local.stop();
        self.remote_tracks.clear();
        self.pending_aux.clear();
        self.pending_candidates.clear();
        if let Some(mut aux) = self.aux.take() {
            aux.close();
        }
        self.peer.close();
    }
}

pub struct Negotiator<M: MediaProvider, P: PeerConnector> {
    media: M,
    connector: P,
    signals: SignalSender,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    peer_rx: PeerEventReceiver,
    member_id: Option<String>,
    state: NegotiatorState,
    session: Option<Session<M::Stream, P::Connection>>,
    generation: u64,
    return_to_chat_at: Option<Instant>,
}

impl<M: MediaProvider, P: PeerConnector> Negotiator<M, P> {
    pub fn new(
        media: M,
        connector: P,
        channel: SymmetricChannel,
        relay: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            media,
            connector,
            signals: SignalSender { channel, relay },
            events,
            peer_tx,
            peer_rx,
            member_id: None,
            state: NegotiatorState::Idle,
            session: None,
            generation: 0,
            return_to_chat_at: None,
        }
    }

    /// Remember the handle the relay assigned to this connection. Payloads addressed to
    /// other members are dropped once it is set.
    pub fn set_member_id(&mut self, member_id: impl Into<String>) {
        self.member_id = Some(member_id.into());
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Generation of the current (or most recent) session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn call_type(&self) -> Option<CallType> {
        self.session.as_ref().map(|s| s.call_type)
    }

    pub fn role(&self) -> Option<CallRole> {
        self.session.as_ref().map(|s| s.role)
    }

    pub fn peer(&self) -> Option<&P::Connection> {
        self.session.as_ref().map(|s| &s.peer)
    }

    pub fn peer_mut(&mut self) -> Option<&mut P::Connection> {
        self.session.as_mut().map(|s| &mut s.peer)
    }

    /// Member the current session is negotiating with.
    pub fn remote_member(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.remote.as_deref())
    }

    /// Captured camera/microphone stream of the current session.
    pub fn local_stream(&self) -> Option<&M::Stream> {
        self.session.as_ref().map(|s| &s.local)
    }

    pub fn remote_tracks(&self) -> &[MediaTrack] {
        match &self.session {
            Some(session) => &session.remote_tracks,
            None => &[],
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.screen.is_some())
    }

    pub fn return_to_chat_at(&self) -> Option<Instant> {
        self.return_to_chat_at
    }

    // ---- relay input ----

    /// Handle one `encrypted_signaling` payload from `sender`.
    pub fn handle_signal(&mut self, sender: &str, data: &str) {
        let payload: SignalPayload = match self.signals.channel.decrypt(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%sender, "dropping undecryptable signaling payload: {}", err);
                return;
            }
        };
        debug!(%sender, kind = payload.kind(), "signaling received");

        if let (Some(to), Some(me)) = (payload.recipient(), self.member_id.as_deref()) {
            if to != me {
                debug!(
                    %sender,
                    to,
                    kind = payload.kind(),
                    "signaling for another member, dropping"
                );
                return;
            }
        }

        let result = match payload {
            SignalPayload::Offer { sdp, call_type } => {
                self.on_remote_offer(sender, sdp, call_type)
            }
            SignalPayload::Answer { sdp, .. } => self.on_remote_answer(sender, sdp),
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
                ..
            } => {
                self.on_remote_candidate(
                    sender,
                    IceCandidate {
                        candidate,
                        sdp_mid,
                        sdp_m_line_index,
                    },
                );
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(%sender, "negotiation failed: {}", err);
            self.fail(&err);
        }
    }

    fn handle_relay_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::CallAllowed { call_type } => {
                if let Err(err) = self.start_call(call_type) {
                    warn!(%call_type, "could not start call: {}", err);
                }
            }
            ServerMessage::EncryptedSignaling { data, sender } => self.handle_signal(&sender, &data),
            other => debug!(?other, "relay message ignored by negotiator"),
        }
    }

    fn on_remote_offer(&mut self, sender: &str, sdp: String, call_type: CallType) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            if session.remote.as_deref() != Some(sender) {
                debug!(
                    %sender,
                    generation = session.generation,
                    "offer from outside the call, dropping"
                );
                return Ok(());
            }
            debug!(generation = session.generation, "applying offer as renegotiation");
            session
                .peer
                .set_remote_description(SessionDescription::offer(sdp))?;
            let answer = session.peer.create_answer()?;
            session
                .peer
                .set_local_description(SessionDescription::answer(answer.clone()))?;
            session.offer_outstanding = false;
            return self.signals.send(&SignalPayload::Answer {
                sdp: answer,
                to: Some(sender.to_string()),
            });
        }

        self.return_to_chat_at = None;
        let local = self.media.capture(call_type)?;
        self.install_session(
            CallRole::Answerer,
            call_type,
            local,
            Some(sender.to_string()),
        )?;
        self.set_state(NegotiatorState::Negotiating(CallRole::Answerer));

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::internal("session vanished during setup"))?;
        session.attach_local_tracks()?;
        session
            .peer
            .set_remote_description(SessionDescription::offer(sdp))?;
        let answer = session.peer.create_answer()?;
        session
            .peer
            .set_local_description(SessionDescription::answer(answer.clone()))?;

        self.signals.send(&SignalPayload::Answer {
            sdp: answer,
            to: Some(sender.to_string()),
        })?;
        info!(%sender, %call_type, "answered incoming call");
        Ok(())
    }

    fn on_remote_answer(&mut self, sender: &str, sdp: String) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            debug!(%sender, "answer without a peer connection, dropping");
            return Ok(());
        };
        if !session.offer_outstanding {
            debug!(%sender, "answer without an outstanding offer, dropping");
            return Ok(());
        }
        if session.remote.as_deref().is_some_and(|remote| remote != sender) {
            debug!(%sender, "answer from outside the call, dropping");
            return Ok(());
        }
        session
            .peer
            .set_remote_description(SessionDescription::answer(sdp))?;
        session.offer_outstanding = false;
        session.remote = Some(sender.to_string());
        let pending = std::mem::take(&mut session.pending_candidates);

        info!(%sender, "answer accepted");
        for candidate in pending {
            self.send_candidate(candidate, sender);
        }
        Ok(())
    }

    fn on_remote_candidate(&mut self, sender: &str, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            debug!(%sender, "candidate without a peer connection, dropping");
            return;
        };
        if session.remote.as_deref() != Some(sender) {
            debug!(%sender, "candidate from outside the call, dropping");
            return;
        }
        if let Err(err) = session.peer.add_ice_candidate(candidate) {
            warn!("failed to apply remote candidate: {}", err);
        }
    }

    // ---- provider input ----

    /// Handle one provider callback. Events from earlier sessions are ignored.
    pub fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if self.session.as_ref().map(|s| s.generation) != Some(generation) {
            debug!(generation, ?event, "dropping event from stale session");
            return;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                match session.remote.clone() {
                    Some(remote) => self.send_candidate(candidate, &remote),
                    None => session.pending_candidates.push(candidate),
                }
            }
            PeerEvent::StateChanged(state) => self.on_peer_state(state),
            PeerEvent::RemoteTrack(track) => {
                if let Some(session) = self.session.as_mut() {
                    session.remote_tracks.push(track.clone());
                }
                self.emit(NegotiatorEvent::RemoteTrack(track));
            }
            PeerEvent::DataChannel(channel) => {
                let open = channel.is_open();
                if let Some(session) = self.session.as_mut() {
                    debug!(label = channel.label(), "remote opened aux channel");
                    session.aux = Some(channel);
                }
                if open {
                    self.flush_aux();
                }
            }
            PeerEvent::DataChannelOpen => self.flush_aux(),
            PeerEvent::DataMessage(text) => self.on_aux_message(&text),
        }
    }

    /// Drain provider events queued so far. Returns how many were handled.
    pub fn pump_peer_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.peer_rx.try_recv() {
            self.handle_peer_event(generation, event);
            handled += 1;
        }
        handled
    }

    fn on_peer_state(&mut self, state: PeerState) {
        match state {
            PeerState::Connected => {
                if self.state == NegotiatorState::Connected {
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.connected_at = Some(Instant::now());
                }
                self.set_state(NegotiatorState::Connected);
                info!("call connected");
                self.send_aux(&AuxMessage::ConnectionEstablished);
            }
            PeerState::Disconnected | PeerState::Failed => {
                warn!(?state, "peer connection lost");
                self.set_state(NegotiatorState::Disconnected);
                self.teardown();
            }
            PeerState::Closed => self.teardown(),
            PeerState::New | PeerState::Connecting => debug!(?state, "peer state"),
        }
    }

    fn on_aux_message(&mut self, text: &str) {
        match self.signals.channel.decrypt::<AuxMessage>(text) {
            Ok(msg) => {
                debug!(?msg, "aux message received");
                self.emit(NegotiatorEvent::PeerStatus(msg));
            }
            Err(err) => warn!("dropping undecryptable aux message: {}", err),
        }
    }

    // ---- commands ----

    /// Capture media and send an offer to the room.
    pub fn start_call(&mut self, call_type: CallType) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::state("a call is already in progress"));
        }
        self.return_to_chat_at = None;

        match self.open_offer(call_type) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%call_type, "call setup failed: {}", err);
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn open_offer(&mut self, call_type: CallType) -> Result<()> {
        let local = self.media.capture(call_type)?;
        self.install_session(CallRole::Offerer, call_type, local, None)?;
        self.set_state(NegotiatorState::Negotiating(CallRole::Offerer));

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::internal("session vanished during setup"))?;
        session.aux = Some(session.peer.create_data_channel(AUX_CHANNEL_LABEL)?);
        session.attach_local_tracks()?;
        let sdp = session.peer.create_offer()?;
        session
            .peer
            .set_local_description(SessionDescription::offer(sdp.clone()))?;
        session.offer_outstanding = true;

        self.signals.send(&SignalPayload::Offer { sdp, call_type })?;
        info!(%call_type, generation = self.generation, "offer sent");
        Ok(())
    }

    /// Tear down the current session, if any. Safe in every state.
    pub fn end_call(&mut self) {
        self.teardown();
    }

    /// Replace the outgoing video with a screen capture. No-op unless connected.
    pub fn start_screen_share(&mut self) -> Result<()> {
        if self.state != NegotiatorState::Connected {
            debug!("screen share ignored outside a connected call");
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.screen.is_some() {
            return Ok(());
        }

        let mut screen = self.media.capture_screen()?;
        let Some(track) = screen.video_track() else {
            screen.stop();
            return Err(Error::media("screen capture produced no video track"));
        };
        if let Err(err) = session.peer.replace_video_track(Some(&track)) {
            screen.stop();
            return Err(err);
        }
        session.screen = Some(screen);

        info!("screen share started");
        self.send_aux(&AuxMessage::ScreenShare { active: true });
        self.emit(NegotiatorEvent::ScreenShare { active: true });
        Ok(())
    }

    /// Restore the camera (or nothing, on voice calls). No-op unless sharing.
    pub fn stop_screen_share(&mut self) -> Result<()> {
        if self.state != NegotiatorState::Connected {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(mut screen) = session.screen.take() else {
            return Ok(());
        };
        screen.stop();
        let camera = session.local.video_track();
        session.peer.replace_video_track(camera.as_ref())?;

        info!("screen share stopped");
        self.send_aux(&AuxMessage::ScreenShare { active: false });
        self.emit(NegotiatorEvent::ScreenShare { active: false });
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) {
        if !self.toggle_local(TrackKind::Audio, !muted) {
            return;
        }
        self.send_aux(&AuxMessage::Mute { muted });
    }

    pub fn set_camera_enabled(&mut self, enabled: bool) {
        if !self.toggle_local(TrackKind::Video, enabled) {
            return;
        }
        self.send_aux(&AuxMessage::Camera { enabled });
    }

    pub fn report_quality(&mut self, rtt_ms: u32, packet_loss_pct: f32) {
        if self.state != NegotiatorState::Connected {
            return;
        }
        self.send_aux(&AuxMessage::Quality {
            rtt_ms,
            packet_loss_pct,
        });
    }

    fn toggle_local(&mut self, kind: TrackKind, enabled: bool) -> bool {
        if self.state != NegotiatorState::Connected {
            debug!(?kind, "track toggle ignored outside a connected call");
            return false;
        }
        match self.session.as_mut() {
            Some(session) => {
                session.local.set_enabled(kind, enabled);
                true
            }
            None => false,
        }
    }

    /// Emit `ReturnedToChat` once the failure grace period has elapsed at `now`.
    pub fn poll_return_to_chat(&mut self, now: Instant) -> bool {
        match self.return_to_chat_at {
            Some(at) if now >= at => {
                self.return_to_chat_at = None;
                self.emit(NegotiatorEvent::ReturnedToChat);
                true
            }
            _ => false,
        }
    }

    /// Drive the negotiator until the command channel closes.
    ///
    /// Losing the relay ends any active call but keeps the loop alive for commands.
    pub async fn run(
        mut self,
        mut relay: mpsc::Receiver<ServerMessage>,
        mut commands: mpsc::Receiver<CallCommand>,
    ) {
        let mut relay_open = true;

        loop {
            let deadline = self.return_to_chat_at;
            tokio::select! {
                msg = relay.recv(), if relay_open => match msg {
                    Some(msg) => self.handle_relay_message(msg),
                    None => {
                        warn!("relay connection closed, ending any active call");
                        relay_open = false;
                        self.end_call();
                    }
                },
                Some((generation, event)) = self.peer_rx.recv() => {
                    self.handle_peer_event(generation, event);
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.poll_return_to_chat(Instant::now());
                }
            }
        }

        self.end_call();
        debug!("negotiator stopped");
    }

    fn handle_command(&mut self, cmd: CallCommand) {
        let result = match cmd {
            CallCommand::Start(call_type) => self.start_call(call_type),
            CallCommand::End => {
                self.end_call();
                Ok(())
            }
            CallCommand::StartScreenShare => self.start_screen_share(),
            CallCommand::StopScreenShare => self.stop_screen_share(),
            CallCommand::SetMuted(muted) => {
                self.set_muted(muted);
                Ok(())
            }
            CallCommand::SetCameraEnabled(enabled) => {
                self.set_camera_enabled(enabled);
                Ok(())
            }
            CallCommand::ReportQuality {
                rtt_ms,
                packet_loss_pct,
            } => {
                self.report_quality(rtt_ms, packet_loss_pct);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("call command failed: {}", err);
        }
    }

    // ---- internals ----

    fn install_session(
        &mut self,
        role: CallRole,
        call_type: CallType,
        mut local: M::Stream,
        remote: Option<String>,
    ) -> Result<()> {
        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.peer_tx.clone());
        let peer = match self.connector.connect(sink) {
            Ok(peer) => peer,
            Err(err) => {
                local.stop();
                return Err(err);
            }
        };

        self.session = Some(Session {
            generation: self.generation,
            role,
            call_type,
            remote,
            peer,
            local,
            screen: None,
            remote_tracks: Vec::new(),
            aux: None,
            pending_aux: Vec::new(),
            pending_candidates: Vec::new(),
            offer_outstanding: false,
            connected_at: None,
        });
        Ok(())
    }

    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.set_state(NegotiatorState::Idle);
            return;
        };

        let duration = session.connected_at.map(|at| at.elapsed());
        session.release();
        self.set_state(NegotiatorState::Closed);
        self.set_state(NegotiatorState::Idle);

        info!(generation = session.generation, ?duration, "call ended");
        self.emit(NegotiatorEvent::CallEnded { duration });
    }

    fn fail(&mut self, err: &Error) {
        self.teardown();
        self.return_to_chat_at = Some(Instant::now() + RETURN_TO_CHAT_GRACE);
        self.emit(NegotiatorEvent::CallFailed {
            reason: err.to_string(),
            retry_after: RETURN_TO_CHAT_GRACE,
        });
    }

    fn send_candidate(&self, candidate: IceCandidate, to: &str) {
        let payload = SignalPayload::IceCandidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
            to: Some(to.to_string()),
        };
        if let Err(err) = self.signals.send(&payload) {
            warn!(%to, "failed to send local candidate: {}", err);
        }
    }

    fn send_aux(&mut self, msg: &AuxMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sealed = match self.signals.channel.encrypt(msg) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("failed to seal aux message: {}", err);
                return;
            }
        };

        match session.aux.as_mut() {
            Some(aux) if aux.is_open() => {
                if let Err(err) = aux.send(&sealed) {
                    warn!("aux send failed: {}", err);
                }
            }
            _ => session.pending_aux.push(sealed),
        }
    }

    fn flush_aux(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(aux) = session.aux.as_mut() else {
            return;
        };
        if !aux.is_open() {
            return;
        }
        for sealed in session.pending_aux.drain(..) {
            if let Err(err) = aux.send(&sealed) {
                warn!("aux send failed: {}", err);
            }
        }
    }

    fn set_state(&mut self, state: NegotiatorState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "negotiator state");
        self.state = state;
        self.emit(NegotiatorEvent::StateChanged(state));
    }

    fn emit(&self, event: NegotiatorEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyMediaProvider, DummyPeerConnector};
    use hush_crypto::ChannelKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type DummyNegotiator = Negotiator<DummyMediaProvider, DummyPeerConnector>;

    struct Harness {
        negotiator: DummyNegotiator,
        relay_rx: mpsc::UnboundedReceiver<ClientMessage>,
        events_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
        live: Arc<AtomicUsize>,
        channel: SymmetricChannel,
    }

    impl Harness {
        fn new(key: &ChannelKey, media: DummyMediaProvider) -> Self {
            let (relay_tx, relay_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let live = media.live_streams();
            let channel = SymmetricChannel::new(key);
            let negotiator = Negotiator::new(
                media,
                DummyPeerConnector,
                channel.clone(),
                relay_tx,
                events_tx,
            );
            Self {
                negotiator,
                relay_rx,
                events_rx,
                live,
                channel,
            }
        }

        fn outbound(&mut self) -> Vec<SignalPayload> {
            let mut out = Vec::new();
            while let Ok(msg) = self.relay_rx.try_recv() {
                match msg {
                    ClientMessage::EncryptedSignaling { data } => {
                        out.push(self.channel.decrypt(&data).unwrap())
                    }
                    other => panic!("unexpected relay message {other:?}"),
                }
            }
            out
        }

        fn events(&mut self) -> Vec<NegotiatorEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                out.push(event);
            }
            out
        }

        fn aux_sent(&self) -> Vec<AuxMessage> {
            self.negotiator
                .peer()
                .map(|peer| peer.sent_data())
                .unwrap_or_default()
                .iter()
                .map(|sealed| self.channel.decrypt(sealed).unwrap())
                .collect()
        }
    }

    /// Shuttle sealed signaling between two negotiators until both go quiet.
    fn exchange(a: &mut Harness, b: &mut Harness) {
        loop {
            let mut moved = a.negotiator.pump_peer_events() + b.negotiator.pump_peer_events();
            while let Ok(ClientMessage::EncryptedSignaling { data }) = a.relay_rx.try_recv() {
                b.negotiator.handle_signal("a", &data);
                moved += 1;
            }
            while let Ok(ClientMessage::EncryptedSignaling { data }) = b.relay_rx.try_recv() {
                a.negotiator.handle_signal("b", &data);
                moved += 1;
            }
            if moved == 0 {
                break;
            }
        }
    }

    fn connected_pair(call_type: CallType) -> (Harness, Harness) {
        let key = ChannelKey::generate();
        let mut a = Harness::new(&key, DummyMediaProvider::new());
        let mut b = Harness::new(&key, DummyMediaProvider::new());
        a.negotiator.set_member_id("a");
        b.negotiator.set_member_id("b");
        a.negotiator.start_call(call_type).unwrap();
        exchange(&mut a, &mut b);
        assert_eq!(a.negotiator.state(), NegotiatorState::Connected);
        assert_eq!(b.negotiator.state(), NegotiatorState::Connected);
        (a, b)
    }

    #[test]
    fn test_end_call_before_any_connection() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        h.negotiator.end_call();
        h.negotiator.end_call();
        assert_eq!(h.negotiator.state(), NegotiatorState::Idle);
        assert!(h.events().is_empty());
        assert_eq!(h.live.load(Ordering::SeqCst), 0);
    }

    fn seal(h: &Harness, payload: SignalPayload) -> String {
        h.channel.encrypt(&payload).unwrap()
    }

    #[test]
    fn test_start_call_sends_offer_then_candidates_after_answer() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        h.negotiator.start_call(CallType::Video).unwrap();

        assert_eq!(
            h.negotiator.state(),
            NegotiatorState::Negotiating(CallRole::Offerer)
        );
        let out = h.outbound();
        assert_eq!(out.len(), 1);
        match &out[0] {
            SignalPayload::Offer { sdp, call_type } => {
                assert_eq!(*call_type, CallType::Video);
                assert!(sdp.contains("m=video"));
                assert!(sdp.contains("m=application"));
            }
            other => panic!("expected offer, got {other:?}"),
        }

        h.negotiator.pump_peer_events();
        assert!(h.outbound().is_empty(), "candidates wait for an answer");
        assert_eq!(h.negotiator.remote_member(), None);

        let answer = seal(
            &h,
            SignalPayload::Answer {
                sdp: "v=0".into(),
                to: None,
            },
        );
        h.negotiator.handle_signal("b", &answer);
        assert_eq!(h.negotiator.remote_member(), Some("b"));

        let candidates = h.outbound();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|p| matches!(
            p,
            SignalPayload::IceCandidate { to: Some(to), .. } if to == "b"
        )));
    }

    #[test]
    fn test_second_start_call_is_rejected() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        h.negotiator.start_call(CallType::Voice).unwrap();
        assert!(matches!(
            h.negotiator.start_call(CallType::Voice),
            Err(Error::State(_))
        ));
        assert_eq!(h.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_answerer_media_failure_aborts_and_schedules_return() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::failing());
        let offer = seal(
            &h,
            SignalPayload::Offer {
                sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".into(),
                call_type: CallType::Voice,
            },
        );

        h.negotiator.handle_signal("caller", &offer);
        assert_eq!(h.negotiator.state(), NegotiatorState::Idle);
        assert!(h.negotiator.peer().is_none());
        assert!(h.outbound().is_empty(), "no answer without media");
        assert_eq!(h.live.load(Ordering::SeqCst), 0);

        let events = h.events();
        assert!(matches!(
            events.as_slice(),
            [NegotiatorEvent::CallFailed { retry_after, .. }] if *retry_after == RETURN_TO_CHAT_GRACE
        ));
        let at = h.negotiator.return_to_chat_at().unwrap();
        assert!(h.negotiator.poll_return_to_chat(at));
        assert_eq!(h.events(), vec![NegotiatorEvent::ReturnedToChat]);
    }

    #[test]
    fn test_media_failure_aborts_and_schedules_return() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::failing());
        let err = h.negotiator.start_call(CallType::Video).unwrap_err();
        assert!(matches!(err, Error::Media(_)));
        assert_eq!(h.negotiator.state(), NegotiatorState::Idle);
        assert!(h.outbound().is_empty());

        let events = h.events();
        assert!(events.iter().any(|e| matches!(
            e,
            NegotiatorEvent::CallFailed { retry_after, .. } if *retry_after == RETURN_TO_CHAT_GRACE
        )));

        let at = h.negotiator.return_to_chat_at().unwrap();
        assert!(!h.negotiator.poll_return_to_chat(at - Duration::from_millis(1)));
        assert!(h.negotiator.poll_return_to_chat(at));
        assert_eq!(h.events(), vec![NegotiatorEvent::ReturnedToChat]);
        assert!(!h.negotiator.poll_return_to_chat(at + RETURN_TO_CHAT_GRACE));
    }

    #[test]
    fn test_undecryptable_signal_is_dropped() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        let foreign = SymmetricChannel::new(&ChannelKey::generate());
        let offer = foreign
            .encrypt(&SignalPayload::Offer {
                sdp: "v=0".into(),
                call_type: CallType::Voice,
            })
            .unwrap();

        h.negotiator.handle_signal("stranger", &offer);
        h.negotiator.handle_signal("stranger", "not even base64 !!");
        assert_eq!(h.negotiator.state(), NegotiatorState::Idle);
        assert!(h.negotiator.peer().is_none());
        assert!(h.outbound().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_answer_and_candidate_without_peer_are_dropped() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        let answer = h
            .channel
            .encrypt(&SignalPayload::Answer {
                sdp: "v=0".into(),
                to: None,
            })
            .unwrap();
        let candidate = h
            .channel
            .encrypt(&SignalPayload::IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
                to: None,
            })
            .unwrap();

        h.negotiator.handle_signal("peer", &answer);
        h.negotiator.handle_signal("peer", &candidate);
        assert_eq!(h.negotiator.state(), NegotiatorState::Idle);
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_stale_generation_events_are_ignored() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        h.negotiator.start_call(CallType::Voice).unwrap();
        let first = h.negotiator.generation();
        h.outbound();

        h.negotiator.end_call();
        assert_eq!(h.negotiator.pump_peer_events(), 2);
        assert!(h.outbound().is_empty());

        h.negotiator.start_call(CallType::Voice).unwrap();
        assert_eq!(h.negotiator.generation(), first + 1);
        h.negotiator.handle_peer_event(
            first,
            PeerEvent::StateChanged(PeerState::Connected),
        );
        assert_eq!(
            h.negotiator.state(),
            NegotiatorState::Negotiating(CallRole::Offerer)
        );
    }

    #[test]
    fn test_offer_answer_reaches_connected_with_notice() {
        let (mut a, mut b) = connected_pair(CallType::Voice);
        assert_eq!(a.negotiator.role(), Some(CallRole::Offerer));
        assert_eq!(b.negotiator.role(), Some(CallRole::Answerer));
        assert_eq!(b.negotiator.call_type(), Some(CallType::Voice));

        assert_eq!(a.aux_sent(), vec![AuxMessage::ConnectionEstablished]);
        assert_eq!(b.aux_sent(), vec![AuxMessage::ConnectionEstablished]);

        assert_eq!(a.negotiator.peer().unwrap().remote_candidates().len(), 2);
        assert_eq!(b.negotiator.peer().unwrap().remote_candidates().len(), 2);

        let a_states: Vec<_> = a
            .events()
            .into_iter()
            .filter_map(|e| match e {
                NegotiatorEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            a_states,
            vec![
                NegotiatorState::Negotiating(CallRole::Offerer),
                NegotiatorState::Connected
            ]
        );
    }

    #[test]
    fn test_end_call_releases_everything() {
        let (mut a, _b) = connected_pair(CallType::Video);
        assert_eq!(a.live.load(Ordering::SeqCst), 1);
        a.negotiator.start_screen_share().unwrap();
        assert_eq!(a.live.load(Ordering::SeqCst), 2);
        a.events();

        a.negotiator.end_call();
        assert_eq!(a.negotiator.state(), NegotiatorState::Idle);
        assert!(a.negotiator.peer().is_none());
        assert_eq!(a.live.load(Ordering::SeqCst), 0);

        let events = a.events();
        assert_eq!(
            events[..2],
            [
                NegotiatorEvent::StateChanged(NegotiatorState::Closed),
                NegotiatorEvent::StateChanged(NegotiatorState::Idle),
            ]
        );
        assert!(matches!(
            events[2],
            NegotiatorEvent::CallEnded { duration: Some(_) }
        ));

        a.negotiator.end_call();
        assert!(a.events().is_empty());
    }

    #[test]
    fn test_screen_share_swaps_and_restores_camera() {
        let (mut a, _b) = connected_pair(CallType::Video);
        let camera = a.negotiator.peer().unwrap().video_track().cloned().unwrap();
        assert!(camera.id.starts_with("cam-"));

        a.negotiator.start_screen_share().unwrap();
        assert!(a.negotiator.is_screen_sharing());
        let shared = a.negotiator.peer().unwrap().video_track().cloned().unwrap();
        assert!(shared.id.starts_with("screen-"));

        a.negotiator.stop_screen_share().unwrap();
        assert!(!a.negotiator.is_screen_sharing());
        assert_eq!(a.negotiator.peer().unwrap().video_track(), Some(&camera));

        assert_eq!(
            a.aux_sent(),
            vec![
                AuxMessage::ConnectionEstablished,
                AuxMessage::ScreenShare { active: true },
                AuxMessage::ScreenShare { active: false },
            ]
        );
    }

    #[test]
    fn test_screen_share_on_voice_call_restores_nothing() {
        let (mut a, _b) = connected_pair(CallType::Voice);
        a.negotiator.start_screen_share().unwrap();
        assert!(a.negotiator.peer().unwrap().video_track().is_some());
        a.negotiator.stop_screen_share().unwrap();
        assert!(a.negotiator.peer().unwrap().video_track().is_none());
    }

    #[test]
    fn test_toggles_are_noops_until_connected() {
        let mut h = Harness::new(&ChannelKey::generate(), DummyMediaProvider::new());
        h.negotiator.start_screen_share().unwrap();
        h.negotiator.set_muted(true);
        h.negotiator.set_camera_enabled(false);
        assert!(!h.negotiator.is_screen_sharing());
        assert!(h.events().is_empty());
        assert_eq!(h.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mute_and_quality_reach_aux_channel() {
        let (mut a, _b) = connected_pair(CallType::Video);
        a.negotiator.set_muted(true);
        a.negotiator.set_camera_enabled(false);
        a.negotiator.report_quality(42, 1.5);
        assert_eq!(
            a.aux_sent()[1..],
            [
                AuxMessage::Mute { muted: true },
                AuxMessage::Camera { enabled: false },
                AuxMessage::Quality {
                    rtt_ms: 42,
                    packet_loss_pct: 1.5
                },
            ]
        );
    }

    #[test]
    fn test_mute_and_camera_toggle_local_tracks() {
        let (mut a, _b) = connected_pair(CallType::Video);
        let enabled = |h: &Harness, kind| h.negotiator.local_stream().unwrap().is_enabled(kind);
        assert!(enabled(&a, TrackKind::Audio));
        assert!(enabled(&a, TrackKind::Video));

        a.negotiator.set_muted(true);
        a.negotiator.set_camera_enabled(false);
        assert!(!enabled(&a, TrackKind::Audio));
        assert!(!enabled(&a, TrackKind::Video));

        a.negotiator.set_muted(false);
        assert!(enabled(&a, TrackKind::Audio));
        assert!(!enabled(&a, TrackKind::Video));

        a.negotiator.set_camera_enabled(true);
        assert!(enabled(&a, TrackKind::Video));
    }

    #[test]
    fn test_inbound_aux_surfaces_as_peer_status() {
        let (mut a, _b) = connected_pair(CallType::Voice);
        a.events();
        let sealed = a.channel.encrypt(&AuxMessage::Mute { muted: true }).unwrap();
        a.negotiator.peer().unwrap().simulate_data(sealed);
        a.negotiator.peer().unwrap().simulate_data("garbage");
        a.negotiator.pump_peer_events();
        assert_eq!(
            a.events(),
            vec![NegotiatorEvent::PeerStatus(AuxMessage::Mute { muted: true })]
        );
    }

    #[test]
    fn test_peer_failure_tears_down() {
        let (mut a, _b) = connected_pair(CallType::Voice);
        a.events();
        a.negotiator
            .peer_mut()
            .unwrap()
            .simulate_state(PeerState::Failed);
        a.negotiator.pump_peer_events();

        assert_eq!(a.negotiator.state(), NegotiatorState::Idle);
        assert_eq!(a.live.load(Ordering::SeqCst), 0);
        let events = a.events();
        assert_eq!(
            events[0],
            NegotiatorEvent::StateChanged(NegotiatorState::Disconnected)
        );
    }

    #[test]
    fn test_offer_on_existing_session_renegotiates() {
        let (mut a, mut b) = connected_pair(CallType::Voice);
        let generation = b.negotiator.generation();
        let offer = a
            .channel
            .encrypt(&SignalPayload::Offer {
                sdp: a.negotiator.peer().unwrap().local_description().unwrap().sdp.clone(),
                call_type: CallType::Voice,
            })
            .unwrap();

        b.negotiator.handle_signal("a", &offer);
        assert_eq!(b.negotiator.generation(), generation);
        assert_eq!(b.negotiator.state(), NegotiatorState::Connected);
        assert!(matches!(b.outbound().as_slice(), [SignalPayload::Answer { .. }]));
    }

    #[test]
    fn test_offer_from_outside_the_call_is_ignored() {
        let (mut a, mut b) = connected_pair(CallType::Voice);
        let a_offer = b.negotiator.peer().unwrap().remote_description().cloned().unwrap();
        let generation = b.negotiator.generation();
        b.events();

        let intruder = seal(
            &b,
            SignalPayload::Offer {
                sdp: "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\n".into(),
                call_type: CallType::Video,
            },
        );
        b.negotiator.handle_signal("c", &intruder);
        a.negotiator.handle_signal("c", &intruder);

        assert_eq!(b.negotiator.generation(), generation);
        assert_eq!(b.negotiator.remote_member(), Some("a"));
        assert_eq!(
            b.negotiator.peer().unwrap().remote_description(),
            Some(&a_offer)
        );
        assert!(b.outbound().is_empty());
        assert!(a.outbound().is_empty());
        assert!(b.events().is_empty());
    }

    #[test]
    fn test_signaling_from_or_to_other_members_is_dropped() {
        let (_a, mut b) = connected_pair(CallType::Voice);
        let before = b.negotiator.peer().unwrap().remote_candidates().len();

        let stray = seal(
            &b,
            SignalPayload::IceCandidate {
                candidate: "candidate:9 1 udp 1 10.0.0.9 9 typ host".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
                to: Some("b".into()),
            },
        );
        b.negotiator.handle_signal("c", &stray);

        let misaddressed = seal(
            &b,
            SignalPayload::IceCandidate {
                candidate: "candidate:8 1 udp 1 10.0.0.8 8 typ host".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
                to: Some("c".into()),
            },
        );
        b.negotiator.handle_signal("a", &misaddressed);

        assert_eq!(
            b.negotiator.peer().unwrap().remote_candidates().len(),
            before
        );
    }

    #[test]
    fn test_first_answer_binds_the_call() {
        let key = ChannelKey::generate();
        let mut a = Harness::new(&key, DummyMediaProvider::new());
        a.negotiator.set_member_id("a");
        a.negotiator.start_call(CallType::Voice).unwrap();
        a.outbound();

        for answerer in ["b", "c"] {
            let answer = seal(
                &a,
                SignalPayload::Answer {
                    sdp: format!("v=0\r\no=- {answerer} 2 IN IP4 127.0.0.1\r\n"),
                    to: Some("a".into()),
                },
            );
            a.negotiator.handle_signal(answerer, &answer);
        }

        assert_eq!(a.negotiator.remote_member(), Some("b"));
        let remote = a.negotiator.peer().unwrap().remote_description().unwrap();
        assert!(remote.sdp.contains("o=- b "));
    }

    #[tokio::test]
    async fn test_run_driver_follows_call_allowed() {
        let key = ChannelKey::generate();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            DummyMediaProvider::new(),
            DummyPeerConnector,
            SymmetricChannel::new(&key),
            relay_tx,
            events_tx,
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let driver = tokio::spawn(negotiator.run(inbound_rx, command_rx));

        inbound_tx
            .send(ServerMessage::CallAllowed {
                call_type: CallType::Voice,
            })
            .await
            .unwrap();

        let first = relay_rx.recv().await.unwrap();
        assert!(matches!(first, ClientMessage::EncryptedSignaling { .. }));
        assert_eq!(
            events_rx.recv().await.unwrap(),
            NegotiatorEvent::StateChanged(NegotiatorState::Negotiating(CallRole::Offerer))
        );

        command_tx.send(CallCommand::End).await.unwrap();
        drop(command_tx);
        driver.await.unwrap();

        let mut saw_end = false;
        while let Ok(event) = events_rx.try_recv() {
            saw_end |= matches!(event, NegotiatorEvent::CallEnded { .. });
        }
        assert!(saw_end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_driver_returns_to_chat_after_grace() {
        let (relay_tx, _relay_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            DummyMediaProvider::failing(),
            DummyPeerConnector,
            SymmetricChannel::new(&ChannelKey::generate()),
            relay_tx,
            events_tx,
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let driver = tokio::spawn(negotiator.run(inbound_rx, command_rx));

        let started = Instant::now();
        command_tx
            .send(CallCommand::Start(CallType::Video))
            .await
            .unwrap();
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            NegotiatorEvent::CallFailed { .. }
        ));

        assert_eq!(
            events_rx.recv().await.unwrap(),
            NegotiatorEvent::ReturnedToChat
        );
        assert!(started.elapsed() >= RETURN_TO_CHAT_GRACE);

        drop(inbound_tx);
        drop(command_tx);
        driver.await.unwrap();
    }
}
