//! [MediaConnection] implementation backed by [webrtc](https://webrtc.rs).

use crate::error::Error;
use crate::media::{CaptureProvider, ConnectionFactory, MediaConnection, MediaEvent, MediaEvents};
use crate::message::{Candidate, PeerId, SessionDescription};
use async_trait::async_trait;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::spawn_blocking;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Clone)]
pub struct Options {
    pub rtc_config: RTCConfiguration,
}

impl Options {
    pub fn with_ice_servers(urls: &[&str]) -> Self {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: urls.iter().map(|&url| url.to_owned()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Options { rtc_config }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_ice_servers(&["stun:stun.l.google.com:19302"])
    }
}

/// Creates one [RTCPeerConnection] per remote peer, sharing a single configured [API].
pub struct RtcConnectionFactory {
    api: API,
    options: Options,
}

impl RtcConnectionFactory {
    pub fn new(options: Options) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // RTP/RTCP pipeline: NACKs, RTCP reports etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(RtcConnectionFactory { api, options })
    }
}

impl std::fmt::Debug for RtcConnectionFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnectionFactory")
            .field("ice_servers", &self.options.rtc_config.ice_servers.len())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    type Connection = RtcConnection;
    type LocalTrack = LocalTrack;

    async fn create(
        &self,
        peer: &PeerId,
        local_tracks: &[LocalTrack],
    ) -> Result<(RtcConnection, MediaEvents<Arc<TrackRemote>>), Error> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.options.rtc_config.clone())
                .await?,
        );
        let (events_tx, events) = unbounded_channel();

        {
            let events = events_tx.clone();
            let peer = peer.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json().map(serde_json::to_value) {
                        Ok(Ok(json)) => {
                            let _ = events.send(MediaEvent::CandidateDiscovered(Candidate(json)));
                        }
                        Ok(Err(e)) => log::warn!("failed to encode candidate for {}: {}", peer, e),
                        Err(e) => log::warn!("failed to encode candidate for {}: {}", peer, e),
                    }
                } else {
                    // gathering complete
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events_tx.clone();
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                    let _ = events.send(MediaEvent::TrackReceived(track));
                    Box::pin(async move {})
                },
            ));
        }
        {
            let events = events_tx.clone();
            let peer = peer.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                log::debug!("connection with {} is {}", peer, s);
                if s == RTCPeerConnectionState::Failed {
                    let _ = events.send(MediaEvent::Failed);
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events_tx;
            pc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(MediaEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }

        for track in local_tracks {
            pc.add_track(track.clone()).await?;
        }

        let conn = RtcConnection {
            peer: peer.clone(),
            pc,
        };
        Ok((conn, events))
    }
}

pub struct RtcConnection {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
}

impl RtcConnection {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

fn to_description(sdp: SessionDescription) -> Result<RTCSessionDescription, Error> {
    Ok(serde_json::from_value(sdp.0)?)
}

fn from_description(desc: RTCSessionDescription) -> Result<SessionDescription, Error> {
    Ok(SessionDescription(serde_json::to_value(desc)?))
}

#[async_trait]
impl MediaConnection for RtcConnection {
    type RemoteTrack = Arc<TrackRemote>;

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        from_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        from_description(answer)
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.pc.set_local_description(to_description(sdp)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(to_description(sdp)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), Error> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(Error::candidate)
    }

    async fn close(&self) -> Result<(), Error> {
        // RTCPeerConnection::close future is not Send, so it's driven on a blocking thread
        let pc = self.pc.clone();
        let handle = Handle::current();
        match spawn_blocking(move || handle.block_on(pc.close())).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(webrtc::Error::new(format!("close task failed: {}", e)).into()),
        }
    }
}

impl AsRef<RTCPeerConnection> for RtcConnection {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for RtcConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnection")
            .field("peer", &self.peer)
            .field("state", &self.pc.connection_state())
            .finish()
    }
}

/// Capture provider over tracks the application has already opened, eg. a
/// `TrackLocalStaticSample` fed from a file or a device.
#[derive(Clone, Default)]
pub struct StaticTracks(Vec<LocalTrack>);

impl StaticTracks {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        StaticTracks(tracks)
    }
}

#[async_trait]
impl CaptureProvider for StaticTracks {
    type Track = LocalTrack;

    async fn acquire_local_tracks(&self) -> Result<Vec<LocalTrack>, Error> {
        if self.0.is_empty() {
            Err(Error::Capture("no local media device".to_owned()))
        } else {
            Ok(self.0.clone())
        }
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::media::{CaptureProvider, ConnectionFactory, MediaConnection};
    use crate::message::{Candidate, PeerId};
    use crate::rtc::{LocalTrack, Options, RtcConnectionFactory, StaticTracks};
    use crate::session::{NegotiationState, PeerSession, SessionStatus};
    use serde_json::json;
    use std::sync::Arc;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn audio_track(stream: &str) -> LocalTrack {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream.to_owned(),
        ))
    }

    fn offline() -> Options {
        Options {
            rtc_config: RTCConfiguration::default(),
        }
    }

    #[tokio::test]
    async fn sessions_negotiate_over_webrtc() -> Result<(), Error> {
        let factory = RtcConnectionFactory::new(offline())?;
        let alice_id = PeerId::new("alice");
        let bob_id = PeerId::new("bob");

        let (to_bob, _alice_events) = factory.create(&bob_id, &[audio_track("alice")]).await?;
        let (to_alice, _bob_events) = factory.create(&alice_id, &[audio_track("bob")]).await?;
        let mut alice = PeerSession::new(bob_id, to_bob, SessionStatus::default(), 50);
        let mut bob = PeerSession::new(alice_id, to_alice, SessionStatus::default(), 50);

        let offer = alice.initiate().await?;
        assert_eq!(offer.0["type"], "offer");
        let answer = bob.accept_offer(offer).await?;
        assert_eq!(answer.0["type"], "answer");
        alice.accept_answer(answer).await?;

        assert_eq!(alice.state(), NegotiationState::Stable);
        assert_eq!(bob.state(), NegotiationState::Stable);

        alice.close().await;
        bob.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_candidate_is_rejected() -> Result<(), Error> {
        let factory = RtcConnectionFactory::new(offline())?;
        let (conn, _events) = factory.create(&PeerId::new("bob"), &[]).await?;

        let err = conn.add_candidate(Candidate(json!(42))).await.unwrap_err();
        assert!(err.is_protocol_violation());

        conn.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn connection_closes_from_spawned_task() -> Result<(), Error> {
        let factory = RtcConnectionFactory::new(offline())?;
        let (conn, _events) = factory.create(&PeerId::new("bob"), &[audio_track("alice")]).await?;
        let conn = Arc::new(conn);

        let closing = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close().await }
        });
        match closing.await {
            Ok(result) => result?,
            Err(e) => panic!("close task panicked: {}", e),
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_device_is_a_capture_error() {
        let capture = StaticTracks::default();
        match capture.acquire_local_tracks().await {
            Err(Error::Capture(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(tracks) => panic!("acquired {} tracks without a device", tracks.len()),
        }

        let capture = StaticTracks::new(vec![audio_track("local")]);
        match capture.acquire_local_tracks().await {
            Ok(tracks) => assert_eq!(tracks.len(), 1),
            Err(e) => panic!("capture failed: {}", e),
        }
    }

    #[test]
    fn default_options_use_public_stun() {
        let options = Options::default();
        assert_eq!(
            options.rtc_config.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_owned()]
        );
    }
}
