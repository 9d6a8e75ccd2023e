//! Interfaces of the external collaborators: the platform media connection, local capture
//! and the relay bus. [crate::rtc] implements the media side on top of webrtc-rs.

use crate::error::Error;
use crate::message::{Candidate, PeerId, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc::UnboundedReceiver;

/// Notifications emitted by a [MediaConnection]. They're delivered only to the peer session
/// owning the connection.
#[derive(Debug)]
pub enum MediaEvent<T> {
    /// A local connectivity candidate has been discovered and should be sent to the remote.
    CandidateDiscovered(Candidate),
    /// Remote side started sending media.
    TrackReceived(T),
    /// Connection asks for a new offer/answer round.
    NegotiationNeeded,
    /// Connection reached a terminal failure and can't be used anymore.
    Failed,
}

pub type MediaEvents<T> = UnboundedReceiver<MediaEvent<T>>;

/// The raw negotiation primitive supplied by the platform.
#[async_trait]
pub trait MediaConnection: Send + Sync + 'static {
    type RemoteTrack: Send + 'static;

    async fn create_offer(&self) -> Result<SessionDescription, Error>;
    async fn create_answer(&self) -> Result<SessionDescription, Error>;
    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error>;
    async fn add_candidate(&self, candidate: Candidate) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

pub type RemoteTrackOf<F> = <<F as ConnectionFactory>::Connection as MediaConnection>::RemoteTrack;

/// Creates a fresh [MediaConnection] for a remote peer, with local tracks already attached.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: MediaConnection;
    type LocalTrack: Clone + Send + Sync + 'static;

    async fn create(
        &self,
        peer: &PeerId,
        local_tracks: &[Self::LocalTrack],
    ) -> Result<(Self::Connection, MediaEvents<RemoteTrackOf<Self>>), Error>;
}

/// Source of local camera/microphone tracks.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    type Track: Clone + Send + Sync + 'static;

    /// Fails with [Error::Capture] when permission is denied or no device is present.
    async fn acquire_local_tracks(&self) -> Result<Vec<Self::Track>, Error>;
}

/// Publish/subscribe relay transport.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), Error>;

    /// Subscribes to a topic. The stream yields an error (or ends) when the connection to the
    /// relay is lost.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error>;
}
