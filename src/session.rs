use crate::error::Error;
use crate::media::MediaConnection;
use crate::message::{Candidate, PeerId, SessionDescription};
use crate::queue::CandidateQueue;
use arc_swap::{ArcSwap, Guard};
use std::fmt::Formatter;
use std::sync::Arc;

/// Negotiation progress of a single peer session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    /// No description has been exchanged yet.
    Idle,
    /// Local offer has been created, installed and sent. Waiting for an answer.
    OfferSent,
    /// Remote offer has been installed, local answer is being prepared.
    OfferReceived,
    /// Both descriptions are installed.
    Stable,
    /// Session has been destroyed. Terminal.
    Closed,
}

impl NegotiationState {
    pub fn is_closed(&self) -> bool {
        *self == NegotiationState::Closed
    }
}

/// Lock-free cell holding the [NegotiationState] of one session. Written by the session's
/// owner, readable by anyone holding a clone. Once `Closed`, it never changes again.
#[repr(transparent)]
#[derive(Debug, Clone)]
pub struct SessionStatus(Arc<ArcSwap<NegotiationState>>);

impl SessionStatus {
    pub fn get(&self) -> Guard<Arc<NegotiationState>> {
        self.0.load()
    }

    pub fn state(&self) -> NegotiationState {
        **self.0.load()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Moves to a new state. Fails if the session has been closed in the meantime.
    fn update(&self, new_state: NegotiationState) -> bool {
        let old = self.0.rcu(move |old| {
            if old.is_closed() {
                old.clone()
            } else {
                Arc::new(new_state)
            }
        });
        !old.is_closed()
    }

    /// Marks the session as closed. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let old = self.0.swap(Arc::new(NegotiationState::Closed));
        !old.is_closed()
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus(Arc::new(ArcSwap::from_pointee(NegotiationState::Idle)))
    }
}

/// What to do with an inbound offer, given the current state and glare policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Session is idle: answer it.
    Accept,
    /// Glare, and the remote side is the designated initiator: drop the local offer and answer.
    Restart,
    /// Glare, and the local side is the designated initiator: the remote will answer ours.
    IgnoreGlare,
    /// Offer doesn't fit the current state (duplicate, stale or closed session).
    Stale,
}

/// Negotiation state machine of a single remote peer. Exclusively owns its media connection
/// and candidate queue.
pub struct PeerSession<C> {
    peer: PeerId,
    conn: C,
    status: SessionStatus,
    queue: CandidateQueue,
    has_sent_offer: bool,
    remote_installed: bool,
    /// Remote candidates are dropped until its next description arrives.
    discard_candidates: bool,
}

impl<C: MediaConnection> PeerSession<C> {
    pub fn new(peer: PeerId, conn: C, status: SessionStatus, queue_capacity: usize) -> Self {
        PeerSession {
            peer,
            conn,
            status,
            queue: CandidateQueue::new(queue_capacity),
            has_sent_offer: false,
            remote_installed: false,
            discard_candidates: false,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> NegotiationState {
        self.status.state()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn has_sent_offer(&self) -> bool {
        self.has_sent_offer
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_installed
    }

    pub fn pending_candidates(&self) -> usize {
        self.queue.len()
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Local initiate: creates and installs an offer. The returned description must be sent to
    /// the remote peer. On failure the session stays `Idle`.
    pub async fn initiate(&mut self) -> Result<SessionDescription, Error> {
        let state = self.state();
        if state != NegotiationState::Idle {
            return Err(Error::protocol(format!(
                "can't initiate towards {} while {:?}",
                self.peer, state
            )));
        }
        let offer = self.conn.create_offer().await?;
        self.ensure_live()?;
        self.conn.set_local_description(offer.clone()).await?;
        self.ensure_live()?;
        self.has_sent_offer = true;
        self.transition(NegotiationState::OfferSent)?;
        Ok(offer)
    }

    pub fn offer_disposition(&self, local_initiates: bool) -> OfferDisposition {
        match self.state() {
            NegotiationState::Idle => OfferDisposition::Accept,
            NegotiationState::OfferSent if local_initiates => OfferDisposition::IgnoreGlare,
            NegotiationState::OfferSent => OfferDisposition::Restart,
            _ => OfferDisposition::Stale,
        }
    }

    /// Replaces the media connection with a fresh one and returns to `Idle`, returning the old
    /// connection so the caller can close it. Used after losing a glare race and after a failed
    /// answer left a remote offer installed. Queued candidates are kept.
    ///
    /// On a closed session the fresh connection is closed right away and [Error::Closed] is
    /// returned.
    pub async fn restart(&mut self, conn: C) -> Result<C, Error> {
        if let Err(e) = self.transition(NegotiationState::Idle) {
            if let Err(cause) = conn.close().await {
                log::warn!("failed to close unused connection with {}: {}", self.peer, cause);
            }
            return Err(e);
        }
        log::debug!("restarting session with {} on a fresh connection", self.peer);
        self.has_sent_offer = false;
        self.remote_installed = false;
        self.discard_candidates = false;
        Ok(std::mem::replace(&mut self.conn, conn))
    }

    /// Whether the connection holds a remote offer that was never answered. Such a connection
    /// can't create offers anymore and must be replaced with [PeerSession::restart].
    pub fn needs_restart(&self) -> bool {
        self.remote_installed && self.state() == NegotiationState::Idle
    }

    /// Remote abandoned its own offer in favour of ours: candidates gathered for that offer
    /// are discarded, both queued ones and those still arriving before its answer.
    pub fn abandon_remote_candidates(&mut self) {
        if !self.queue.is_empty() {
            log::debug!(
                "discarding {} candidates of abandoned offer from {}",
                self.queue.len(),
                self.peer
            );
        }
        self.queue.clear();
        self.discard_candidates = true;
    }

    /// Inbound offer on an idle session: installs it, drains queued candidates, then creates
    /// and installs an answer which must be sent back. On failure the session returns to
    /// `Idle`; if the offer got installed, [PeerSession::needs_restart] reports it.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, Error> {
        let state = self.state();
        if state != NegotiationState::Idle {
            return Err(Error::protocol(format!(
                "offer from {} rejected while {:?}",
                self.peer, state
            )));
        }
        self.conn.set_remote_description(offer).await?;
        self.ensure_live()?;
        self.remote_installed = true;
        self.transition(NegotiationState::OfferReceived)?;
        self.queue.drain_into(&self.peer, &self.conn).await;
        self.ensure_live()?;

        match self.answer().await {
            Ok(answer) => {
                self.transition(NegotiationState::Stable)?;
                Ok(answer)
            }
            Err(e) => {
                let _ = self.transition(state);
                Err(e)
            }
        }
    }

    async fn answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.conn.create_answer().await?;
        self.ensure_live()?;
        self.conn.set_local_description(answer.clone()).await?;
        self.ensure_live()?;
        Ok(answer)
    }

    /// Inbound answer. Accepted only while our offer is outstanding; anything else is a stale
    /// or duplicate delivery and leaves the state untouched.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), Error> {
        let state = self.state();
        if state != NegotiationState::OfferSent {
            return Err(Error::protocol(format!(
                "stale answer from {} while {:?}",
                self.peer, state
            )));
        }
        self.conn.set_remote_description(answer).await?;
        self.ensure_live()?;
        self.remote_installed = true;
        self.discard_candidates = false;
        self.queue.drain_into(&self.peer, &self.conn).await;
        self.ensure_live()?;
        self.transition(NegotiationState::Stable)
    }

    /// Inbound candidate: applied right away once a remote description is installed, queued
    /// otherwise. Failures to apply are logged and never affect negotiation state.
    pub async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), Error> {
        self.ensure_live()?;
        if self.remote_installed {
            if let Err(e) = self.conn.add_candidate(candidate).await {
                log::warn!("candidate from {} rejected: {}", self.peer, e);
            }
        } else if self.discard_candidates {
            log::debug!("dropped candidate of abandoned offer from {}", self.peer);
        } else {
            self.queue.enqueue(&self.peer, candidate);
        }
        Ok(())
    }

    /// Releases the media connection and discards pending candidates.
    pub async fn close(&mut self) {
        self.status.close();
        self.queue.clear();
        if let Err(e) = self.conn.close().await {
            log::warn!("failed to close connection with {}: {}", self.peer, e);
        }
        log::debug!("session with {} closed", self.peer);
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.status.is_closed() {
            Err(Error::Closed(self.peer.clone()))
        } else {
            Ok(())
        }
    }

    fn transition(&self, state: NegotiationState) -> Result<(), Error> {
        if self.status.update(state) {
            log::debug!("session with {} is now {:?}", self.peer, state);
            Ok(())
        } else {
            Err(Error::Closed(self.peer.clone()))
        }
    }
}

impl<C> std::fmt::Debug for PeerSession<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("state", &**self.status.get())
            .field("pending_candidates", &self.queue.len())
            .field("has_sent_offer", &self.has_sent_offer)
            .finish()
    }
}
