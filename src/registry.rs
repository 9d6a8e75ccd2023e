use crate::error::Error;
use crate::message::{Candidate, PeerId, SessionDescription};
use crate::session::{NegotiationState, SessionStatus};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Mailbox protocol of a peer session worker. Commands are processed one at a time, in the
/// order they were sent.
#[derive(Debug)]
pub(crate) enum Command {
    Initiate(Option<oneshot::Sender<Result<(), Error>>>),
    Offer {
        sdp: SessionDescription,
        local_initiates: bool,
    },
    Answer(SessionDescription),
    Candidate(Candidate),
    Inspect(oneshot::Sender<NegotiationState>),
    Close,
}

/// Registry-side reference to a running peer session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    status: SessionStatus,
    commands: UnboundedSender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(status: SessionStatus, commands: UnboundedSender<Command>) -> Self {
        SessionHandle { status, commands }
    }

    pub fn state(&self) -> NegotiationState {
        self.status.state()
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_closed() && !self.commands.is_closed()
    }

    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Marks the session closed right away, so that any step still in flight discards its
    /// result, then asks the worker to release the connection.
    fn close(&self) {
        self.status.close();
        let _ = self.commands.send(Command::Close);
    }
}

/// Owns the single live session of every known remote peer.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<PeerId, SessionHandle>,
    /// Last roster announced by the relay. `None` until the first announcement.
    roster: Option<HashSet<PeerId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live session of a peer, if any.
    pub fn get(&self, peer: &PeerId) -> Option<&SessionHandle> {
        self.sessions.get(peer).filter(|handle| handle.is_live())
    }

    /// Returns the live session of a peer, creating it with `spawn` if absent. A session that
    /// has terminated on its own is replaced.
    pub fn get_or_create<F>(&mut self, peer: &PeerId, spawn: F) -> &SessionHandle
    where
        F: FnOnce() -> SessionHandle,
    {
        match self.sessions.entry(peer.clone()) {
            Entry::Occupied(mut e) => {
                if !e.get().is_live() {
                    log::debug!("replacing terminated session with {}", peer);
                    e.insert(spawn());
                }
                e.into_mut()
            }
            Entry::Vacant(e) => {
                log::debug!("creating session with {}", peer);
                e.insert(spawn())
            }
        }
    }

    /// Closes and forgets the session of a peer. Removing an absent peer is a no-op.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.sessions.remove(peer) {
            Some(handle) => {
                handle.close();
                log::info!("removed session with {}", peer);
                true
            }
            None => false,
        }
    }

    /// Closes every session whose peer is missing from the active roster. Never creates
    /// sessions. Returns the removed peers.
    pub fn reconcile(&mut self, active: &[PeerId]) -> Vec<PeerId> {
        let roster: HashSet<PeerId> = active.iter().cloned().collect();
        let stale: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(peer, handle)| !roster.contains(*peer) || !handle.is_live())
            .map(|(peer, _)| peer.clone())
            .collect();
        let mut removed = Vec::new();
        for peer in stale {
            if let Some(handle) = self.sessions.remove(&peer) {
                if handle.is_live() {
                    handle.close();
                    removed.push(peer);
                }
            }
        }
        if !removed.is_empty() {
            log::info!("roster reconciled, removed sessions: {:?}", removed);
        }
        self.roster = Some(roster);
        removed
    }

    /// Checks whether a peer may own a session: always true until the first roster arrives,
    /// afterwards only for roster members.
    pub fn admits(&self, peer: &PeerId) -> bool {
        match &self.roster {
            None => true,
            Some(roster) => roster.contains(peer),
        }
    }

    /// Adds a newly joined peer to the last known roster, ahead of the relay's next
    /// announcement. Before the first roster everyone is admitted anyway.
    pub fn admit(&mut self, peer: &PeerId) {
        if let Some(roster) = &mut self.roster {
            roster.insert(peer.clone());
        }
    }

    pub fn roster(&self) -> Option<&HashSet<PeerId>> {
        self.roster.as_ref()
    }

    /// Live peers, in no particular order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.values().filter(|h| h.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every session and forgets the roster.
    pub fn clear(&mut self) -> Vec<PeerId> {
        self.roster = None;
        let mut removed = Vec::with_capacity(self.sessions.len());
        for (peer, handle) in self.sessions.drain() {
            handle.close();
            removed.push(peer);
        }
        removed
    }
}
