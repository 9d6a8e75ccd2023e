//! Relay-side roster bookkeeping.
//!
//! The relay itself only fans messages out, but it's also the authority on who is present.
//! [Room] tracks members in join order and produces the `new_user` / `user_left`
//! announcements consumed by [crate::dispatcher::Dispatcher].

use crate::error::Error;
use crate::message::{Envelope, PeerId, Roster, RosterUpdate};

#[derive(Debug, Clone)]
pub struct Room {
    /// Identifier used as a sender of roster announcements.
    relay_id: PeerId,
    members: Vec<PeerId>,
}

impl Room {
    pub fn new(relay_id: PeerId) -> Self {
        Room {
            relay_id,
            members: Vec::new(),
        }
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    /// Registers a new member and returns the `new_user` announcement. Every existing member
    /// is designated as initiator towards the newcomer. A repeated join re-announces the
    /// current roster without any initiator pairs.
    pub fn join(&mut self, peer: PeerId) -> Result<Envelope, Error> {
        let offers = if self.members.contains(&peer) {
            Vec::new()
        } else {
            let offers = self
                .members
                .iter()
                .map(|existing| (existing.clone(), peer.clone()))
                .collect();
            self.members.push(peer);
            offers
        };
        let update = RosterUpdate {
            users: self.members.clone(),
            offers: Some(offers),
        };
        Envelope::new_user(self.relay_id.clone(), &update)
    }

    /// Removes a member and returns the `user_left` announcement carrying the remaining
    /// roster, or `None` when the peer wasn't a member.
    pub fn leave(&mut self, peer: &PeerId) -> Result<Option<Envelope>, Error> {
        let before = self.members.len();
        self.members.retain(|member| member != peer);
        if self.members.len() == before {
            return Ok(None);
        }
        let roster = Roster {
            users: self.members.clone(),
        };
        Ok(Some(Envelope::user_left(self.relay_id.clone(), &roster)?))
    }
}
