use crate::message::{PeerId, RosterUpdate};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// Decides which side of a peer pair sends the offer.
///
/// Pairs explicitly announced by the relay are authoritative. Any other pair falls back to a
/// lexicographic tie-break: the smaller identifier initiates. Both ends of a pair compute the
/// same answer from the same roster without talking to each other.
#[derive(Debug, Default, Clone)]
pub struct GlareResolver {
    assigned: HashMap<(PeerId, PeerId), PeerId>,
}

impl GlareResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the designated initiator of an unordered pair.
    pub fn initiator<'a>(&'a self, a: &'a PeerId, b: &'a PeerId) -> &'a PeerId {
        match self.assigned.get(&pair(a, b)) {
            Some(initiator) => initiator,
            None => tie_break(a, b),
        }
    }

    pub fn is_initiator(&self, local: &PeerId, remote: &PeerId) -> bool {
        self.initiator(local, remote) == local
    }

    /// Records relay-assigned `(initiator, new member)` pairs. If a single announcement names
    /// both directions of the same pair, the tie-break decides.
    pub fn record(&mut self, offers: &[(PeerId, PeerId)]) {
        let mut batch: HashMap<(PeerId, PeerId), PeerId> = HashMap::new();
        for (initiator, joiner) in offers {
            if initiator == joiner {
                continue;
            }
            match batch.entry(pair(initiator, joiner)) {
                Entry::Vacant(e) => {
                    e.insert(initiator.clone());
                }
                Entry::Occupied(mut e) => {
                    if e.get() != initiator {
                        let winner = tie_break(initiator, joiner).clone();
                        e.insert(winner);
                    }
                }
            }
        }
        self.assigned.extend(batch);
    }

    /// Applies a roster announcement and returns the peers the local side must send an offer
    /// to, in announcement order.
    ///
    /// With an explicit pair list only the listed pairs are considered. Without one, every
    /// roster member is paired with the local peer and the tie-break decides. Either way peers
    /// which already have a session are skipped.
    pub fn plan<F>(&mut self, local: &PeerId, update: &RosterUpdate, has_session: F) -> Vec<PeerId>
    where
        F: Fn(&PeerId) -> bool,
    {
        let mut targets: Vec<PeerId> = Vec::new();
        match &update.offers {
            Some(offers) => {
                self.record(offers);
                for (a, b) in offers {
                    let remote = if a == local {
                        b
                    } else if b == local {
                        a
                    } else {
                        continue;
                    };
                    if remote != local
                        && !has_session(remote)
                        && self.is_initiator(local, remote)
                        && !targets.contains(remote)
                    {
                        targets.push(remote.clone());
                    }
                }
            }
            None => {
                for remote in update.users.iter() {
                    if remote != local
                        && !has_session(remote)
                        && self.is_initiator(local, remote)
                        && !targets.contains(remote)
                    {
                        targets.push(remote.clone());
                    }
                }
            }
        }
        targets
    }

    /// Forgets assignments involving peers no longer present.
    pub fn retain(&mut self, roster: &HashSet<PeerId>) {
        self.assigned
            .retain(|(a, b), _| roster.contains(a) && roster.contains(b));
    }
}

fn tie_break<'a>(a: &'a PeerId, b: &'a PeerId) -> &'a PeerId {
    if a <= b {
        a
    } else {
        b
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
