//! Wire format exchanged over the relay bus: one JSON object per message.
//!
//! ```json
//! { "type": "offer", "sender": "alice", "target": "bob", "roomId": "r1", "data": { ... } }
//! ```
//!
//! Descriptions and candidates are opaque to this crate. They're carried as raw JSON values
//! and handed to the [crate::media::MediaConnection] exactly as received.

use crate::error::Error;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Formatter;
use std::sync::Arc;

/// Opaque identifier of a call participant, assigned by the relay.
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: &str) -> Self {
        PeerId(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(Arc::from(value))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.0, f)
    }
}

/// Session description payload (offer or answer).
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

/// Connectivity candidate payload.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub Value);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Join,
    NewUser,
    Offer,
    Answer,
    Candidate,
    UserLeft,
}

/// Roster announced by the relay when somebody joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterUpdate {
    pub users: Vec<PeerId>,
    /// `(initiator, new member)` pairs. When present, authoritative. When absent, pairs are
    /// derived locally by the glare resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offers: Option<Vec<(PeerId, PeerId)>>,
}

/// Roster remaining after somebody left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub users: Vec<PeerId>,
}

/// Single message travelling through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: PeerId,
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Typed view over an [Envelope] payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Join,
    NewUser(RosterUpdate),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(Candidate),
    UserLeft(Roster),
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn join(sender: PeerId) -> Self {
        Self::untargeted(MessageKind::Join, sender, None)
    }

    pub fn new_user(sender: PeerId, update: &RosterUpdate) -> Result<Self, Error> {
        let data = serde_json::to_value(update)?;
        Ok(Self::untargeted(MessageKind::NewUser, sender, Some(data)))
    }

    pub fn user_left(sender: PeerId, roster: &Roster) -> Result<Self, Error> {
        let data = serde_json::to_value(roster)?;
        Ok(Self::untargeted(MessageKind::UserLeft, sender, Some(data)))
    }

    pub fn offer(sender: PeerId, target: PeerId, sdp: SessionDescription) -> Self {
        Self::targeted(MessageKind::Offer, sender, target, sdp.0)
    }

    pub fn answer(sender: PeerId, target: PeerId, sdp: SessionDescription) -> Self {
        Self::targeted(MessageKind::Answer, sender, target, sdp.0)
    }

    pub fn candidate(sender: PeerId, target: PeerId, candidate: Candidate) -> Self {
        Self::targeted(MessageKind::Candidate, sender, target, candidate.0)
    }

    pub fn with_room(mut self, room_id: Option<String>) -> Self {
        self.room_id = room_id;
        self
    }

    /// Decodes the payload according to the message kind.
    pub fn signal(&self) -> Result<Signal, Error> {
        match self.kind {
            MessageKind::Join => Ok(Signal::Join),
            MessageKind::NewUser => Ok(Signal::NewUser(self.payload()?)),
            MessageKind::UserLeft => Ok(Signal::UserLeft(self.payload()?)),
            MessageKind::Offer => Ok(Signal::Offer(SessionDescription(self.raw_payload()?))),
            MessageKind::Answer => Ok(Signal::Answer(SessionDescription(self.raw_payload()?))),
            MessageKind::Candidate => Ok(Signal::Candidate(Candidate(self.raw_payload()?))),
        }
    }

    fn untargeted(kind: MessageKind, sender: PeerId, data: Option<Value>) -> Self {
        Envelope {
            kind,
            sender,
            room_id: None,
            target: None,
            data,
        }
    }

    fn targeted(kind: MessageKind, sender: PeerId, target: PeerId, data: Value) -> Self {
        Envelope {
            kind,
            sender,
            room_id: None,
            target: Some(target),
            data: Some(data),
        }
    }

    fn raw_payload(&self) -> Result<Value, Error> {
        match &self.data {
            Some(Value::Null) | None => Err(Error::protocol(format!(
                "{:?} from {} carries no payload",
                self.kind, self.sender
            ))),
            Some(value) => Ok(value.clone()),
        }
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(self.raw_payload()?)?)
    }
}
