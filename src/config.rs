use crate::message::PeerId;
use crate::queue;

pub const DEFAULT_PUBLISH_TOPIC: &str = "/app/message";
pub const DEFAULT_SUBSCRIBE_TOPIC: &str = "/topic/message";

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the local participant, assigned by the relay.
    pub local_id: PeerId,
    /// When set, outbound messages are stamped with it and inbound messages for other rooms
    /// are ignored.
    pub room_id: Option<String>,
    pub publish_topic: String,
    pub subscribe_topic: String,
    /// Max number of early candidates buffered per peer.
    pub candidate_queue_capacity: usize,
}

impl Config {
    pub fn new<P: Into<PeerId>>(local_id: P) -> Self {
        Config {
            local_id: local_id.into(),
            room_id: None,
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_owned(),
            subscribe_topic: DEFAULT_SUBSCRIBE_TOPIC.to_owned(),
            candidate_queue_capacity: queue::DEFAULT_CAPACITY,
        }
    }

    pub fn with_room<S: Into<String>>(mut self, room_id: S) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}
