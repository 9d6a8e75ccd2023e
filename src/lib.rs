//! `meshcall` manages WebRTC signaling for multi-party audio/video calls where every
//! participant holds a direct media connection with every other participant (full mesh):
//! - One negotiation session per remote peer, driven by its own task, so messages for a
//!   peer are applied strictly in arrival order while different peers progress concurrently.
//! - Offer/answer glare is resolved deterministically: initiator pairs announced by the relay
//!   win, otherwise the lexicographically smaller peer id offers.
//! - Connectivity candidates which arrive before a remote description are buffered and
//!   applied in order once it's installed.
//! - Sessions follow the relay roster: departed peers are torn down, late messages from them
//!   are dropped.
//!
//! Signaling messages travel as JSON envelopes through a publish/subscribe relay (see
//! [message::Envelope] and [media::Bus]). Session descriptions and candidates are opaque
//! to this crate and passed to the media layer as received. The media layer is abstracted by
//! [media::ConnectionFactory], with a [webrtc](https://webrtc.rs) based implementation in
//! [rtc].
//!
//! # Examples
//!
//! ```rust
//! use meshcall::message::{Envelope, PeerId, Signal};
//! use meshcall::relay::Room;
//! use meshcall::glare::GlareResolver;
//!
//! fn main() -> Result<(), meshcall::Error> {
//!     let mut room = Room::new(PeerId::new("relay"));
//!     room.join(PeerId::new("alice"))?;
//!     let announcement = room.join(PeerId::new("bob"))?;
//!
//!     // roster announcement as delivered to every subscriber
//!     let raw = announcement.encode()?;
//!     let received = Envelope::decode(&raw)?;
//!
//!     if let Signal::NewUser(update) = received.signal()? {
//!         let mut resolver = GlareResolver::new();
//!         let alice = PeerId::new("alice");
//!         // alice was already present, so she sends the offer to bob
//!         let targets = resolver.plan(&alice, &update, |_| false);
//!         assert_eq!(targets, vec![PeerId::new("bob")]);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod glare;
pub mod media;
pub mod message;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod session;
#[cfg(test)]
mod testing;

pub use config::Config;
pub use dispatcher::{Dispatcher, SessionEvent, SessionEvents};
pub use error::Error;
pub use message::{Candidate, Envelope, PeerId, SessionDescription};
pub use rtc::{Options, RtcConnection, RtcConnectionFactory, StaticTracks};
pub use session::NegotiationState;
