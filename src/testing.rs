//! Scripted collaborators shared by unit tests.

use crate::error::Error;
use crate::media::{Bus, CaptureProvider, ConnectionFactory, MediaConnection, MediaEvent, MediaEvents};
use crate::message::{Candidate, Envelope, MessageKind, PeerId, SessionDescription};
use crate::relay::Room;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Notify};

pub fn offer_sdp(from: &str) -> SessionDescription {
    SessionDescription(json!({ "type": "offer", "sdp": format!("v=0\r\no={} offer\r\n", from) }))
}

pub fn answer_sdp(from: &str) -> SessionDescription {
    SessionDescription(json!({ "type": "answer", "sdp": format!("v=0\r\no={} answer\r\n", from) }))
}

pub fn candidate(n: u32) -> Candidate {
    Candidate(json!({
        "candidate": format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", n, n, n),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    }))
}

fn rejected() -> webrtc::Error {
    webrtc::Error::ErrConnectionClosed
}

/// Polls `check` until it returns true, panicking after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(Candidate),
    Close,
}

#[derive(Debug, Default)]
struct Flags {
    offer: AtomicBool,
    answer: AtomicBool,
    local: AtomicBool,
    remote: AtomicBool,
    candidates: AtomicBool,
}

#[derive(Debug)]
struct MockInner {
    label: String,
    calls: Mutex<Vec<Call>>,
    fail: Flags,
    closed: AtomicBool,
    answer_gate: Mutex<Option<Arc<Notify>>>,
    events: UnboundedSender<MediaEvent<String>>,
}

/// Media connection recording every primitive call. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MockConnection(Arc<MockInner>);

impl MockConnection {
    pub fn new() -> (Self, MediaEvents<String>) {
        Self::labelled("local")
    }

    pub fn labelled(label: &str) -> (Self, MediaEvents<String>) {
        let (events, rx) = unbounded_channel();
        let inner = MockInner {
            label: label.to_owned(),
            calls: Mutex::new(Vec::new()),
            fail: Flags::default(),
            closed: AtomicBool::new(false),
            answer_gate: Mutex::new(None),
            events,
        };
        (MockConnection(Arc::new(inner)), rx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn fail_offer(&self, fail: bool) {
        self.0.fail.offer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_answer(&self, fail: bool) {
        self.0.fail.answer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_local(&self, fail: bool) {
        self.0.fail.local.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote(&self, fail: bool) {
        self.0.fail.remote.store(fail, Ordering::SeqCst);
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.0.fail.candidates.store(fail, Ordering::SeqCst);
    }

    /// Makes `create_answer` wait until the returned notifier fires.
    pub fn stall_answers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.0.answer_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn emit(&self, event: MediaEvent<String>) {
        let _ = self.0.events.send(event);
    }

    fn record(&self, call: Call) {
        self.0.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    type RemoteTrack = String;

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.record(Call::CreateOffer);
        if self.0.fail.offer.load(Ordering::SeqCst) {
            return Err(rejected().into());
        }
        Ok(offer_sdp(&self.0.label))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        self.record(Call::CreateAnswer);
        let gate = self.0.answer_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.0.fail.answer.load(Ordering::SeqCst) {
            return Err(rejected().into());
        }
        Ok(answer_sdp(&self.0.label))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.record(Call::SetLocal(sdp));
        if self.0.fail.local.load(Ordering::SeqCst) {
            return Err(rejected().into());
        }
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.record(Call::SetRemote(sdp));
        if self.0.fail.remote.load(Ordering::SeqCst) {
            return Err(rejected().into());
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), Error> {
        self.record(Call::AddCandidate(candidate));
        if self.0.fail.candidates.load(Ordering::SeqCst) {
            return Err(Error::candidate(rejected()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.record(Call::Close);
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [MockConnection]s and remembering them per peer.
#[derive(Debug, Default)]
pub struct MockFactory {
    label: String,
    created: Mutex<Vec<(PeerId, MockConnection, Vec<String>)>>,
    fail_create: AtomicBool,
    fail_offers: AtomicBool,
}

impl MockFactory {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(MockFactory {
            label: label.to_owned(),
            ..Default::default()
        })
    }

    pub fn connections(&self, peer: &str) -> Vec<MockConnection> {
        let peer = PeerId::new(peer);
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| p == &peer)
            .map(|(_, c, _)| c.clone())
            .collect()
    }

    pub fn latest(&self, peer: &str) -> MockConnection {
        self.connections(peer).pop().expect("no connection created for peer")
    }

    pub fn local_tracks(&self, peer: &str) -> Vec<String> {
        let peer = PeerId::new(peer);
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _, _)| p == &peer)
            .map(|(_, _, tracks)| tracks.clone())
            .unwrap_or_default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// New connections will reject `create_offer`.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for Arc<MockFactory> {
    type Connection = MockConnection;
    type LocalTrack = String;

    async fn create(
        &self,
        peer: &PeerId,
        local_tracks: &[String],
    ) -> Result<(MockConnection, MediaEvents<String>), Error> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(rejected().into());
        }
        let (conn, events) = MockConnection::labelled(&self.label);
        conn.fail_offer(self.fail_offers.load(Ordering::SeqCst));
        self.created
            .lock()
            .unwrap()
            .push((peer.clone(), conn.clone(), local_tracks.to_vec()));
        Ok((conn, events))
    }
}

pub struct MockCapture(pub Vec<String>);

#[async_trait]
impl CaptureProvider for MockCapture {
    type Track = String;

    async fn acquire_local_tracks(&self) -> Result<Vec<String>, Error> {
        if self.0.is_empty() {
            Err(Error::Capture("permission denied".to_owned()))
        } else {
            Ok(self.0.clone())
        }
    }
}

#[derive(Default)]
struct RecordingInner {
    published: Mutex<Vec<(String, Envelope)>>,
    inbound: Mutex<Option<UnboundedReceiver<Result<Bytes, Error>>>>,
    inbound_tx: Mutex<Option<UnboundedSender<Result<Bytes, Error>>>>,
}

/// Bus recording every published envelope. Inbound traffic is scripted with
/// [RecordingBus::push] and [RecordingBus::fail].
#[derive(Clone)]
pub struct RecordingBus(Arc<RecordingInner>);

impl RecordingBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        let inner = RecordingInner {
            published: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(rx)),
            inbound_tx: Mutex::new(Some(tx)),
        };
        RecordingBus(Arc::new(inner))
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.0
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn published_to(&self, topic: &str) -> usize {
        self.0
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .count()
    }

    pub fn sent(&self, kind: MessageKind, target: &str) -> Vec<Envelope> {
        let target = PeerId::new(target);
        self.published()
            .into_iter()
            .filter(|e| e.kind == kind && e.target.as_ref() == Some(&target))
            .collect()
    }

    pub fn push(&self, envelope: &Envelope) {
        if let Some(tx) = &*self.0.inbound_tx.lock().unwrap() {
            let _ = tx.send(Ok(envelope.encode().unwrap()));
        }
    }

    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &*self.0.inbound_tx.lock().unwrap() {
            let _ = tx.send(Err(Error::Transport(reason.to_owned())));
        }
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), Error> {
        let envelope = Envelope::decode(&payload)?;
        self.0
            .published
            .lock()
            .unwrap()
            .push((topic.to_owned(), envelope));
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        let rx = self
            .0
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Transport("already subscribed".to_owned()))?;
        Ok(stream::unfold(rx, |mut rx| async move {
            let next = rx.recv().await?;
            Some((next, rx))
        })
        .boxed())
    }
}

/// In-memory relay: fans every published message out to all subscribers and answers `join`
/// with a roster announcement, like the production relay does.
#[derive(Clone)]
pub struct MemoryRelay {
    room: Arc<Mutex<Room>>,
    fanout: broadcast::Sender<Bytes>,
    announce: bool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_announcements(true)
    }

    /// Relay which only echoes messages and never announces rosters.
    pub fn echo() -> Self {
        Self::with_announcements(false)
    }

    fn with_announcements(announce: bool) -> Self {
        let (fanout, _) = broadcast::channel(1024);
        MemoryRelay {
            room: Arc::new(Mutex::new(Room::new(PeerId::new("relay")))),
            fanout,
            announce,
        }
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.room.lock().unwrap().members().to_vec()
    }

    pub fn leave(&self, peer: &str) {
        let announcement = self.room.lock().unwrap().leave(&PeerId::new(peer)).unwrap();
        if let (true, Some(envelope)) = (self.announce, announcement) {
            let _ = self.fanout.send(envelope.encode().unwrap());
        }
    }
}

#[async_trait]
impl Bus for MemoryRelay {
    async fn publish(&self, _topic: &str, payload: Bytes) -> Result<(), Error> {
        let envelope = Envelope::decode(&payload)?;
        let _ = self.fanout.send(payload);
        if envelope.kind == MessageKind::Join {
            let announcement = self.room.lock().unwrap().join(envelope.sender)?;
            if self.announce {
                let _ = self.fanout.send(announcement.encode()?);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        let rx = self.fanout.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((Ok(payload), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}
