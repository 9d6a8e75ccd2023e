use crate::config::Config;
use crate::error::Error;
use crate::glare::GlareResolver;
use crate::media::{Bus, CaptureProvider, ConnectionFactory, MediaConnection, MediaEvent, MediaEvents, RemoteTrackOf};
use crate::message::{Envelope, PeerId, Roster, RosterUpdate, SessionDescription, Signal};
use crate::registry::{Command, SessionHandle, SessionRegistry};
use crate::session::{NegotiationState, OfferDisposition, PeerSession, SessionStatus};
use futures_util::StreamExt;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Notifications surfaced to the application.
#[derive(Debug)]
pub enum SessionEvent<T> {
    /// Remote peer started sending media.
    TrackReceived { peer: PeerId, track: T },
    /// Session with a peer has been destroyed and its connection released.
    PeerClosed { peer: PeerId },
    /// Connection to the relay has been lost. Every session has been closed.
    TransportLost(Error),
}

#[derive(Debug)]
pub struct SessionEvents<T>(Mutex<UnboundedReceiver<SessionEvent<T>>>);

impl<T> SessionEvents<T> {
    fn new(receiver: UnboundedReceiver<SessionEvent<T>>) -> Self {
        SessionEvents(Mutex::new(receiver))
    }

    pub async fn next(&self) -> Option<SessionEvent<T>> {
        let mut guard = self.0.lock().await;
        guard.recv().await
    }
}

/// Routes messages coming from the relay to the peer sessions they concern.
///
/// Every peer session runs in its own task and processes its messages strictly one after
/// another, so no two negotiation steps for the same peer ever overlap, while sessions of
/// different peers progress independently.
pub struct Dispatcher<F: ConnectionFactory, B: Bus> {
    shared: Arc<Shared<F, B>>,
    state: Mutex<State>,
    events: SessionEvents<RemoteTrackOf<F>>,
    shutdown: CancellationToken,
}

struct Shared<F: ConnectionFactory, B: Bus> {
    config: Config,
    factory: F,
    bus: B,
    local_tracks: Vec<F::LocalTrack>,
    events: UnboundedSender<SessionEvent<RemoteTrackOf<F>>>,
}

#[derive(Default)]
struct State {
    registry: SessionRegistry,
    resolver: GlareResolver,
}

impl<F: ConnectionFactory, B: Bus> Dispatcher<F, B> {
    pub fn new(config: Config, factory: F, bus: B, local_tracks: Vec<F::LocalTrack>) -> Self {
        let (events_tx, events) = unbounded_channel();
        let shared = Shared {
            config,
            factory,
            bus,
            local_tracks,
            events: events_tx,
        };
        Dispatcher {
            shared: Arc::new(shared),
            state: Mutex::new(State::default()),
            events: SessionEvents::new(events),
            shutdown: CancellationToken::new(),
        }
    }

    /// Acquires local media first. If that fails, the capture error is returned and nothing
    /// else is set up.
    pub async fn start<P>(config: Config, factory: F, bus: B, capture: &P) -> Result<Self, Error>
    where
        P: CaptureProvider<Track = F::LocalTrack>,
    {
        let local_tracks = capture.acquire_local_tracks().await?;
        log::info!(
            "{} acquired {} local tracks",
            config.local_id,
            local_tracks.len()
        );
        Ok(Self::new(config, factory, bus, local_tracks))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.config.local_id
    }

    pub fn events(&self) -> &SessionEvents<RemoteTrackOf<F>> {
        &self.events
    }

    /// Subscribes to the relay, announces the local peer with `join` and processes inbound
    /// messages until [Dispatcher::shutdown] is called or the relay connection is lost.
    ///
    /// Losing the relay closes every session: after reconnecting, negotiation starts over
    /// from `Idle` for every peer.
    pub async fn run(&self) -> Result<(), Error> {
        let config = &self.shared.config;
        let mut inbound = self.shared.bus.subscribe(&config.subscribe_topic).await?;
        self.shared.publish(Envelope::join(config.local_id.clone())).await?;
        log::info!("{} joined via {}", config.local_id, config.subscribe_topic);

        let cause = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.reset().await;
                    return Ok(());
                }
                next = inbound.next() => match next {
                    Some(Ok(raw)) => self.on_message(&raw).await,
                    Some(Err(e)) => break e,
                    None => break Error::Transport("relay subscription ended".to_owned()),
                }
            }
        };
        log::error!("{} lost relay connection: {}", config.local_id, cause);
        self.reset().await;
        let _ = self.shared.events.send(SessionEvent::TransportLost(cause.clone()));
        Err(cause)
    }

    /// Stops a running [Dispatcher::run] loop and closes all sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handles a single raw message from the relay. Malformed, foreign or out-of-place
    /// messages are logged and dropped.
    pub async fn on_message(&self, raw: &[u8]) {
        if let Err(e) = self.dispatch(raw).await {
            if e.is_protocol_violation() {
                log::warn!("dropped message: {}", e);
            } else {
                log::error!("failed to handle message: {}", e);
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) -> Result<(), Error> {
        let envelope = Envelope::decode(raw)?;
        let config = &self.shared.config;
        if envelope.sender == config.local_id {
            return Ok(());
        }
        if let (Some(ours), Some(theirs)) = (&config.room_id, &envelope.room_id) {
            if ours != theirs {
                log::trace!("ignoring message for room {}", theirs);
                return Ok(());
            }
        }
        match &envelope.target {
            Some(target) if *target != config.local_id => return Ok(()),
            _ => {}
        }

        let sender = envelope.sender.clone();
        let signal = envelope.signal()?;
        match signal {
            Signal::Join => {
                self.on_join(sender).await;
                Ok(())
            }
            Signal::NewUser(update) => {
                self.on_roster(update).await;
                Ok(())
            }
            Signal::UserLeft(roster) => {
                self.on_user_left(roster).await;
                Ok(())
            }
            _ if envelope.target.is_none() => Err(Error::protocol(format!(
                "{:?} from {} has no target",
                envelope.kind, sender
            ))),
            Signal::Offer(sdp) => self.route_offer(sender, sdp).await,
            Signal::Answer(sdp) => {
                let state = self.state.lock().await;
                match state.registry.get(&sender) {
                    Some(handle) => {
                        handle.send(Command::Answer(sdp));
                        Ok(())
                    }
                    None => Err(Error::protocol(format!("stale answer from {}: no session", sender))),
                }
            }
            Signal::Candidate(candidate) => {
                let mut state = self.state.lock().await;
                if !state.registry.admits(&sender) {
                    return Err(Error::protocol(format!("candidate from departed peer {}", sender)));
                }
                let handle = state
                    .registry
                    .get_or_create(&sender, || self.spawn_session(sender.clone()));
                handle.send(Command::Candidate(candidate));
                Ok(())
            }
        }
    }

    async fn route_offer(&self, sender: PeerId, sdp: SessionDescription) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if !state.registry.admits(&sender) {
            return Err(Error::protocol(format!("offer from departed peer {}", sender)));
        }
        let local_initiates = state.resolver.is_initiator(self.local_id(), &sender);
        let handle = state
            .registry
            .get_or_create(&sender, || self.spawn_session(sender.clone()));
        handle.send(Command::Offer {
            sdp,
            local_initiates,
        });
        Ok(())
    }

    async fn on_roster(&self, update: RosterUpdate) {
        let mut state = self.state.lock().await;
        let State { registry, resolver } = &mut *state;
        registry.reconcile(&update.users);
        if let Some(roster) = registry.roster() {
            resolver.retain(roster);
        }
        let local = self.local_id();
        let targets = resolver.plan(local, &update, |peer| registry.get(peer).is_some());
        for peer in targets {
            log::info!("{} initiates towards {}", local, peer);
            let handle = registry.get_or_create(&peer, || self.spawn_session(peer.clone()));
            handle.send(Command::Initiate(None));
        }
    }

    /// Present members offer to a newcomer, the same `[existing, new]` pairing the relay assigns
    /// in `new_user`. A peer joining again has reset its side, so its old session is replaced.
    async fn on_join(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        let State { registry, resolver } = &mut *state;
        registry.admit(&peer);
        if registry.remove(&peer) {
            log::info!("{} joined again, restarting its session", peer);
        }
        let local = self.local_id();
        resolver.record(&[(local.clone(), peer.clone())]);
        log::info!("{} joined, {} initiates", peer, local);
        let handle = registry.get_or_create(&peer, || self.spawn_session(peer.clone()));
        handle.send(Command::Initiate(None));
    }

    async fn on_user_left(&self, roster: Roster) {
        let mut state = self.state.lock().await;
        let State { registry, resolver } = &mut *state;
        registry.reconcile(&roster.users);
        if let Some(roster) = registry.roster() {
            resolver.retain(roster);
        }
    }

    /// Local initiate towards a peer: creates its session if needed and sends an offer.
    /// Negotiation failures are reported back; the session stays `Idle` so the call can be
    /// retried.
    pub async fn connect_to(&self, peer: PeerId) -> Result<(), Error> {
        if &peer == self.local_id() {
            return Err(Error::protocol("can't connect to self"));
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if !state.registry.admits(&peer) {
                return Err(Error::protocol(format!("{} is not in the roster", peer)));
            }
            let handle = state
                .registry
                .get_or_create(&peer, || self.spawn_session(peer.clone()));
            if !handle.send(Command::Initiate(Some(tx))) {
                return Err(Error::Closed(peer));
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed(peer)),
        }
    }

    /// Explicit reset: closes the session with a peer. No-op if there is none.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock().await;
        state.registry.remove(peer)
    }

    /// Closes every session and forgets the roster.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let closed = state.registry.clear();
        state.resolver = GlareResolver::new();
        if !closed.is_empty() {
            log::info!("closed sessions: {:?}", closed);
        }
    }

    /// Negotiation state of a peer session, observed after every message already routed to
    /// it has been processed. `None` if there's no live session.
    pub async fn state_of(&self, peer: &PeerId) -> Option<NegotiationState> {
        let handle = {
            let state = self.state.lock().await;
            state.registry.get(peer)?.clone()
        };
        let (tx, rx) = oneshot::channel();
        if !handle.send(Command::Inspect(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let state = self.state.lock().await;
        state.registry.peers()
    }

    fn spawn_session(&self, peer: PeerId) -> SessionHandle {
        let status = SessionStatus::default();
        let (tx, rx) = unbounded_channel();
        let shared = self.shared.clone();
        tokio::spawn(Worker::start(peer, status.clone(), rx, shared));
        SessionHandle::new(status, tx)
    }
}

impl<F: ConnectionFactory, B: Bus> std::fmt::Debug for Dispatcher<F, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local_id", self.local_id())
            .field("room_id", &self.shared.config.room_id)
            .finish()
    }
}

impl<F: ConnectionFactory, B: Bus> Shared<F, B> {
    async fn publish(&self, envelope: Envelope) -> Result<(), Error> {
        let payload = envelope.with_room(self.config.room_id.clone()).encode()?;
        self.bus.publish(&self.config.publish_topic, payload).await
    }
}

/// Task driving a single [PeerSession]: the only writer of its state.
struct Worker<F: ConnectionFactory, B: Bus> {
    session: PeerSession<F::Connection>,
    media: MediaEvents<RemoteTrackOf<F>>,
    commands: UnboundedReceiver<Command>,
    shared: Arc<Shared<F, B>>,
}

impl<F: ConnectionFactory, B: Bus> Worker<F, B> {
    async fn start(
        peer: PeerId,
        status: SessionStatus,
        mut commands: UnboundedReceiver<Command>,
        shared: Arc<Shared<F, B>>,
    ) {
        let (conn, media) = match shared.factory.create(&peer, &shared.local_tracks).await {
            Ok(created) => created,
            Err(e) => {
                log::error!("failed to create media connection for {}: {}", peer, e);
                status.close();
                commands.close();
                while let Ok(command) = commands.try_recv() {
                    if let Command::Initiate(Some(reply)) = command {
                        let _ = reply.send(Err(e.clone()));
                    }
                }
                let _ = shared.events.send(SessionEvent::PeerClosed { peer });
                return;
            }
        };
        let capacity = shared.config.candidate_queue_capacity;
        let worker = Worker {
            session: PeerSession::new(peer, conn, status, capacity),
            media,
            commands,
            shared,
        };
        worker.run().await
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => {
                        self.handle(command).await;
                        if self.session.status().is_closed() {
                            break;
                        }
                    }
                },
                Some(event) = self.media.recv() => {
                    if !self.on_media_event(event).await {
                        break;
                    }
                }
            }
        }
        self.session.close().await;
        let peer = self.session.peer().clone();
        let _ = self.shared.events.send(SessionEvent::PeerClosed { peer });
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Initiate(reply) => {
                let result = self.initiate().await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => self.report(result),
                }
            }
            Command::Offer {
                sdp,
                local_initiates,
            } => {
                let result = self.on_offer(sdp, local_initiates).await;
                self.report(result)
            }
            Command::Answer(sdp) => {
                let result = self.session.accept_answer(sdp).await;
                self.report(result)
            }
            Command::Candidate(candidate) => {
                let result = self.session.add_candidate(candidate).await;
                self.report(result)
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.session.state());
            }
            Command::Close => {}
        }
    }

    async fn initiate(&mut self) -> Result<(), Error> {
        let offer = self.session.initiate().await?;
        let peer = self.session.peer().clone();
        log::debug!("sending offer to {}", peer);
        let local = self.shared.config.local_id.clone();
        self.shared.publish(Envelope::offer(local, peer, offer)).await
    }

    async fn on_offer(&mut self, sdp: SessionDescription, local_initiates: bool) -> Result<(), Error> {
        let peer = self.session.peer().clone();
        match self.session.offer_disposition(local_initiates) {
            OfferDisposition::Accept => {}
            OfferDisposition::IgnoreGlare => {
                log::info!("glare with {}: local offer takes precedence", peer);
                self.session.abandon_remote_candidates();
                return Ok(());
            }
            OfferDisposition::Restart => {
                log::info!("glare with {}: yielding, answering remote offer", peer);
                self.replace_connection().await?;
            }
            OfferDisposition::Stale => {
                return Err(Error::protocol(format!(
                    "offer from {} ignored while {:?}",
                    peer,
                    self.session.state()
                )));
            }
        }
        let answer = match self.session.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                if self.session.needs_restart() {
                    if let Err(cause) = self.replace_connection().await {
                        log::error!("failed to reset connection with {}: {}", peer, cause);
                        self.session.status().close();
                    }
                }
                return Err(e);
            }
        };
        log::debug!("sending answer to {}", peer);
        let local = self.shared.config.local_id.clone();
        self.shared.publish(Envelope::answer(local, peer, answer)).await
    }

    /// Swaps in a fresh connection from the factory and closes the previous one.
    async fn replace_connection(&mut self) -> Result<(), Error> {
        let peer = self.session.peer().clone();
        let (conn, media) = self.shared.factory.create(&peer, &self.shared.local_tracks).await?;
        let previous = self.session.restart(conn).await?;
        self.media = media;
        if let Err(e) = previous.close().await {
            log::warn!("failed to close abandoned connection with {}: {}", peer, e);
        }
        Ok(())
    }

    /// Returns false when the session must be torn down.
    async fn on_media_event(&mut self, event: MediaEvent<RemoteTrackOf<F>>) -> bool {
        let peer = self.session.peer().clone();
        match event {
            MediaEvent::CandidateDiscovered(candidate) => {
                let local = self.shared.config.local_id.clone();
                let envelope = Envelope::candidate(local, peer.clone(), candidate);
                if let Err(e) = self.shared.publish(envelope).await {
                    log::warn!("failed to send candidate to {}: {}", peer, e);
                }
                true
            }
            MediaEvent::TrackReceived(track) => {
                log::info!("receiving media from {}", peer);
                let _ = self
                    .shared
                    .events
                    .send(SessionEvent::TrackReceived { peer, track });
                true
            }
            MediaEvent::NegotiationNeeded => {
                log::debug!("connection with {} requests negotiation", peer);
                true
            }
            MediaEvent::Failed => {
                log::warn!("connection with {} failed", peer);
                false
            }
        }
    }

    fn report(&self, result: Result<(), Error>) {
        match result {
            Ok(()) => {}
            Err(Error::Closed(peer)) => {
                log::debug!("discarding result of a step for closed session {}", peer)
            }
            Err(e) if e.is_protocol_violation() => log::warn!("{}", e),
            Err(e) => log::error!("negotiation with {} failed: {}", self.session.peer(), e),
        }
    }
}
