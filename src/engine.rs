//! The membership engine (spec §4.6): owns the peer table, the update
//! buffer, local identity/sequence, and the single cooperative event loop
//! (`SPEC_FULL.md` §5.1) that ties every other module together.
//!
//! Grounded in how `zebra-network`'s `peer_set` separates a background
//! crawler (`CandidateSet::update`) from request/response handling, but
//! collapsed into the one mailbox spec §5 requires: rather than an
//! `Arc<Mutex<AddressBook>>` shared across tasks, all mutable state
//! ([`Inner`]) is owned by exactly one `tokio::task`, and every other public
//! method reaches it by sending a [`Command`] down an `mpsc` channel that
//! task reads in its `select!` loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use tracing_error::SpanTrace;

use crate::config::Config;
use crate::error::Error;
use crate::peer::{PeerEvent, PeerRecord};
use crate::probe::{choose_indirect_peer, PendingProbe, ProbeStage, RelayTarget};
use crate::protocol::{Command as WireCommand, Message};
use crate::scheduler::{self, Advance, Scheduler};
use crate::signals::{Signal, SignalBus};
use crate::status::PeerStatus;
use crate::transport::{Inbound, Transport, UdpTransport};
use crate::update::{Update, UpdateBuffer};

/// A peer supplied to [`Engine::init`] or [`Engine::add_peer`].
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

/// A read-only snapshot of one peer's locally known state, returned by
/// [`Engine::random_peer`] and [`Engine::request_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub status: PeerStatus,
    pub sequence: u64,
}

impl From<&PeerRecord> for PeerSnapshot {
    fn from(p: &PeerRecord) -> Self {
        PeerSnapshot {
            id: p.id,
            host: p.host.clone(),
            port: p.port,
            status: p.status,
            sequence: p.sequence,
        }
    }
}

/// Messages funneled through the engine's one mailbox from the outside
/// (`SPEC_FULL.md` §5.1): `addPeer`, `randomPeer`, and the test-only
/// `requestState`/`eventReq` of spec §4.6 all become a `Command` rather than
/// touching engine state directly.
enum EngineCommand {
    AddPeer(PeerInfo),
    RandomPeer(oneshot::Sender<Option<PeerSnapshot>>),
    RequestState(u64, oneshot::Sender<Result<PeerSnapshot, Error>>),
    EventReq {
        id: u64,
        name: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Stop,
}

/// A cloneable reference to a running [`Engine`]'s mailbox.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Register (or update the address of) a peer (spec §4.6 `addPeer`).
    pub async fn add_peer(&self, info: PeerInfo) {
        let _ = self.tx.send(EngineCommand::AddPeer(info)).await;
    }

    /// A uniformly random known peer, or `None` if the table is empty.
    pub async fn random_peer(&self) -> Option<PeerSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineCommand::RandomPeer(reply)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Test-only: this engine's local view of peer `id` (spec §4.6
    /// `requestState`). `SPEC_FULL.md` §4.6 resolves this as a local
    /// snapshot rather than an additional wire round-trip, since spec §4.4's
    /// wire table defines no `state-req`/`state` command.
    pub async fn request_state(&self, id: u64) -> Result<PeerSnapshot, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::RequestState(id, reply))
            .await
            .map_err(|_| Error::UnknownPeer(id))?;
        rx.await.map_err(|_| Error::UnknownPeer(id))?
    }

    /// Test-only: ask peer `id` to notify us once it locally fires an event
    /// named `name`, resolving when that notification arrives or failing
    /// with [`Error::Timeout`] after `timeout` (spec §4.6 `eventReq`).
    pub async fn event_req(
        &self,
        id: u64,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        let name = name.into();
        self.tx
            .send(EngineCommand::EventReq {
                id,
                name: name.clone(),
                timeout,
                reply,
            })
            .await
            .map_err(|_| Error::Timeout(name))?;
        rx.await.map_err(|_| Error::Timeout(String::new()))?
    }

    /// Stop the engine's event loop (spec §5: "cancels the pending
    /// scheduler sleep").
    pub async fn stop(&self) {
        let _ = self.tx.send(EngineCommand::Stop).await;
    }
}

/// Who is waiting on a named local event firing for `eventReq` (spec §4.6).
struct EventWaiter {
    from: u64,
    name: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<(), Error>>,
}

/// A promise made to a remote peer's `event-req`: once a local signal whose
/// wire name matches `name` fires, send it an `event` datagram (spec §4.4,
/// §4.8).
struct PendingBridge {
    name: String,
    requester: RelayTarget,
}

/// τ₃, the suspect→down deadline (spec §3: "per-peer transient timers
/// (suspect→down deadline, pending-ack deadline)"). Scheduled whenever a
/// peer transitions into `suspect`; cleared implicitly once it fires or the
/// peer leaves `suspect` some other way (a stale firing is a no-op, since
/// [`PeerRecord::suspect_timeout_expired`] only acts while still `suspect`).
struct SuspectTimer {
    peer_id: u64,
    deadline: Instant,
}

/// All state touched by the event loop. Never shared: owned by exactly one
/// `tokio::task` once [`Engine::start`] hands it off.
struct Inner {
    config: Config,
    self_sequence: u64,
    peers: IndexMap<u64, PeerRecord>,
    /// Round-robin iteration order, reshuffled on each scheduler epoch wrap
    /// (spec §4.5). `IndexMap` preserves insertion order but doesn't support
    /// in-place shuffling, so this is tracked separately.
    order: Vec<u64>,
    buffer: UpdateBuffer,
    scheduler: Scheduler,
    probes: Vec<PendingProbe>,
    suspect_timers: Vec<SuspectTimer>,
    event_waiters: Vec<EventWaiter>,
    pending_bridges: Vec<PendingBridge>,
    rng: StdRng,
}

impl Inner {
    fn new(config: Config) -> Self {
        Inner {
            config,
            self_sequence: 0,
            peers: IndexMap::new(),
            order: Vec::new(),
            buffer: UpdateBuffer::new(),
            scheduler: Scheduler::new(),
            probes: Vec::new(),
            suspect_timers: Vec::new(),
            event_waiters: Vec::new(),
            pending_bridges: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn take_updates(&mut self) -> Vec<Update> {
        self.buffer.take(
            self.peer_count(),
            self.config.dissemination_factor,
            self.config.max_piggyback_updates,
        )
    }

    /// Insert or overwrite a peer's registered address (spec §4.6
    /// `addPeer`; also used to auto-register an unknown sender/bootstrap
    /// target, spec §4.4).
    fn upsert_peer(&mut self, id: u64, host: String, port: u16) {
        if id == self.config.id {
            return; // invariant: the local node is never in its own peer table
        }
        if let Some(existing) = self.peers.get_mut(&id) {
            existing.host = host;
            existing.port = port;
        } else {
            self.peers.insert(id, PeerRecord::new(id, host, port));
            self.order.push(id);
        }
    }

    fn random_peer(&mut self) -> Option<PeerSnapshot> {
        if self.order.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.order.len());
        let id = self.order[idx];
        self.peers.get(&id).map(PeerSnapshot::from)
    }
}

/// The SWIM membership engine.
pub struct Engine {
    config: Config,
    signals: SignalBus,
    transport: Option<Arc<dyn Transport>>,
    inbound: Option<mpsc::Receiver<Inbound>>,
    inner: Option<Inner>,
    handle: Option<EngineHandle>,
    loop_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Build an engine for `id`, which will bind `host:port` once
    /// [`Engine::init`] runs.
    pub fn new(config: Config) -> Self {
        Engine {
            signals: SignalBus::new(),
            inner: Some(Inner::new(config.clone())),
            config,
            transport: None,
            inbound: None,
            handle: None,
            loop_task: None,
        }
    }

    /// Subscribe to this engine's signal bus (spec §6).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Bind the UDP socket and seed the peer table (spec §4.6 `init`).
    /// Must be called before [`Engine::start`].
    pub async fn init(&mut self, peers: Vec<PeerInfo>) -> Result<(), Error> {
        let (transport, inbound) = UdpTransport::bind(&self.config.host, self.config.port).await?;
        self.transport = Some(Arc::new(transport));
        self.inbound = Some(inbound);

        let inner = self.inner.as_mut().expect("init called after start");
        for p in peers {
            inner.upsert_peer(p.id, p.host, p.port);
        }
        info!(id = self.config.id, peers = inner.peer_count(), "engine initialized");
        Ok(())
    }

    /// Install a transport directly (for tests against [`crate::transport::ChannelTransport`]
    /// rather than a real socket).
    pub fn init_with_transport(
        &mut self,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
        peers: Vec<PeerInfo>,
    ) {
        self.transport = Some(transport);
        self.inbound = Some(inbound);
        let inner = self.inner.as_mut().expect("init called after start");
        for p in peers {
            inner.upsert_peer(p.id, p.host, p.port);
        }
    }

    /// Register or update a peer's address (spec §4.6 `addPeer`). Valid
    /// both before and after [`Engine::start`]: before start, no event-loop
    /// task exists yet, so the peer table is mutated directly; afterward,
    /// the change is funneled through the mailbox like any other command.
    pub async fn add_peer(&mut self, info: PeerInfo) {
        match &self.handle {
            Some(h) => h.add_peer(info).await,
            None => {
                if let Some(inner) = self.inner.as_mut() {
                    inner.upsert_peer(info.id, info.host, info.port);
                }
            }
        }
    }

    /// Spawn the event loop (spec §4.6 `start`; §5.1's task topology).
    /// Returns a cloneable [`EngineHandle`] for the remaining public API.
    pub fn start(&mut self) -> EngineHandle {
        let inner = self.inner.take().expect("start called twice");
        let transport = self.transport.clone().expect("init must run before start");
        let inbound = self.inbound.take().expect("init must run before start");
        let signals = self.signals.clone();

        let (tx, rx) = mpsc::channel(256);
        let handle = EngineHandle { tx };
        self.handle = Some(handle.clone());

        let task = tokio::spawn(run_loop(inner, transport, inbound, rx, signals));
        self.loop_task = Some(task);
        handle
    }

    /// Stop the event loop and wait for it to exit (spec §4.6 `stop`).
    pub async fn stop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.stop().await;
        }
        if let Some(task) = self.loop_task.take() {
            let _ = task.await;
        }
    }

    /// Close the socket and drop all engine state (spec §4.6 `teardown`,
    /// spec §5: "closes the socket and clears outstanding per-peer
    /// timers").
    pub async fn teardown(&mut self) {
        self.stop().await;
        self.transport = None;
        self.handle = None;
    }

    pub fn handle(&self) -> Option<&EngineHandle> {
        self.handle.as_ref()
    }
}

// --- event loop -------------------------------------------------------

async fn run_loop(
    mut inner: Inner,
    transport: Arc<dyn Transport>,
    mut inbound: mpsc::Receiver<Inbound>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    signals: SignalBus,
) {
    let mut period = tokio::time::interval(inner.config.protocol_period);
    period.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let deadline = earliest_deadline(&inner);
        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(sleep);

        tokio::select! {
            maybe = inbound.recv() => {
                match maybe {
                    Some(datagram) => handle_datagram(&mut inner, &transport, &signals, datagram).await,
                    None => { debug!("transport closed; stopping engine loop"); break; }
                }
            }
            maybe = cmd_rx.recv() => {
                match maybe {
                    Some(EngineCommand::Stop) | None => { debug!("stop requested"); break; }
                    Some(cmd) => handle_command(&mut inner, &transport, cmd).await,
                }
            }
            _ = period.tick() => {
                run_protocol_period(&mut inner, &transport, &signals).await;
            }
            _ = &mut sleep => {
                handle_timeouts(&mut inner, &transport, &signals).await;
            }
        }
    }
}

fn earliest_deadline(inner: &Inner) -> Instant {
    let probe_deadline = inner.probes.iter().map(|p| p.deadline).min();
    let waiter_deadline = inner.event_waiters.iter().map(|w| w.deadline).min();
    let suspect_deadline = inner.suspect_timers.iter().map(|t| t.deadline).min();
    [probe_deadline, waiter_deadline, suspect_deadline]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
}

/// Emit `sig` on the external signal bus, then forward it to any pending
/// `event-req` bridge whose name matches (spec §4.8).
async fn publish(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus, sig: Signal) {
    if let Signal::StatusChanged { status, .. } = &sig {
        counter!("swim.status_transitions", "status" => status.as_str()).increment(1);
    }
    signals.emit(sig.clone());
    let Some(name) = signal_wire_name(&sig) else { return };

    let mut matched = Vec::new();
    inner.pending_bridges.retain(|b| {
        if b.name == name {
            matched.push(b.requester.clone());
            false
        } else {
            true
        }
    });
    for requester in matched {
        let updates = inner.take_updates();
        let msg = Message::event(inner.config.id, updates, name.clone());
        let _ = transport
            .send_to(msg.to_bytes().into(), &requester.host, requester.port)
            .await;
    }
}

/// String form of a signal, for the `event`/`event-req` test bridge (spec
/// §9: the source used string-keyed events like `"alive:42"`; this crate
/// keeps that flavor confined to the test-support bridge rather than the
/// primary, strongly-typed [`Signal`] bus).
fn signal_wire_name(signal: &Signal) -> Option<String> {
    match signal {
        Signal::StatusChanged { id, status } => Some(format!("{}:{id}", status.as_str())),
        Signal::Sequence { id, sequence } => Some(format!("sequence:{id}:{sequence}")),
        Signal::Ack { id } => Some(format!("ack:{id}")),
        Signal::Error(_) => Some("error".to_string()),
        Signal::PeerNotFound(id) => Some(format!("peer-not-found:{id}")),
        Signal::UnrecognizedCommand(_) => Some("unrecognized-command".to_string()),
        Signal::UnrecognizedStatus(_) => Some("unrecognized-status".to_string()),
        Signal::Event { .. } => None,
    }
}

/// Turn the events a [`PeerRecord`] method returned into signals, and, per
/// spec §4.2's closing sentence ("emitted status-change events flow to the
/// engine, which appends a corresponding update to the buffer"), piggyback a
/// matching [`Update`] for every status change so other nodes eventually
/// learn about it too. `sequence` is the peer's sequence *after* the
/// transition that produced `events`.
fn emit_peer_events(
    inner: &mut Inner,
    id: u64,
    sequence: u64,
    events: Vec<PeerEvent>,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    for event in events {
        let sig = match event {
            PeerEvent::StatusChanged(status) => {
                inner.buffer.add(Update::new(id, sequence, status));
                Signal::StatusChanged { id, status }
            }
            PeerEvent::Sequence(sequence) => Signal::Sequence { id, sequence },
        };
        signals.push(sig);
    }
    signals
}

/// Apply one piggybacked update (spec §4.2/§4.4), publishing whatever
/// status/sequence signals result. Self-referential updates are handled
/// separately (`apply_self_refutation`), never touching the peer table.
async fn apply_peer_update(
    inner: &mut Inner,
    transport: &Arc<dyn Transport>,
    signals: &SignalBus,
    update: &Update,
) {
    if update.id == inner.config.id {
        apply_self_refutation(inner, update);
        return;
    }

    if !inner.peers.contains_key(&update.id) {
        match (&update.host, update.port) {
            (Some(host), Some(port)) => inner.upsert_peer(update.id, host.clone(), port),
            _ => {
                publish(inner, transport, signals, Signal::PeerNotFound(update.id)).await;
                return;
            }
        }
    }

    let transitioned = match inner.peers.get_mut(&update.id) {
        Some(peer) => {
            let events = peer.apply_update(update.sequence, update.status);
            (events, peer.sequence)
        }
        None => (Vec::new(), 0),
    };
    let (events, sequence) = transitioned;
    let pending = emit_peer_events(inner, update.id, sequence, events);
    for sig in pending {
        publish(inner, transport, signals, sig).await;
    }
}

/// Self-refutation (spec §4.6/§9 invariant 6): a piggybacked `{id=self,
/// status=suspect, sequence=self.sequence}` bumps our own sequence and
/// appends a refuting `alive` update, without ever creating a peer record
/// for ourselves.
fn apply_self_refutation(inner: &mut Inner, update: &Update) {
    if update.status == PeerStatus::Suspect && update.sequence == inner.self_sequence {
        inner.self_sequence += 1;
        let refutation = Update::new(inner.config.id, inner.self_sequence, PeerStatus::Alive);
        inner.buffer.add(refutation);
        info!(sequence = inner.self_sequence, "refuted suspicion of self");
    }
}

/// A direct observation of `id` (spec §4.2: any `ack`/`ping`/`ping-req`
/// received from that peer revives it out of `suspect`).
async fn note_direct_observation(
    inner: &mut Inner,
    transport: &Arc<dyn Transport>,
    signals: &SignalBus,
    id: u64,
) {
    let transitioned = match inner.peers.get_mut(&id) {
        Some(peer) => peer.on_direct_observation().map(|event| (event, peer.sequence)),
        None => None,
    };
    if let Some((event, sequence)) = transitioned {
        let pending = emit_peer_events(inner, id, sequence, vec![event]);
        for sig in pending {
            publish(inner, transport, signals, sig).await;
        }
    }
}

async fn handle_datagram(
    inner: &mut Inner,
    transport: &Arc<dyn Transport>,
    signals: &SignalBus,
    datagram: Inbound,
) {
    let msg = match Message::from_bytes(&datagram.bytes) {
        Ok(m) => m,
        Err(e) => {
            let trace = SpanTrace::capture();
            warn!(error = %e, %trace, "dropping malformed datagram");
            publish(inner, transport, signals, Signal::Error(e.to_string())).await;
            return;
        }
    };

    trace!(command = %msg.command, sender = msg.sender_id, "inbound datagram");

    if msg.sender_id != inner.config.id && !inner.peers.contains_key(&msg.sender_id) {
        inner.upsert_peer(msg.sender_id, datagram.host.clone(), datagram.port);
    }

    let updates: Vec<Update> = msg.valid_updates().cloned().collect();
    for update in &updates {
        apply_peer_update(inner, transport, signals, update).await;
    }
    for bad_status in msg.invalid_update_statuses() {
        publish(inner, transport, signals, Signal::UnrecognizedStatus(bad_status)).await;
    }

    match msg.command() {
        Ok(WireCommand::Ping) => {
            note_direct_observation(inner, transport, signals, msg.sender_id).await;
            let updates = inner.take_updates();
            let reply = Message::ack(inner.config.id, updates);
            let _ = transport
                .send_to(reply.to_bytes().into(), &datagram.host, datagram.port)
                .await;
        }
        Ok(WireCommand::Ack) => {
            counter!("swim.acks_received").increment(1);
            note_direct_observation(inner, transport, signals, msg.sender_id).await;
            publish(inner, transport, signals, Signal::Ack { id: msg.sender_id }).await;
            resolve_probe(inner, transport, signals, msg.sender_id).await;
        }
        Ok(WireCommand::PingReq) => {
            note_direct_observation(inner, transport, signals, msg.sender_id).await;
            handle_ping_req(inner, transport, &msg, &datagram).await;
        }
        Ok(WireCommand::Event) => {
            let name = msg.event_name.clone().unwrap_or_default();
            resolve_event_waiters(inner, msg.sender_id, &name);
        }
        Ok(WireCommand::EventReq) => {
            let name = msg.event_name.clone().unwrap_or_default();
            inner.pending_bridges.push(PendingBridge {
                name,
                requester: RelayTarget {
                    id: msg.sender_id,
                    host: datagram.host.clone(),
                    port: datagram.port,
                },
            });
        }
        Err(Error::UnknownCommand(cmd)) => {
            publish(inner, transport, signals, Signal::UnrecognizedCommand(cmd)).await;
        }
        Err(_) => unreachable!("Command::parse only ever returns UnknownCommand"),
    }
}

async fn handle_ping_req(inner: &mut Inner, transport: &Arc<dyn Transport>, msg: &Message, datagram: &Inbound) {
    let Some(target_id) = msg.target_id else {
        return;
    };

    if !inner.peers.contains_key(&target_id) {
        match (&msg.target_address, msg.target_port) {
            (Some(host), Some(port)) => inner.upsert_peer(target_id, host.clone(), port),
            _ => return,
        }
    }

    let Some(target) = inner.peers.get(&target_id) else { return };
    let (host, port) = (target.host.clone(), target.port);
    let updates = inner.take_updates();
    let ping = Message::ping(inner.config.id, updates);
    let _ = transport.send_to(ping.to_bytes().into(), &host, port).await;

    let relay_to = RelayTarget {
        id: msg.sender_id,
        host: datagram.host.clone(),
        port: datagram.port,
    };
    let deadline = Instant::now() + inner.config.probe_timeout;
    inner.probes.push(PendingProbe::relay(target_id, deadline, relay_to));
}

fn resolve_event_waiters(inner: &mut Inner, from: u64, name: &str) {
    let mut i = 0;
    while i < inner.event_waiters.len() {
        if inner.event_waiters[i].from == from && inner.event_waiters[i].name == name {
            let waiter = inner.event_waiters.swap_remove(i);
            let _ = waiter.reply.send(Ok(()));
        } else {
            i += 1;
        }
    }
}

/// Resolve whichever in-flight probe accepts an ACK from `sender` (spec
/// §4.3 step 4: "ACK arrives from I (relayed) or from T directly").
async fn resolve_probe(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus, sender: u64) {
    let Some(idx) = inner.probes.iter().position(|p| p.awaiting_from.contains(&sender)) else {
        return;
    };
    let probe = inner.probes.remove(idx);

    // Mark the probed target alive even when the ACK was relayed through an
    // intermediary rather than sent by the target itself.
    let transitioned = match inner.peers.get_mut(&probe.target_id) {
        Some(peer) => peer.on_direct_observation().map(|event| (event, peer.sequence)),
        None => None,
    };
    let pending = match transitioned {
        Some((event, sequence)) => emit_peer_events(inner, probe.target_id, sequence, vec![event]),
        None => Vec::new(),
    };
    for sig in pending {
        publish(inner, transport, signals, sig).await;
    }

    if let Some(relay_to) = probe.relay_to {
        let updates = inner.take_updates();
        let ack = Message::ack(inner.config.id, updates);
        let _ = transport
            .send_to(ack.to_bytes().into(), &relay_to.host, relay_to.port)
            .await;
    }
}

async fn run_protocol_period(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus) {
    gauge!("swim.peer_count").set(inner.peer_count() as f64);
    let advance = inner.scheduler.advance(inner.order.len());
    match advance {
        Advance::Empty => {}
        Advance::Probe { index } | Advance::ProbeAndWrap { index } => {
            let target_id = inner.order[index];
            launch_direct_probe(inner, transport, target_id).await;
        }
    }
    if matches!(advance, Advance::ProbeAndWrap { .. }) {
        info!(epoch_size = inner.order.len(), "protocol-period epoch wrapped; reshuffling");
        scheduler::shuffle(&mut inner.order, &mut inner.rng);
    }
}

async fn launch_direct_probe(inner: &mut Inner, transport: &Arc<dyn Transport>, target_id: u64) {
    let Some(peer) = inner.peers.get(&target_id) else { return };
    let (host, port) = (peer.host.clone(), peer.port);
    let updates = inner.take_updates();
    let ping = Message::ping(inner.config.id, updates);
    let _ = transport.send_to(ping.to_bytes().into(), &host, port).await;
    counter!("swim.pings_sent").increment(1);
    gauge!("swim.update_buffer_len").set(inner.buffer.len() as f64);

    let deadline = Instant::now() + inner.config.probe_timeout;
    inner.probes.push(PendingProbe::direct(target_id, deadline));
}

async fn handle_timeouts(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus) {
    let now = Instant::now();

    let expired: Vec<usize> = inner
        .probes
        .iter()
        .enumerate()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(i, _)| i)
        .collect();
    for &i in expired.iter().rev() {
        let probe = inner.probes.remove(i);
        handle_probe_timeout(inner, transport, signals, probe).await;
    }

    let expired_suspects: Vec<usize> = inner
        .suspect_timers
        .iter()
        .enumerate()
        .filter(|(_, t)| t.deadline <= now)
        .map(|(i, _)| i)
        .collect();
    for &i in expired_suspects.iter().rev() {
        let timer = inner.suspect_timers.remove(i);
        let transitioned = match inner.peers.get_mut(&timer.peer_id) {
            Some(peer) => peer.suspect_timeout_expired().map(|event| (event, peer.sequence)),
            None => None,
        };
        if let Some((event, sequence)) = transitioned {
            let pending = emit_peer_events(inner, timer.peer_id, sequence, vec![event]);
            for sig in pending {
                publish(inner, transport, signals, sig).await;
            }
        }
    }

    let mut i = 0;
    while i < inner.event_waiters.len() {
        if inner.event_waiters[i].deadline <= now {
            let waiter = inner.event_waiters.swap_remove(i);
            let _ = waiter.reply.send(Err(Error::Timeout(waiter.name)));
        } else {
            i += 1;
        }
    }
}

async fn handle_probe_timeout(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus, probe: PendingProbe) {
    if probe.is_relay() {
        // relay probes never escalate or mark suspect (spec §4.4): they
        // just expire silently if the target never acked in time.
        return;
    }

    match probe.stage {
        ProbeStage::AwaitDirectAck => {
            let intermediary = choose_indirect_peer(inner.peers.values(), probe.target_id, &mut inner.rng);
            match intermediary {
                Some(intermediary_id) => {
                    if let Some(mid) = inner.peers.get(&intermediary_id) {
                        let (host, port) = (mid.host.clone(), mid.port);
                        let (target_host, target_port) = inner
                            .peers
                            .get(&probe.target_id)
                            .map(|p| (p.host.clone(), p.port))
                            .unwrap_or_default();
                        let updates = inner.take_updates();
                        let ping_req = Message::ping_req(
                            inner.config.id,
                            updates,
                            probe.target_id,
                            Some(target_host),
                            Some(target_port),
                        );
                        let _ = transport.send_to(ping_req.to_bytes().into(), &host, port).await;

                        let mut escalated = probe;
                        escalated.escalate(Instant::now() + inner.config.probe_timeout, intermediary_id);
                        inner.probes.push(escalated);
                    }
                }
                None => mark_suspect(inner, transport, signals, probe.target_id).await,
            }
        }
        ProbeStage::AwaitIndirectAck => {
            mark_suspect(inner, transport, signals, probe.target_id).await;
        }
    }
}

async fn mark_suspect(inner: &mut Inner, transport: &Arc<dyn Transport>, signals: &SignalBus, target_id: u64) {
    let transitioned = match inner.peers.get_mut(&target_id) {
        Some(peer) => peer.suspect().map(|event| (event, peer.sequence)),
        None => None,
    };
    if let Some((event, sequence)) = transitioned {
        let pending = emit_peer_events(inner, target_id, sequence, vec![event]);
        for sig in pending {
            publish(inner, transport, signals, sig).await;
        }
        // schedule τ₃: suspect→down if never refuted.
        inner.suspect_timers.push(SuspectTimer {
            peer_id: target_id,
            deadline: Instant::now() + inner.config.probe_timeout,
        });
    }
}

async fn handle_command(inner: &mut Inner, transport: &Arc<dyn Transport>, cmd: EngineCommand) {
    match cmd {
        EngineCommand::AddPeer(info) => inner.upsert_peer(info.id, info.host, info.port),
        EngineCommand::RandomPeer(reply) => {
            let _ = reply.send(inner.random_peer());
        }
        EngineCommand::RequestState(id, reply) => {
            let snapshot = inner.peers.get(&id).map(PeerSnapshot::from).ok_or(Error::UnknownPeer(id));
            let _ = reply.send(snapshot);
        }
        EngineCommand::EventReq { id, name, timeout, reply } => {
            let Some(peer) = inner.peers.get(&id) else {
                let _ = reply.send(Err(Error::UnknownPeer(id)));
                return;
            };
            let (host, port) = (peer.host.clone(), peer.port);
            let updates = inner.take_updates();
            let msg = Message::event_req(inner.config.id, updates, name.clone());
            let _ = transport.send_to(msg.to_bytes().into(), &host, port).await;

            inner.event_waiters.push(EventWaiter {
                from: id,
                name,
                deadline: Instant::now() + timeout,
                reply,
            });
        }
        EngineCommand::Stop => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner() -> Inner {
        Inner::new(Config::new(1, "127.0.0.1", 0))
    }

    #[test]
    fn upsert_peer_never_registers_self() {
        let mut inner = test_inner();
        inner.upsert_peer(1, "127.0.0.1".into(), 9000);
        assert!(inner.peers.is_empty());
        assert!(inner.order.is_empty());
    }

    #[test]
    fn upsert_peer_inserts_then_updates_address_in_place() {
        let mut inner = test_inner();
        inner.upsert_peer(2, "host-a".into(), 1000);
        assert_eq!(inner.order, vec![2]);
        assert_eq!(inner.peers[&2].host, "host-a");

        inner.upsert_peer(2, "host-b".into(), 2000);
        assert_eq!(inner.order, vec![2], "re-registering must not duplicate the order entry");
        assert_eq!(inner.peers[&2].host, "host-b");
        assert_eq!(inner.peers[&2].port, 2000);
    }

    #[test]
    fn random_peer_is_none_on_an_empty_table() {
        let mut inner = test_inner();
        assert!(inner.random_peer().is_none());
    }

    #[test]
    fn random_peer_returns_a_registered_peer() {
        let mut inner = test_inner();
        inner.upsert_peer(2, "host-a".into(), 1000);
        inner.upsert_peer(3, "host-b".into(), 2000);
        let snapshot = inner.random_peer().unwrap();
        assert!(snapshot.id == 2 || snapshot.id == 3);
    }

    /// Self-refutation (spec §4.6/§9 invariant 6): a piggybacked suspicion of
    /// our own current sequence bumps it and queues a refuting `alive`.
    #[test]
    fn apply_self_refutation_bumps_sequence_and_queues_alive() {
        let mut inner = test_inner();
        let update = Update::new(1, 0, PeerStatus::Suspect);
        apply_self_refutation(&mut inner, &update);

        assert_eq!(inner.self_sequence, 1);
        let queued = inner.take_updates();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, 1);
        assert_eq!(queued[0].sequence, 1);
        assert_eq!(queued[0].status, PeerStatus::Alive);
    }

    #[test]
    fn apply_self_refutation_ignores_stale_sequence() {
        let mut inner = test_inner();
        inner.self_sequence = 5;
        let update = Update::new(1, 2, PeerStatus::Suspect);
        apply_self_refutation(&mut inner, &update);

        assert_eq!(inner.self_sequence, 5);
        assert!(inner.take_updates().is_empty());
    }

    #[test]
    fn earliest_deadline_is_the_minimum_across_all_timer_kinds() {
        let mut inner = test_inner();
        let now = Instant::now();

        let far = now + Duration::from_secs(10);
        let near = now + Duration::from_millis(50);
        inner.probes.push(PendingProbe::direct(2, far));
        inner.suspect_timers.push(SuspectTimer { peer_id: 3, deadline: near });

        assert_eq!(earliest_deadline(&inner), near);
    }

    #[test]
    fn earliest_deadline_falls_back_when_nothing_pending() {
        let inner = test_inner();
        let deadline = earliest_deadline(&inner);
        assert!(deadline > Instant::now() + Duration::from_secs(60));
    }
}
