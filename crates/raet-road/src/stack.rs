//! Road stack: one UDP endpoint and everything it knows.
//!
//! [`RoadStack`] owns the peer directory, the keep, the transaction table
//! and the queues between the application and the socket. Nothing happens
//! until the owner calls [`RoadStack::service_all`], which runs one tick:
//!
//! 1. drain the socket into the receive queue
//! 2. parse each packet's head and route it, dropping malformed ones
//! 3. hand it to its transaction, or start a correspondent one, or nack it
//! 4. run timers on every live transaction
//! 5. turn queued application messages into messenger transactions
//! 6. flush the transmit queue; on would-block, keep the rest for next tick
//!
//! The stack is single-writer: one execution context owns it and calls the
//! tick, so the directory and the transaction table need no locking.

use crate::clock::{Clock, SystemClock};
use crate::config::validate_config;
use crate::directory::Directory;
use crate::estate::{is_fresh, LocalEstate, RemoteEstate};
use crate::keep::Keep;
use crate::transaction::{self, allow, join, message, reply_head, Outcome, Role, Transaction, TxIndex};
use crate::transport::{Transport, UdpTransport};
use raet_types::config::StackConfig;
use raet_types::kinds::{Acceptance, BodyKind, PacketKind, TrnsKind};
use raet_types::{RaetError, RaetResult};
use raet_wire::packet::{RxPacket, Sealing};
use raet_wire::{Body, Head, Packet, SessionKey};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receive buffer, large enough for any datagram.
const RX_BUFFER_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How an outgoing packet is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seal {
    /// Signed with the local long-term key.
    Signed,
    /// Body sealed under the session held with this remote.
    Session(u32),
}

/// Decides pending remote identities. Consulted each tick for every join
/// held pending; returning `Pending` leaves the decision for later.
pub trait AcceptPolicy: Send {
    fn decide(&self, remote: &RemoteEstate) -> Acceptance;
}

impl<F> AcceptPolicy for F
where
    F: Fn(&RemoteEstate) -> Acceptance + Send,
{
    fn decide(&self, remote: &RemoteEstate) -> Acceptance {
        self(remote)
    }
}

/// A whole, verified application message.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// Sender's uid in this stack.
    pub uid: u32,
    /// Sender's name.
    pub name: String,
    pub body: Value,
}

/// A transaction that ended without completing.
#[derive(Debug)]
pub struct Failure {
    pub uid: u32,
    pub kind: TrnsKind,
    pub error: RaetError,
}

/// Per-stack counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub malformed_packet: u64,
    pub stale_session: u64,
    pub invalid_destination: u64,
    pub trust_failure: u64,
    pub transaction_timeout: u64,
    pub transaction_failed: u64,
    pub segment_dropped: u64,
    pub duplicate_message: u64,
    pub messages_delivered: u64,
    pub would_block: u64,
}

// ---------------------------------------------------------------------------
// Core shared with transaction handlers
// ---------------------------------------------------------------------------

/// Everything a transaction handler may touch. The transaction table is
/// deliberately not part of it.
pub struct StackCore {
    pub(crate) config: StackConfig,
    pub(crate) local: LocalEstate,
    pub(crate) directory: Directory,
    pub(crate) keep: Keep,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) tx_queue: VecDeque<(SocketAddr, Vec<u8>)>,
    pub(crate) inbox: VecDeque<Received>,
    pub(crate) failures: Vec<Failure>,
    pub(crate) stats: StackStats,
    pub(crate) policy: Option<Box<dyn AcceptPolicy>>,
    /// Seals Allow cookies. Never leaves this stack.
    pub(crate) cookie_key: SessionKey,
    /// Cookies already redeemed, keyed by initiator ephemeral key, with
    /// the time they stop being redeemable.
    pub(crate) cookies_seen: HashMap<[u8; 32], u64>,
}

impl StackCore {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Serialization for message documents.
    pub(crate) fn doc_kind(&self) -> BodyKind {
        match self.config.body_kind {
            BodyKind::Msgpack => BodyKind::Msgpack,
            _ => BodyKind::Json,
        }
    }

    pub(crate) fn pack(&self, packet: &mut Packet, seal: Seal) -> RaetResult<Vec<u8>> {
        let sealing = match seal {
            Seal::Signed => Sealing {
                session: None,
                signer: Some(&self.local.signer),
            },
            Seal::Session(uid) => {
                let remote = self
                    .directory
                    .get(uid)
                    .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
                let session = remote.session().ok_or(RaetError::NotAllowed(uid))?;
                return Ok(packet.pack(
                    Sealing {
                        session: Some(&session.key),
                        signer: None,
                    },
                    self.config.max_packet_size,
                )?);
            }
        };
        Ok(packet.pack(sealing, self.config.max_packet_size)?)
    }

    pub(crate) fn enqueue(&mut self, to: SocketAddr, bytes: Vec<u8>) {
        self.tx_queue.push_back((to, bytes));
    }

    /// Answer `head` outside any transaction with a signed, empty packet.
    pub(crate) fn reply(&mut self, head: &Head, to: SocketAddr, kind: PacketKind) {
        let head = reply_head(head, kind, self.config.head_kind);
        match self.pack(&mut Packet::new(head, Body::Nada), Seal::Signed) {
            Ok(bytes) => self.enqueue(to, bytes),
            Err(e) => warn!(error = %e, ?kind, %to, "RAET: failed to pack reply"),
        }
    }

    /// Record an acceptance decision for `uid`. Remotes sharing its role and
    /// keys are bound by the same decision. A rejected remote loses its
    /// session.
    pub(crate) fn decide(&mut self, uid: u32, status: Acceptance) -> RaetResult<()> {
        let remote = self
            .directory
            .get_mut(uid)
            .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
        match status {
            Acceptance::Accepted => self.keep.accept_remote(remote)?,
            Acceptance::Rejected => {
                remote.clear_session();
                self.keep.reject_remote(remote)?;
            }
            Acceptance::Pending => return Ok(()),
        }
        let (role, verfer, pubber) = (remote.role.clone(), remote.verfer, remote.pubber);
        if role.is_empty() {
            return Ok(());
        }
        for other in self.directory.iter_mut().filter(|r| {
            r.uid != uid && r.role == role && r.verfer == verfer && r.pubber == pubber
        }) {
            other.acceptance = status;
            if status == Acceptance::Rejected {
                other.clear_session();
            }
            self.keep.dump_remote_safe(other)?;
            debug!(uid = other.uid, %role, ?status, "RAET: role decision applied");
        }
        Ok(())
    }

    fn persist(&self, uid: u32) {
        if let Some(remote) = self.directory.get(uid) {
            if let Err(e) = self.keep.dump_remote(remote) {
                warn!(error = %e, uid, "RAET: failed to persist remote");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RoadStack
// ---------------------------------------------------------------------------

/// A UDP road stack.
pub struct RoadStack {
    core: StackCore,
    transactions: BTreeMap<TxIndex, Transaction>,
    rx_queue: VecDeque<(Vec<u8>, SocketAddr)>,
    tx_msgs: VecDeque<(u32, Value)>,
}

impl RoadStack {
    /// Create a stack over `transport`, loading or creating its keep.
    ///
    /// On a keep that already holds a local estate, keys and name are
    /// reloaded and every saved remote is restored; address, role and
    /// main flag always come from `config`.
    pub fn new(
        config: StackConfig,
        transport: Box<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> RaetResult<Self> {
        validate_config(&config)?;
        let keep = Keep::open(config.resolved_keep_dir())?;
        let ha = transport.local_addr();
        let local = match keep.load_local()? {
            Some(mut local) => {
                local.ha = ha;
                local.main = config.main;
                local.role = config.role.clone();
                local.kind = config.kind;
                info!(name = %local.name, "RAET: reloaded local estate");
                local
            }
            None => {
                let mut local = LocalEstate::generate(&config);
                local.ha = ha;
                local
            }
        };
        keep.dump_local(&local)?;

        let mut directory = Directory::new();
        for remote in keep.load_remotes()? {
            directory.add(remote)?;
        }

        info!(
            name = %local.name,
            %ha,
            main = local.main,
            remotes = directory.len(),
            "RAET: road stack opened"
        );
        Ok(Self {
            core: StackCore {
                config,
                local,
                directory,
                keep,
                clock,
                transport,
                tx_queue: VecDeque::new(),
                inbox: VecDeque::new(),
                failures: Vec::new(),
                stats: StackStats::default(),
                policy: None,
                cookie_key: SessionKey::generate(),
                cookies_seen: HashMap::new(),
            },
            transactions: BTreeMap::new(),
            rx_queue: VecDeque::new(),
            tx_msgs: VecDeque::new(),
        })
    }

    /// Bind a UDP socket at the configured address and open a stack on it.
    pub fn open(config: StackConfig) -> RaetResult<Self> {
        let transport = UdpTransport::bind(config.ha)?;
        Self::new(config, Box::new(transport), Arc::new(SystemClock))
    }

    // -- accessors ----------------------------------------------------------

    pub fn local(&self) -> &LocalEstate {
        &self.core.local
    }

    pub fn name(&self) -> &str {
        &self.core.local.name
    }

    pub fn ha(&self) -> SocketAddr {
        self.core.local.ha
    }

    pub fn config(&self) -> &StackConfig {
        &self.core.config
    }

    pub fn remote(&self, uid: u32) -> Option<&RemoteEstate> {
        self.core.directory.get(uid)
    }

    pub fn remote_uid(&self, name: &str) -> Option<u32> {
        self.core.directory.uid_by_name(name)
    }

    pub fn remote_uid_by_ha(&self, ha: &SocketAddr) -> Option<u32> {
        self.core.directory.uid_by_ha(ha)
    }

    /// All known remotes, in no particular order.
    pub fn remotes(&self) -> impl Iterator<Item = &RemoteEstate> {
        self.core.directory.iter()
    }

    pub fn stats(&self) -> &StackStats {
        &self.core.stats
    }

    /// Number of live transactions.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Number of packets waiting to be sent.
    pub fn tx_pending(&self) -> usize {
        self.core.tx_queue.len()
    }

    // -- remotes ------------------------------------------------------------

    /// Register a remote known only by address. Join fills in the rest.
    pub fn add_vacuous_remote(&mut self, ha: SocketAddr) -> RaetResult<u32> {
        if self.core.directory.uid_by_ha(&ha).is_some() {
            return Err(RaetError::RemoteExists(format!("ha {ha}")));
        }
        let uid = self.core.directory.allocate_uid();
        self.core.directory.add(RemoteEstate::vacuous(uid, ha))?;
        self.core.persist(uid);
        debug!(uid, %ha, "RAET: vacuous remote added");
        Ok(uid)
    }

    /// Mark a remote trusted, with every remote sharing its role. A join
    /// held pending on any of them proceeds next tick.
    pub fn accept_remote(&mut self, uid: u32) -> RaetResult<()> {
        self.core.decide(uid, Acceptance::Accepted)?;
        info!(uid, "RAET: remote accepted");
        Ok(())
    }

    /// Mark a remote distrusted, with every remote sharing its role, and
    /// drop their sessions.
    pub fn reject_remote(&mut self, uid: u32) -> RaetResult<()> {
        self.core.decide(uid, Acceptance::Rejected)?;
        info!(uid, "RAET: remote rejected");
        Ok(())
    }

    /// Forget a remote: its transactions, directory entry and keep files.
    pub fn delete_remote(&mut self, uid: u32) -> RaetResult<()> {
        self.core
            .directory
            .remove(uid)
            .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
        self.transactions.retain(|_, tx| tx.remote_uid != uid);
        self.tx_msgs.retain(|(to, _)| *to != uid);
        self.core.keep.remove_remote(uid)?;
        info!(uid, "RAET: remote deleted");
        Ok(())
    }

    /// Install the policy consulted for pending joins.
    pub fn set_accept_policy(&mut self, policy: impl AcceptPolicy + 'static) {
        self.core.policy = Some(Box::new(policy));
    }

    // -- exchanges ----------------------------------------------------------

    fn initiating(&self, uid: u32, kind: TrnsKind) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.remote_uid == uid && tx.kind == kind && tx.role == Role::Initiator)
    }

    /// Start a Join with `uid`. No-op while one is already running.
    pub fn join(&mut self, uid: u32) -> RaetResult<()> {
        if self.initiating(uid, TrnsKind::Join) {
            return Ok(());
        }
        let tx = join::start_joiner(&mut self.core, uid)?;
        self.transactions.insert(tx.index, tx);
        Ok(())
    }

    /// Join the configured controller, registering it vacuously if new.
    pub fn bootstrap(&mut self) -> RaetResult<u32> {
        let main_ha = self
            .core
            .config
            .main_ha
            .ok_or_else(|| RaetError::Config("main_ha is not set".to_string()))?;
        let uid = match self.core.directory.uid_by_ha(&main_ha) {
            Some(uid) => uid,
            None => self.add_vacuous_remote(main_ha)?,
        };
        self.join(uid)?;
        Ok(uid)
    }

    /// Start an Allow with a joined remote. No-op while one is running.
    pub fn allow(&mut self, uid: u32) -> RaetResult<()> {
        if self.initiating(uid, TrnsKind::Allow) {
            return Ok(());
        }
        let tx = allow::start_allower(&mut self.core, uid)?;
        self.transactions.insert(tx.index, tx);
        Ok(())
    }

    /// Queue `body` for delivery to `uid` on the next tick.
    pub fn transmit(&mut self, uid: u32, body: Value) -> RaetResult<()> {
        let remote = self
            .core
            .directory
            .get(uid)
            .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
        if !remote.joined {
            return Err(RaetError::NotJoined(uid));
        }
        if !remote.allowed() {
            return Err(RaetError::NotAllowed(uid));
        }
        self.tx_msgs.push_back((uid, body));
        Ok(())
    }

    /// Take every message received so far, in completion order.
    pub fn drain_inbox(&mut self) -> Vec<Received> {
        self.core.inbox.drain(..).collect()
    }

    pub fn inbox_len(&self) -> usize {
        self.core.inbox.len()
    }

    /// Take the failures reported since the last call.
    pub fn failures(&mut self) -> Vec<Failure> {
        std::mem::take(&mut self.core.failures)
    }

    // -- service loop -------------------------------------------------------

    /// Run one tick.
    pub fn service_all(&mut self) {
        self.service_receives();
        self.service_rx_queue();
        self.process_transactions();
        self.service_tx_msgs();
        self.service_tx_queue();
    }

    fn service_receives(&mut self) {
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        loop {
            match self.core.transport.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.core.stats.packets_received += 1;
                    self.rx_queue.push_back((buf[..n].to_vec(), from));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "RAET: receive failed");
                    break;
                }
            }
        }
    }

    fn service_rx_queue(&mut self) {
        while let Some((raw, from)) = self.rx_queue.pop_front() {
            let rx = match RxPacket::parse_outer(raw) {
                Ok(rx) => rx,
                Err(e) => {
                    self.core.stats.malformed_packet += 1;
                    debug!(error = %e, %from, "RAET: dropping malformed packet");
                    continue;
                }
            };
            let index = TxIndex::inbound(&rx.head, from);
            match self.transactions.get_mut(&index) {
                Some(tx) => {
                    let outcome = transaction::receive(&mut self.core, tx, &rx);
                    self.settle(index, outcome);
                }
                None => self.handle_unmatched(rx, from),
            }
        }
    }

    fn handle_unmatched(&mut self, rx: RxPacket, from: SocketAddr) {
        let head = &rx.head;
        let kind = head.packet_kind;

        if head.correspondent {
            // answer to an exchange we no longer hold
            if !kind.is_terminal() {
                self.core.stats.stale_session += 1;
                debug!(?kind, tid = head.tid, %from, "RAET: stale correspondent packet");
                self.core.reply(head, from, PacketKind::Nack);
            }
            return;
        }

        if (head.trns_kind, kind) == (TrnsKind::Join, PacketKind::Request) {
            if head.destination != 0
                && self.core.local.main
                && self.core.directory.get(head.destination).is_none()
            {
                self.core.stats.invalid_destination += 1;
                debug!(de = head.destination, %from, "RAET: join names unknown uid, renewing");
                self.core.reply(head, from, PacketKind::Renew);
                return;
            }
            if let Some(tx) = join::start_joinent(&mut self.core, &rx, from) {
                self.transactions.insert(tx.index, tx);
            }
            return;
        }

        if kind.is_terminal() {
            debug!(?kind, %from, "RAET: dropping unmatched terminal packet");
            return;
        }

        let uid = head.destination;
        let Some(remote) = self.core.directory.get(uid) else {
            self.core.stats.invalid_destination += 1;
            debug!(de = uid, %from, "RAET: packet for unknown remote");
            self.core.reply(head, from, PacketKind::Unjoined);
            return;
        };

        match (head.trns_kind, kind) {
            (TrnsKind::Allow, PacketKind::Hello) => self.handle_hello(&rx, from, uid),
            (TrnsKind::Allow, PacketKind::Initiate) if remote.is_done(head.sid, head.tid) => {
                // our ack was lost; the session is already in place
                debug!(uid, sid = head.sid, "RAET: repeated initiate, re-acking");
                self.core.reply(head, from, PacketKind::Ack);
            }
            (TrnsKind::Message, PacketKind::Message) => self.route_message(&rx, from, uid),
            _ => {
                self.core.stats.stale_session += 1;
                debug!(uid, ?kind, sid = head.sid, tid = head.tid, "RAET: no exchange for packet");
                self.core.reply(head, from, PacketKind::Nack);
            }
        }
    }

    fn handle_hello(&mut self, rx: &RxPacket, from: SocketAddr, uid: u32) {
        let head = &rx.head;
        let Some(remote) = self.core.directory.get(uid) else {
            return;
        };
        if !remote.joined || remote.acceptance != Acceptance::Accepted {
            debug!(uid, "RAET: hello from remote that is not joined");
            self.core.reply(head, from, PacketKind::Unjoined);
            return;
        }
        if !is_fresh(head.sid, remote.rsid) || remote.is_done(head.sid, head.tid) {
            self.core.stats.stale_session += 1;
            debug!(uid, sid = head.sid, last = remote.rsid, "RAET: stale hello");
            self.core.reply(head, from, PacketKind::Nack);
            return;
        }
        if let Some(tx) = allow::start_allowent(&mut self.core, rx, from, uid) {
            self.transactions.insert(tx.index, tx);
        }
    }

    fn route_message(&mut self, rx: &RxPacket, from: SocketAddr, uid: u32) {
        let head = &rx.head;
        let Some(remote) = self.core.directory.get(uid) else {
            return;
        };
        if !remote.joined {
            self.core.reply(head, from, PacketKind::Unjoined);
            return;
        }
        let Some(session) = remote.session() else {
            debug!(uid, "RAET: message without a session");
            self.core.reply(head, from, PacketKind::Unallowed);
            return;
        };
        if head.sid != session.sid {
            self.core.stats.stale_session += 1;
            debug!(uid, sid = head.sid, current = session.sid, "RAET: message under stale session");
            self.core.reply(head, from, PacketKind::Nack);
            return;
        }
        if remote.is_done(head.sid, head.tid) {
            self.core.stats.duplicate_message += 1;
            message::reack(&mut self.core, rx, from, uid);
            return;
        }
        if let Some(tx) = message::start_messengent(&mut self.core, rx, from, uid) {
            self.transactions.insert(tx.index, tx);
        }
    }

    fn process_transactions(&mut self) {
        let keys: Vec<TxIndex> = self.transactions.keys().copied().collect();
        for index in keys {
            let Some(tx) = self.transactions.get_mut(&index) else {
                continue;
            };
            let outcome = transaction::process(&mut self.core, tx);
            self.settle(index, outcome);
        }
    }

    fn service_tx_msgs(&mut self) {
        while let Some((uid, body)) = self.tx_msgs.pop_front() {
            match message::start_messenger(&mut self.core, uid, &body) {
                Ok(tx) => {
                    self.transactions.insert(tx.index, tx);
                }
                Err(error) => {
                    warn!(error = %error, uid, "RAET: cannot send message");
                    self.core.stats.transaction_failed += 1;
                    self.core.failures.push(Failure {
                        uid,
                        kind: TrnsKind::Message,
                        error,
                    });
                }
            }
        }
    }

    fn service_tx_queue(&mut self) {
        while let Some((to, bytes)) = self.core.tx_queue.pop_front() {
            match self.core.transport.send_to(&bytes, to) {
                Ok(_) => self.core.stats.packets_sent += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.core.tx_queue.push_front((to, bytes));
                    self.core.stats.would_block += 1;
                    break;
                }
                Err(e) => warn!(error = %e, %to, "RAET: send failed, dropping packet"),
            }
        }
    }

    /// Apply a handler's outcome to the transaction table.
    fn settle(&mut self, index: TxIndex, outcome: Outcome) {
        match outcome {
            Outcome::Continue => {}
            Outcome::Done => {
                self.transactions.remove(&index);
            }
            Outcome::Failed(error) => {
                let Some(tx) = self.transactions.remove(&index) else {
                    return;
                };
                match error {
                    RaetError::Timeout(_) => self.core.stats.transaction_timeout += 1,
                    _ => self.core.stats.transaction_failed += 1,
                }
                warn!(
                    uid = tx.remote_uid,
                    kind = ?tx.kind,
                    role = ?tx.role,
                    tid = tx.index.tid,
                    error = %error,
                    "RAET: transaction failed"
                );
                self.core.failures.push(Failure {
                    uid: tx.remote_uid,
                    kind: tx.kind,
                    error,
                });
            }
            Outcome::Rejoin => {
                let Some(tx) = self.transactions.remove(&index) else {
                    return;
                };
                let uid = tx.remote_uid;
                if let Some(remote) = self.core.directory.get_mut(uid) {
                    remote.unjoin();
                }
                self.core.persist(uid);
                if let Err(error) = self.join(uid) {
                    warn!(error = %error, uid, "RAET: cannot restart join");
                    self.core.failures.push(Failure {
                        uid,
                        kind: TrnsKind::Join,
                        error,
                    });
                }
            }
        }
    }
}
