//! Transaction engine.
//!
//! A transaction is one exchange with one remote: a Join, an Allow or a
//! Message, seen from the initiator's or the correspondent's side. All
//! six combinations share the [`Transaction`] struct; behavior lives in
//! per-kind modules and is selected by matching on `(kind, role)`.
//!
//! Handlers never touch the transaction table. They receive the stack core
//! (directory, keep, queues) and the transaction itself, and report what
//! the stack should do next through an [`Outcome`].

pub mod allow;
pub mod join;
pub mod message;

use crate::retry::{Redo, RedoAction};
use crate::stack::{Seal, StackCore};
use raet_types::kinds::{BodyKind, HeadKind, PacketKind, TrnsKind};
use raet_types::RaetError;
use raet_wire::packet::RxPacket;
use raet_wire::segment::Reassembly;
use raet_wire::{Head, Packet, Privateer, Publican, SessionKey};
use std::net::SocketAddr;
use tracing::debug;

/// Key of the transaction table.
///
/// Both sides derive the same index for one exchange: `initiator_uid` is
/// the initiator's id for the correspondent, which travels as `se` in
/// initiator packets and as `de` in correspondent packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxIndex {
    /// Set on the correspondent's side.
    pub correspondent: bool,
    /// Initiator's id for the correspondent.
    pub initiator_uid: u32,
    /// Address of the other side.
    pub remote_ha: SocketAddr,
    /// Session id.
    pub sid: u32,
    /// Transaction id.
    pub tid: u32,
    /// Broadcast flag.
    pub broadcast: bool,
}

impl TxIndex {
    /// Index of the local transaction an inbound packet belongs to.
    pub fn inbound(head: &Head, from: SocketAddr) -> Self {
        // `cf` set means the sender is the correspondent, so we initiated
        let correspondent = !head.correspondent;
        Self {
            correspondent,
            initiator_uid: if correspondent {
                head.source
            } else {
                head.destination
            },
            remote_ha: from,
            sid: head.sid,
            tid: head.tid,
            broadcast: head.broadcast,
        }
    }
}

/// Which side of the exchange this stack is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Correspondent,
}

/// Where a transaction is in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Join request sent, awaiting response.
    Requested,
    /// Join waiting on an acceptance decision.
    Pending,
    /// Join response sent, awaiting ack.
    Responded,
    /// Allow hello sent.
    HelloSent,
    /// Allow cookie sent.
    CookieSent,
    /// Allow initiate sent.
    InitiateSent,
    /// Message segments sent, awaiting ack.
    Sending,
    /// Message segments arriving.
    Receiving,
}

/// Allow handshake material.
#[derive(Debug)]
pub struct AllowData {
    /// Our ephemeral key for this handshake only.
    pub eph: Privateer,
    /// The other side's ephemeral public key.
    pub peer_eph: Option<Publican>,
    /// Session derived from the ephemeral pair.
    pub session: Option<SessionKey>,
}

/// Message payload state.
#[derive(Debug)]
pub enum MessageData {
    /// Packets kept for whole-message resends.
    Outbound { packets: Vec<Packet> },
    /// Sections collected so far.
    Inbound {
        book: Reassembly,
        body_kind: BodyKind,
    },
}

/// Kind-specific transaction state.
#[derive(Debug)]
pub enum TxData {
    Join,
    Allow(AllowData),
    Message(MessageData),
}

/// What the stack should do with a transaction after a handler ran.
#[derive(Debug)]
pub enum Outcome {
    /// Keep it in the table.
    Continue,
    /// Finished; remove it.
    Done,
    /// Aborted; remove it and report the error.
    Failed(RaetError),
    /// Remove it and start a vacuous Join with the same remote.
    Rejoin,
}

/// One exchange in progress.
#[derive(Debug)]
pub struct Transaction {
    pub index: TxIndex,
    pub kind: TrnsKind,
    pub role: Role,
    pub state: TxState,
    /// Our uid for the remote.
    pub remote_uid: u32,
    /// `se` of outgoing packets.
    pub se: u32,
    /// `de` of outgoing packets.
    pub de: u32,
    pub expires_at: u64,
    pub redo: Option<Redo>,
    /// Last packet(s) sent, for resends.
    pub last: Vec<Vec<u8>>,
    pub data: TxData,
}

impl Transaction {
    /// Outgoing head for this transaction.
    pub fn head(&self, head_kind: HeadKind, packet_kind: PacketKind) -> Head {
        Head {
            packet_kind,
            head_kind,
            source: self.se,
            destination: self.de,
            correspondent: self.role == Role::Correspondent,
            broadcast: self.index.broadcast,
            sid: self.index.sid,
            tid: self.index.tid,
            trns_kind: self.kind,
            ..Default::default()
        }
    }

    /// Address of the other side.
    pub fn ha(&self) -> SocketAddr {
        self.index.remote_ha
    }

    /// Pack and queue a packet, remembering it as the last one sent.
    pub(crate) fn send(
        &mut self,
        core: &mut StackCore,
        kind: PacketKind,
        body: raet_wire::Body,
        seal: Seal,
    ) -> Result<(), RaetError> {
        let mut head = self.head(core.config.head_kind, kind);
        if matches!(body, raet_wire::Body::Data(_)) {
            head.body_kind = core.doc_kind();
        }
        let bytes = core.pack(&mut Packet::new(head, body), seal)?;
        core.enqueue(self.ha(), bytes.clone());
        self.last = vec![bytes];
        Ok(())
    }

    fn resend_last(&self, core: &mut StackCore) {
        for bytes in &self.last {
            core.enqueue(self.ha(), bytes.clone());
        }
    }
}

/// Head answering `rx` within the same exchange.
pub(crate) fn reply_head(rx: &Head, kind: PacketKind, head_kind: HeadKind) -> Head {
    Head {
        packet_kind: kind,
        head_kind,
        source: rx.destination,
        destination: rx.source,
        correspondent: !rx.correspondent,
        broadcast: rx.broadcast,
        sid: rx.sid,
        tid: rx.tid,
        trns_kind: rx.trns_kind,
        ..Default::default()
    }
}

/// Whether a packet from the transaction's remote checks out: sealed
/// packets must open under the session, signed ones must verify. Plain
/// packets pass only while the remote's keys are still unknown.
pub(crate) fn authentic(core: &StackCore, tx: &Transaction, rx: &RxPacket) -> bool {
    let Some(remote) = core.directory.get(tx.remote_uid) else {
        return false;
    };
    if rx.is_sealed() {
        return match remote.session() {
            Some(session) => rx.body_bytes(Some(&session.key)).is_ok(),
            None => false,
        };
    }
    match (rx.is_signed(), remote.verfer) {
        (true, Some(verfer)) => rx.verify(&verfer).is_ok(),
        (_, None) => tx.kind == TrnsKind::Join,
        (false, Some(_)) => false,
    }
}

/// Feed an inbound packet to its transaction.
pub(crate) fn receive(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    match (tx.kind, tx.role) {
        (TrnsKind::Join, Role::Initiator) => join::joiner_receive(core, tx, rx),
        (TrnsKind::Join, Role::Correspondent) => join::joinent_receive(core, tx, rx),
        (TrnsKind::Allow, Role::Initiator) => allow::allower_receive(core, tx, rx),
        (TrnsKind::Allow, Role::Correspondent) => allow::allowent_receive(core, tx, rx),
        (TrnsKind::Message, Role::Initiator) => message::messenger_receive(core, tx, rx),
        (TrnsKind::Message, Role::Correspondent) => message::messengent_receive(core, tx, rx),
    }
}

/// Evaluate timers: expiry first, then kind-specific work, then resends.
pub(crate) fn process(core: &mut StackCore, tx: &mut Transaction) -> Outcome {
    let now = core.now();
    if now >= tx.expires_at {
        return Outcome::Failed(RaetError::Timeout(format!(
            "{:?} {:?} with remote {} (tid {})",
            tx.kind, tx.role, tx.remote_uid, tx.index.tid
        )));
    }

    if tx.kind == TrnsKind::Join && tx.role == Role::Correspondent {
        let outcome = join::joinent_process(core, tx);
        if !matches!(outcome, Outcome::Continue) {
            return outcome;
        }
    }

    let action = match tx.redo.as_mut() {
        Some(redo) => redo.check(now),
        None => RedoAction::Wait,
    };
    match action {
        RedoAction::Wait => Outcome::Continue,
        RedoAction::Exhausted => Outcome::Failed(RaetError::Timeout(format!(
            "{:?} with remote {} unanswered after {} sends",
            tx.kind,
            tx.remote_uid,
            tx.redo.as_ref().map_or(0, Redo::sends)
        ))),
        RedoAction::Resend => {
            debug!(
                uid = tx.remote_uid,
                tid = tx.index.tid,
                kind = ?tx.kind,
                "RAET: resending"
            );
            if tx.kind == TrnsKind::Message && tx.role == Role::Initiator {
                message::resend_all(core, tx)
            } else {
                tx.resend_last(core);
                Outcome::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ha(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_index_agrees_across_sides() {
        // initiator A knows correspondent B as uid 5; B knows A as uid 9
        let a_ha = ha(7001);
        let b_ha = ha(7002);
        let a_index = TxIndex {
            correspondent: false,
            initiator_uid: 5,
            remote_ha: b_ha,
            sid: 3,
            tid: 4,
            broadcast: false,
        };

        let request = Head {
            source: 5,
            destination: 9,
            sid: 3,
            tid: 4,
            ..Default::default()
        };
        let b_index = TxIndex::inbound(&request, a_ha);
        assert!(b_index.correspondent);
        assert_eq!(b_index.initiator_uid, 5);

        let response = reply_head(&request, PacketKind::Ack, HeadKind::Json);
        assert!(response.correspondent);
        assert_eq!(response.source, 9);
        assert_eq!(response.destination, 5);
        assert_eq!(TxIndex::inbound(&response, b_ha), a_index);
    }

    #[test]
    fn test_vacuous_request_index() {
        // a vacuous join carries de = 0; the index only needs se
        let request = Head {
            source: 2,
            destination: 0,
            trns_kind: TrnsKind::Join,
            packet_kind: PacketKind::Request,
            tid: 1,
            ..Default::default()
        };
        let index = TxIndex::inbound(&request, ha(7001));
        assert_eq!(index.initiator_uid, 2);
        assert_eq!(index.sid, 0);
    }
}
