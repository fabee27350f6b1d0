//! Message: deliver one application document under the current session.
//!
//! A document that fits one packet travels as a sealed `message` and is
//! acked at once; the receiver keeps no transaction for it. Larger
//! documents are serialized, cut into sections and sent as raw segments
//! carrying the section number, count and whole length; the receiver
//! collects them all-or-nothing and acks once the document is whole. The
//! sender resends every segment with `af` set until it sees the ack.

use super::{authentic, reply_head, MessageData, Outcome, Role, Transaction, TxData, TxIndex, TxState};
use crate::retry::Redo;
use crate::stack::{Received, Seal, StackCore};
use raet_types::kinds::{BodyKind, PacketKind, TrnsKind};
use raet_types::{RaetError, RaetResult};
use raet_wire::packet::{deserialize_body, serialize_body, RxPacket, MAX_HEAD_SIZE};
use raet_wire::segment::{segment, Reassembly};
use raet_wire::{Body, Head, Packet};
use serde_json::Value;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Room for the neck and a margin on top of the head ceiling.
const NECK_ROOM: usize = 40;

/// Largest section that fits one sealed packet.
pub fn section_size(max_packet_size: usize) -> usize {
    max_packet_size.saturating_sub(MAX_HEAD_SIZE + NECK_ROOM)
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Start delivering `body` to `uid`.
pub(crate) fn start_messenger(core: &mut StackCore, uid: u32, body: &Value) -> RaetResult<Transaction> {
    let now = core.now();
    let kind = core.doc_kind();
    let head_kind = core.config.head_kind;
    let section = section_size(core.config.max_packet_size);
    let remote = core
        .directory
        .get_mut(uid)
        .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
    if !remote.joined {
        return Err(RaetError::NotJoined(uid));
    }
    let sid = remote.session().map(|s| s.sid).ok_or(RaetError::NotAllowed(uid))?;
    let tid = remote.next_tid();

    let mut tx = Transaction {
        index: TxIndex {
            correspondent: false,
            initiator_uid: remote.uid,
            remote_ha: remote.ha,
            sid,
            tid,
            broadcast: false,
        },
        kind: TrnsKind::Message,
        role: Role::Initiator,
        state: TxState::Sending,
        remote_uid: uid,
        se: remote.uid,
        de: remote.fuid,
        expires_at: now + core.config.timeouts.transaction_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Message(MessageData::Outbound {
            packets: Vec::new(),
        }),
    };

    let bytes = serialize_body(kind, body)?;
    let mut packets = Vec::new();
    if bytes.len() <= section {
        let mut head = tx.head(head_kind, PacketKind::Message);
        head.body_kind = kind;
        head.wait = true;
        packets.push(Packet::new(head, Body::Data(body.clone())));
    } else {
        let sections = segment(&bytes, section)?;
        let count = sections.len();
        for (sn, piece) in sections.into_iter().enumerate() {
            let mut head = tx.head(head_kind, PacketKind::Message);
            head.body_kind = kind;
            head.wait = true;
            head.segment = sn as u16;
            head.segment_count = count as u16;
            head.message_len = bytes.len() as u32;
            packets.push(Packet::new(head, Body::Raw(piece.to_vec())));
        }
    }

    let ha = tx.ha();
    let mut sent = Vec::with_capacity(packets.len());
    for packet in &mut packets {
        let wire = core.pack(packet, Seal::Session(uid))?;
        core.enqueue(ha, wire.clone());
        sent.push(wire);
    }
    debug!(uid, sid, tid, segments = packets.len(), "RAET: message sent");
    tx.last = sent;
    tx.data = TxData::Message(MessageData::Outbound { packets });
    tx.redo = Some(Redo::start(&core.config.retry, now));
    Ok(tx)
}

pub(crate) fn messenger_receive(
    core: &mut StackCore,
    tx: &mut Transaction,
    rx: &RxPacket,
) -> Outcome {
    if !authentic(core, tx, rx) {
        core.stats.trust_failure += 1;
        debug!(uid = tx.remote_uid, "RAET: messenger dropping unverified packet");
        return Outcome::Continue;
    }
    match rx.head.packet_kind {
        PacketKind::Ack => {
            debug!(uid = tx.remote_uid, tid = tx.index.tid, "RAET: message acked");
            Outcome::Done
        }
        kind @ (PacketKind::Unjoined | PacketKind::Unallowed) => {
            if let Some(remote) = core.directory.get_mut(tx.remote_uid) {
                remote.clear_session();
                if kind == PacketKind::Unjoined {
                    remote.joined = false;
                }
            }
            info!(uid = tx.remote_uid, ?kind, "RAET: message refused, session dropped");
            Outcome::Failed(if kind == PacketKind::Unjoined {
                RaetError::NotJoined(tx.remote_uid)
            } else {
                RaetError::NotAllowed(tx.remote_uid)
            })
        }
        kind if kind.is_nack() => {
            Outcome::Failed(RaetError::Refused(format!("message answered with {kind:?}")))
        }
        other => {
            debug!(kind = ?other, "RAET: messenger ignoring packet");
            Outcome::Continue
        }
    }
}

/// Resend every segment of the message with `af` set.
pub(crate) fn resend_all(core: &mut StackCore, tx: &mut Transaction) -> Outcome {
    let ha = tx.ha();
    let uid = tx.remote_uid;
    let TxData::Message(MessageData::Outbound { packets }) = &mut tx.data else {
        return Outcome::Continue;
    };
    let mut sent = Vec::with_capacity(packets.len());
    for packet in packets.iter_mut() {
        packet.head.resend_all = true;
        match core.pack(packet, Seal::Session(uid)) {
            Ok(wire) => {
                core.enqueue(ha, wire.clone());
                sent.push(wire);
            }
            Err(e) => return Outcome::Failed(e),
        }
    }
    tx.last = sent;
    Outcome::Continue
}

// ---------------------------------------------------------------------------
// Messengent
// ---------------------------------------------------------------------------

fn deliver(core: &mut StackCore, uid: u32, body: Value) {
    let name = core
        .directory
        .get(uid)
        .map(|r| r.name.clone())
        .unwrap_or_default();
    debug!(uid, %name, "RAET: message delivered");
    core.stats.messages_delivered += 1;
    core.inbox.push_back(Received { uid, name, body });
}

/// Ack a message outside any transaction, sealed under the session.
fn ack(core: &mut StackCore, head: &Head, to: SocketAddr, uid: u32) {
    let head = reply_head(head, PacketKind::Ack, core.config.head_kind);
    match core.pack(&mut Packet::new(head, Body::Nada), Seal::Session(uid)) {
        Ok(wire) => core.enqueue(to, wire),
        Err(e) => warn!(error = %e, uid, "RAET: failed to ack message"),
    }
}

/// Re-ack a message that was already delivered.
pub(crate) fn reack(core: &mut StackCore, rx: &RxPacket, from: SocketAddr, uid: u32) {
    debug!(uid, tid = rx.head.tid, "RAET: duplicate message, re-acking");
    ack(core, &rx.head, from, uid);
}

/// Handle the first packet of a message from `uid`. The stack has already
/// checked the session. A whole document is delivered and acked here;
/// the first segment of a larger one opens a transaction.
pub(crate) fn start_messengent(
    core: &mut StackCore,
    rx: &RxPacket,
    from: SocketAddr,
    uid: u32,
) -> Option<Transaction> {
    let remote = core.directory.get(uid)?;
    let body = match remote.session().map(|s| rx.body(Some(&s.key))) {
        Some(Ok(body)) => body,
        _ => {
            core.stats.trust_failure += 1;
            debug!(uid, "RAET: message did not open under session");
            return None;
        }
    };
    let (sid, tid) = (rx.head.sid, rx.head.tid);

    if !rx.head.is_segmented() {
        let Body::Data(value) = body else {
            core.stats.malformed_packet += 1;
            warn!(uid, "RAET: message without a document body");
            return None;
        };
        deliver(core, uid, value);
        ack(core, &rx.head, from, uid);
        if let Some(remote) = core.directory.get_mut(uid) {
            remote.record_done(sid, tid);
        }
        return None;
    }

    let Body::Raw(section) = body else {
        core.stats.malformed_packet += 1;
        return None;
    };
    let head = &rx.head;
    let mut book = match Reassembly::new(head.segment_count as usize, Some(head.message_len as usize)) {
        Ok(book) => book,
        Err(e) => {
            core.stats.segment_dropped += 1;
            warn!(error = %e, uid, "RAET: bad segment header");
            return None;
        }
    };
    if let Err(e) = book.accept(head.segment as usize, head.segment_count as usize, &section) {
        core.stats.segment_dropped += 1;
        warn!(error = %e, uid, "RAET: bad segment");
        return None;
    }
    Some(Transaction {
        index: TxIndex::inbound(head, from),
        kind: TrnsKind::Message,
        role: Role::Correspondent,
        state: TxState::Receiving,
        remote_uid: uid,
        se: uid,
        de: head.source,
        expires_at: core.now() + core.config.timeouts.transaction_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Message(MessageData::Inbound {
            book,
            body_kind: head.body_kind,
        }),
    })
}

pub(crate) fn messengent_receive(
    core: &mut StackCore,
    tx: &mut Transaction,
    rx: &RxPacket,
) -> Outcome {
    if !authentic(core, tx, rx) {
        core.stats.trust_failure += 1;
        return Outcome::Continue;
    }
    match rx.head.packet_kind {
        PacketKind::Message => collect(core, tx, rx),
        kind if kind.is_nack() => {
            Outcome::Failed(RaetError::Refused(format!("messenger sent {kind:?}")))
        }
        other => {
            debug!(kind = ?other, "RAET: messengent ignoring packet");
            Outcome::Continue
        }
    }
}

fn collect(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    let uid = tx.remote_uid;
    let section = match core
        .directory
        .get(uid)
        .and_then(|r| r.session())
        .map(|s| rx.body(Some(&s.key)))
    {
        Some(Ok(Body::Raw(section))) => section,
        Some(Ok(_)) => {
            core.stats.malformed_packet += 1;
            return Outcome::Continue;
        }
        _ => return Outcome::Failed(RaetError::NotAllowed(uid)),
    };
    let TxData::Message(MessageData::Inbound { book, body_kind }) = &mut tx.data else {
        return Outcome::Continue;
    };
    let whole = match book.accept(
        rx.head.segment as usize,
        rx.head.segment_count as usize,
        &section,
    ) {
        Ok(Some(whole)) => whole,
        Ok(None) => return Outcome::Continue,
        Err(e) => {
            core.stats.segment_dropped += 1;
            return Outcome::Failed(e.into());
        }
    };
    let kind = match *body_kind {
        BodyKind::Msgpack => BodyKind::Msgpack,
        _ => BodyKind::Json,
    };
    let value = match deserialize_body(kind, &whole) {
        Ok(value) => value,
        Err(e) => {
            core.stats.malformed_packet += 1;
            return Outcome::Failed(e.into());
        }
    };
    deliver(core, uid, value);
    if let Err(e) = tx.send(core, PacketKind::Ack, Body::Nada, Seal::Session(uid)) {
        warn!(error = %e, uid, "RAET: failed to ack message");
    }
    if let Some(remote) = core.directory.get_mut(uid) {
        remote.record_done(tx.index.sid, tx.index.tid);
    }
    info!(uid, tid = tx.index.tid, size = whole.len(), "RAET: segmented message delivered");
    Outcome::Done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_size_leaves_room_for_head_and_neck() {
        assert_eq!(section_size(1400), 1400 - 255 - 40);
        assert_eq!(section_size(100), 0);
    }
}
