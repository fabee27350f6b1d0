//! Allow: the ephemeral key handshake that establishes a session.
//!
//! ```text
//! allower (initiator)                         allowent (correspondent)
//!   hello    E_i, box[E_i -> L_c](0^64)   -->
//!                                          <-- cookie   E_c, box[L_c -> E_i](K)
//!   initiate K, seal[S](box[L_i -> L_c](E_i)) -->
//!                                          <-- ack
//! ```
//!
//! `E` are ephemeral X25519 keys made fresh for every handshake, `L` the
//! long-term keys exchanged by Join. `S` is derived from the ephemeral
//! pair, salted with both ephemeral public keys. The cookie `K` seals both
//! ephemeral keys and the issue time under a key only the correspondent
//! holds; it must come back unaltered, within the cookie lifetime, and only
//! once. The vouch proves the initiator holds its long-term key and ties it
//! to `E_i`. Every packet is signed with the sender's long-term key.

use super::{authentic, AllowData, Outcome, Role, Transaction, TxData, TxIndex, TxState};
use crate::retry::Redo;
use crate::stack::{Seal, StackCore};
use raet_types::kinds::{Acceptance, PacketKind, TrnsKind};
use raet_types::{RaetError, RaetResult};
use raet_wire::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use raet_wire::packet::RxPacket;
use raet_wire::{Body, Privateer, Publican};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const BLANK_SIZE: usize = 64;
const HELLO_SIZE: usize = KEY_SIZE + NONCE_SIZE + BLANK_SIZE + TAG_SIZE;
const COOKIE_INNER_SIZE: usize = 2 * KEY_SIZE + 8;
const COOKIE_SIZE: usize = NONCE_SIZE + COOKIE_INNER_SIZE + TAG_SIZE;
const COOKIE_BODY_SIZE: usize = KEY_SIZE + NONCE_SIZE + COOKIE_SIZE + TAG_SIZE;
const VOUCH_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;
const INITIATE_SIZE: usize = COOKIE_SIZE + NONCE_SIZE + VOUCH_SIZE + TAG_SIZE;

fn same_bytes(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn trust_failure(core: &mut StackCore, tx: &Transaction, what: &str) -> Outcome {
    core.stats.trust_failure += 1;
    warn!(uid = tx.remote_uid, sid = tx.index.sid, "RAET: allow {what}");
    Outcome::Failed(RaetError::TrustFailure(format!("allow {what}")))
}

fn raw_body(rx: &RxPacket, size: usize) -> Option<Vec<u8>> {
    match rx.body(None) {
        Ok(Body::Raw(bytes)) if bytes.len() == size => Some(bytes),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Allower
// ---------------------------------------------------------------------------

/// Start an Allow with `uid` under a fresh session id, sending hello.
pub(crate) fn start_allower(core: &mut StackCore, uid: u32) -> RaetResult<Transaction> {
    let now = core.now();
    let remote = core
        .directory
        .get_mut(uid)
        .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
    let pubber = match (remote.joined, remote.pubber) {
        (true, Some(pubber)) => pubber,
        _ => return Err(RaetError::NotJoined(uid)),
    };
    let sid = remote.next_sid();
    let tid = remote.next_tid();
    core.keep.dump_remote_road(remote)?;
    let index = TxIndex {
        correspondent: false,
        initiator_uid: remote.uid,
        remote_ha: remote.ha,
        sid,
        tid,
        broadcast: false,
    };
    let (se, de) = (remote.uid, remote.fuid);

    let eph = Privateer::generate();
    let (blank, nonce) = eph.encrypt(&[0u8; BLANK_SIZE], &pubber)?;
    let mut body = Vec::with_capacity(HELLO_SIZE);
    body.extend_from_slice(eph.publican().as_bytes());
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&blank);

    let mut tx = Transaction {
        index,
        kind: TrnsKind::Allow,
        role: Role::Initiator,
        state: TxState::HelloSent,
        remote_uid: uid,
        se,
        de,
        expires_at: now + core.config.timeouts.transaction_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Allow(AllowData {
            eph,
            peer_eph: None,
            session: None,
        }),
    };
    tx.send(core, PacketKind::Hello, Body::Raw(body), Seal::Signed)?;
    tx.redo = Some(Redo::start(&core.config.retry, now));
    info!(uid, sid, tid, "RAET: allow initiated");
    Ok(tx)
}

pub(crate) fn allower_receive(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    if !authentic(core, tx, rx) {
        core.stats.trust_failure += 1;
        debug!(uid = tx.remote_uid, "RAET: allower dropping unverified packet");
        return Outcome::Continue;
    }
    match rx.head.packet_kind {
        PacketKind::Cookie if tx.state == TxState::HelloSent => accept_cookie(core, tx, rx),
        PacketKind::Ack if tx.state == TxState::InitiateSent => {
            let TxData::Allow(data) = &mut tx.data else {
                return Outcome::Failed(RaetError::TrustFailure("allow state lost".into()));
            };
            let Some(session) = data.session.take() else {
                return Outcome::Failed(RaetError::TrustFailure("allow session lost".into()));
            };
            let Some(remote) = core.directory.get_mut(tx.remote_uid) else {
                return Outcome::Failed(RaetError::UnknownRemote(format!("uid {}", tx.remote_uid)));
            };
            info!(
                uid = remote.uid,
                sid = tx.index.sid,
                fingerprint = %session.fingerprint(),
                "RAET: allowed"
            );
            remote.set_session(tx.index.sid, session);
            Outcome::Done
        }
        kind if kind.is_nack() => {
            if matches!(kind, PacketKind::Unjoined) {
                if let Some(remote) = core.directory.get_mut(tx.remote_uid) {
                    remote.joined = false;
                    remote.clear_session();
                }
            }
            Outcome::Failed(RaetError::Refused(format!("allow answered with {kind:?}")))
        }
        other => {
            debug!(kind = ?other, "RAET: allower ignoring packet");
            Outcome::Continue
        }
    }
}

fn accept_cookie(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    let Some(body) = raw_body(rx, COOKIE_BODY_SIZE) else {
        return trust_failure(core, tx, "cookie malformed");
    };
    let Some(pubber) = core.directory.get(tx.remote_uid).and_then(|r| r.pubber) else {
        return Outcome::Failed(RaetError::NotJoined(tx.remote_uid));
    };
    let TxData::Allow(data) = &mut tx.data else {
        return Outcome::Failed(RaetError::TrustFailure("allow state lost".into()));
    };

    let peer_eph = match Publican::from_bytes(&body[..KEY_SIZE]) {
        Ok(p) => p,
        Err(_) => return trust_failure(core, tx, "cookie key invalid"),
    };
    let cookie = match data.eph.decrypt(
        &body[KEY_SIZE + NONCE_SIZE..],
        &body[KEY_SIZE..KEY_SIZE + NONCE_SIZE],
        &pubber,
    ) {
        Ok(cookie) if cookie.len() == COOKIE_SIZE => cookie,
        _ => return trust_failure(core, tx, "cookie did not open"),
    };

    let my_eph = data.eph.publican();
    let mut salt = Vec::with_capacity(2 * KEY_SIZE);
    salt.extend_from_slice(my_eph.as_bytes());
    salt.extend_from_slice(peer_eph.as_bytes());
    let built = data.eph.session_key(&peer_eph, &salt).and_then(|session| {
        let (vouch_box, vouch_nonce) = core.local.privateer.encrypt(my_eph.as_bytes(), &pubber)?;
        let mut vouch = Vec::with_capacity(NONCE_SIZE + vouch_box.len());
        vouch.extend_from_slice(&vouch_nonce);
        vouch.extend_from_slice(&vouch_box);
        let sealed = session.seal(&vouch)?;
        Ok((session, sealed))
    });
    let (session, sealed_vouch) = match built {
        Ok(parts) => parts,
        Err(_) => return trust_failure(core, tx, "session derivation failed"),
    };
    data.peer_eph = Some(peer_eph);
    data.session = Some(session);

    let mut body = cookie;
    body.extend_from_slice(&sealed_vouch);
    if let Err(e) = tx.send(core, PacketKind::Initiate, Body::Raw(body), Seal::Signed) {
        return Outcome::Failed(e);
    }
    tx.state = TxState::InitiateSent;
    tx.redo = Some(Redo::start(&core.config.retry, core.now()));
    debug!(uid = tx.remote_uid, sid = tx.index.sid, "RAET: initiate sent");
    Outcome::Continue
}

// ---------------------------------------------------------------------------
// Allowent
// ---------------------------------------------------------------------------

/// Handle a new hello from `uid`. The stack has already checked that the
/// remote is joined, accepted and that the session id is fresh.
pub(crate) fn start_allowent(
    core: &mut StackCore,
    rx: &RxPacket,
    from: SocketAddr,
    uid: u32,
) -> Option<Transaction> {
    let remote = core.directory.get(uid)?;
    let (Some(verfer), Some(_)) = (remote.verfer, remote.pubber) else {
        core.reply(&rx.head, from, PacketKind::Unjoined);
        return None;
    };
    if rx.verify(&verfer).is_err() {
        core.stats.trust_failure += 1;
        warn!(uid, "RAET: hello signature invalid");
        return None;
    }
    let Some(body) = raw_body(rx, HELLO_SIZE) else {
        core.stats.malformed_packet += 1;
        return None;
    };
    let peer_eph = Publican::from_bytes(&body[..KEY_SIZE]).ok()?;
    let blank = core
        .local
        .privateer
        .decrypt(&body[KEY_SIZE + NONCE_SIZE..], &body[KEY_SIZE..KEY_SIZE + NONCE_SIZE], &peer_eph);
    if !matches!(&blank, Ok(b) if same_bytes(b, &[0u8; BLANK_SIZE])) {
        core.stats.trust_failure += 1;
        warn!(uid, "RAET: hello proof invalid");
        return None;
    }

    let now = core.now();
    let eph = Privateer::generate();
    let my_eph = eph.publican();
    let mut salt = Vec::with_capacity(2 * KEY_SIZE);
    salt.extend_from_slice(peer_eph.as_bytes());
    salt.extend_from_slice(my_eph.as_bytes());

    let mut inner = Vec::with_capacity(COOKIE_INNER_SIZE);
    inner.extend_from_slice(peer_eph.as_bytes());
    inner.extend_from_slice(my_eph.as_bytes());
    inner.extend_from_slice(&now.to_be_bytes());

    let built = eph.session_key(&peer_eph, &salt).and_then(|session| {
        let cookie = core.cookie_key.seal(&inner)?;
        let (boxed, nonce) = core.local.privateer.encrypt(&cookie, &peer_eph)?;
        Ok((session, nonce, boxed))
    });
    let (session, nonce, boxed) = match built {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, uid, "RAET: cannot build cookie");
            return None;
        }
    };
    let mut body = Vec::with_capacity(COOKIE_BODY_SIZE);
    body.extend_from_slice(my_eph.as_bytes());
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&boxed);

    let mut tx = Transaction {
        index: TxIndex::inbound(&rx.head, from),
        kind: TrnsKind::Allow,
        role: Role::Correspondent,
        state: TxState::CookieSent,
        remote_uid: uid,
        se: uid,
        de: rx.head.source,
        expires_at: now + core.config.timeouts.transaction_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Allow(AllowData {
            eph,
            peer_eph: Some(peer_eph),
            session: Some(session),
        }),
    };
    if let Err(e) = tx.send(core, PacketKind::Cookie, Body::Raw(body), Seal::Signed) {
        warn!(error = %e, uid, "RAET: failed to send cookie");
        return None;
    }
    debug!(uid, sid = rx.head.sid, "RAET: cookie sent");
    Some(tx)
}

pub(crate) fn allowent_receive(
    core: &mut StackCore,
    tx: &mut Transaction,
    rx: &RxPacket,
) -> Outcome {
    if !authentic(core, tx, rx) {
        core.stats.trust_failure += 1;
        debug!(uid = tx.remote_uid, "RAET: allowent dropping unverified packet");
        return Outcome::Continue;
    }
    match rx.head.packet_kind {
        PacketKind::Hello => {
            tx.resend_last(core);
            Outcome::Continue
        }
        PacketKind::Initiate if tx.state == TxState::CookieSent => accept_initiate(core, tx, rx),
        kind if kind.is_nack() => {
            Outcome::Failed(RaetError::Refused(format!("allower sent {kind:?}")))
        }
        other => {
            debug!(kind = ?other, "RAET: allowent ignoring packet");
            Outcome::Continue
        }
    }
}

fn accept_initiate(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    let Some(body) = raw_body(rx, INITIATE_SIZE) else {
        return trust_failure(core, tx, "initiate malformed");
    };
    let Some(pubber) = core.directory.get(tx.remote_uid).and_then(|r| r.pubber) else {
        return Outcome::Failed(RaetError::NotJoined(tx.remote_uid));
    };
    let now = core.now();
    let cookie_ms = core.config.timeouts.cookie_ms;
    let TxData::Allow(data) = &mut tx.data else {
        return Outcome::Failed(RaetError::TrustFailure("allow state lost".into()));
    };
    let (Some(peer_eph), Some(session)) = (data.peer_eph, data.session.as_ref()) else {
        return Outcome::Failed(RaetError::TrustFailure("allow state lost".into()));
    };
    let my_eph = data.eph.publican();

    // cookie: ours, unused, for this exchange, recent
    let Ok(inner) = core.cookie_key.open(&body[..COOKIE_SIZE]) else {
        return trust_failure(core, tx, "cookie forged");
    };
    if inner.len() != COOKIE_INNER_SIZE {
        return trust_failure(core, tx, "cookie mismatch");
    }
    core.cookies_seen.retain(|_, expiry| *expiry > now);
    if core.cookies_seen.contains_key(&inner[..KEY_SIZE]) {
        return trust_failure(core, tx, "cookie replayed");
    }
    if !same_bytes(&inner[..KEY_SIZE], peer_eph.as_bytes())
        || !same_bytes(&inner[KEY_SIZE..2 * KEY_SIZE], my_eph.as_bytes())
    {
        return trust_failure(core, tx, "cookie mismatch");
    }
    let mut issued = [0u8; 8];
    issued.copy_from_slice(&inner[2 * KEY_SIZE..]);
    let issued = u64::from_be_bytes(issued);
    if now.saturating_sub(issued) > cookie_ms {
        return trust_failure(core, tx, "cookie expired");
    }
    core.cookies_seen.insert(*peer_eph.as_bytes(), issued + cookie_ms + 1);

    // vouch: the initiator's long-term key speaks for its ephemeral key
    let vouched = session.open(&body[COOKIE_SIZE..]).and_then(|vouch| {
        if vouch.len() != VOUCH_SIZE {
            return Err(raet_wire::CryptoError::DecryptFailed);
        }
        core.local
            .privateer
            .decrypt(&vouch[NONCE_SIZE..], &vouch[..NONCE_SIZE], &pubber)
    });
    match vouched {
        Ok(claimed) if same_bytes(&claimed, peer_eph.as_bytes()) => {}
        _ => return trust_failure(core, tx, "vouch mismatch"),
    }

    let Some(session) = data.session.take() else {
        return Outcome::Failed(RaetError::TrustFailure("allow session lost".into()));
    };
    let (sid, tid) = (tx.index.sid, tx.index.tid);
    let Some(remote) = core.directory.get_mut(tx.remote_uid) else {
        return Outcome::Failed(RaetError::UnknownRemote(format!("uid {}", tx.remote_uid)));
    };
    if remote.acceptance != Acceptance::Accepted {
        return trust_failure(core, tx, "remote no longer accepted");
    }
    info!(
        uid = remote.uid,
        sid,
        fingerprint = %session.fingerprint(),
        "RAET: remote allowed"
    );
    remote.rsid = sid;
    remote.set_session(sid, session);
    remote.record_done(sid, tid);
    if let Err(e) = core.keep.dump_remote_road(remote) {
        warn!(error = %e, "RAET: failed to persist remote");
    }
    if let Err(e) = tx.send(core, PacketKind::Ack, Body::Nada, Seal::Signed) {
        return Outcome::Failed(e);
    }
    Outcome::Done
}
