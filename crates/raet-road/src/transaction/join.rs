//! Join: exchange long-term identities and confirm ids.
//!
//! ```text
//! joiner (initiator)                 joinent (correspondent, main only)
//!   request {name, verhex, pubhex} -->
//!                                    <-- pend         (held until decided)
//!                                    <-- response {name, verhex, pubhex}
//!   ack                            -->
//! ```
//!
//! Request and response are self-signed: the verify key inside the body
//! must verify the packet's own tail. The correspondent judges the offered
//! keys before touching the remote they claim; a rejected offer is answered
//! with `reject` and leaves the stored remote as it was. Otherwise the
//! remote is updated and answered with `response` or `pend`. A request
//! naming an id the correspondent does not know is answered with `renew`,
//! and the joiner restarts with a vacuous join.

use super::{authentic, Outcome, Role, Transaction, TxData, TxIndex, TxState};
use crate::estate::RemoteEstate;
use crate::keep::is_valid_role;
use crate::retry::Redo;
use crate::stack::{Seal, StackCore};
use raet_types::kinds::{Acceptance, PacketKind, TrnsKind};
use raet_types::{RaetError, RaetResult};
use raet_wire::packet::RxPacket;
use raet_wire::{Body, Publican, Verifier};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct IdentityDoc {
    name: String,
    verhex: String,
    pubhex: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    kind: u8,
}

/// Identity offered in a join request or response.
#[derive(Debug)]
struct Offered {
    name: String,
    verfer: Verifier,
    pubber: Publican,
    role: String,
    kind: u8,
}

/// Parse the identity body and check the packet is signed by the key it
/// carries.
fn read_identity(rx: &RxPacket) -> RaetResult<Offered> {
    let doc = match rx.body(None)? {
        Body::Data(value) => serde_json::from_value::<IdentityDoc>(value)?,
        _ => {
            return Err(RaetError::MalformedPacket(
                "join body is not a document".to_string(),
            ))
        }
    };
    if doc.name.is_empty() {
        return Err(RaetError::MalformedPacket("join without a name".to_string()));
    }
    if !doc.role.is_empty() && !is_valid_role(&doc.role) {
        return Err(RaetError::MalformedPacket(format!("bad role {:?}", doc.role)));
    }
    let verfer = Verifier::from_hex(&doc.verhex)?;
    let pubber = Publican::from_hex(&doc.pubhex)?;
    rx.verify(&verfer)
        .map_err(|e| RaetError::TrustFailure(format!("join signature: {e}")))?;
    Ok(Offered {
        name: doc.name,
        verfer,
        pubber,
        role: doc.role,
        kind: doc.kind,
    })
}

fn count_identity_error(core: &mut StackCore, err: &RaetError) {
    match err {
        RaetError::TrustFailure(_) => core.stats.trust_failure += 1,
        _ => core.stats.malformed_packet += 1,
    }
}

// ---------------------------------------------------------------------------
// Joiner
// ---------------------------------------------------------------------------

/// Start a join with `uid`, sending the request.
pub(crate) fn start_joiner(core: &mut StackCore, uid: u32) -> RaetResult<Transaction> {
    let now = core.now();
    let remote = core
        .directory
        .get_mut(uid)
        .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
    let tid = remote.next_tid();
    let index = TxIndex {
        correspondent: false,
        initiator_uid: remote.uid,
        remote_ha: remote.ha,
        sid: 0,
        tid,
        broadcast: false,
    };
    let mut tx = Transaction {
        index,
        kind: TrnsKind::Join,
        role: Role::Initiator,
        state: TxState::Requested,
        remote_uid: uid,
        se: remote.uid,
        de: remote.fuid,
        expires_at: now + core.config.timeouts.transaction_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Join,
    };
    let identity = core.local.identity();
    tx.send(core, PacketKind::Request, Body::Data(identity), Seal::Signed)?;
    tx.redo = Some(Redo::start(&core.config.retry, now));
    info!(uid, tid, vacuous = tx.de == 0, "RAET: join initiated");
    Ok(tx)
}

pub(crate) fn joiner_receive(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    match rx.head.packet_kind {
        PacketKind::Pend if tx.state == TxState::Requested => {
            if !authentic(core, tx, rx) {
                core.stats.trust_failure += 1;
                return Outcome::Continue;
            }
            let now = core.now();
            tx.state = TxState::Pending;
            tx.expires_at = now + core.config.timeouts.pend_ms;
            tx.redo = Some(Redo::polling(&core.config.retry, now));
            info!(uid = tx.remote_uid, "RAET: join pending acceptance");
            Outcome::Continue
        }
        PacketKind::Response => accept_response(core, tx, rx),
        kind if kind.is_nack() => {
            if !authentic(core, tx, rx) {
                core.stats.trust_failure += 1;
                return Outcome::Continue;
            }
            match kind {
                PacketKind::Renew => {
                    info!(uid = tx.remote_uid, "RAET: join renew requested");
                    Outcome::Rejoin
                }
                PacketKind::Reject => {
                    if let Some(remote) = core.directory.get_mut(tx.remote_uid) {
                        remote.joined = false;
                        remote.clear_session();
                        if let Err(e) = core.keep.dump_remote_road(remote) {
                            warn!(error = %e, "RAET: failed to persist remote");
                        }
                    }
                    Outcome::Failed(RaetError::Refused(format!(
                        "join rejected by remote {}",
                        tx.remote_uid
                    )))
                }
                other => Outcome::Failed(RaetError::Refused(format!(
                    "join answered with {other:?}"
                ))),
            }
        }
        other => {
            debug!(kind = ?other, "RAET: joiner ignoring packet");
            Outcome::Continue
        }
    }
}

fn accept_response(core: &mut StackCore, tx: &mut Transaction, rx: &RxPacket) -> Outcome {
    let offered = match read_identity(rx) {
        Ok(offered) => offered,
        Err(e) => {
            count_identity_error(core, &e);
            warn!(error = %e, uid = tx.remote_uid, "RAET: bad join response");
            return Outcome::Continue;
        }
    };
    let uid = tx.remote_uid;
    let mode = core.config.auto_mode;
    let Some(remote) = core.directory.get_mut(uid) else {
        return Outcome::Failed(RaetError::UnknownRemote(format!("uid {uid}")));
    };
    let previous_role = std::mem::replace(&mut remote.role, offered.role);
    let status = match core
        .keep
        .status_remote(remote, offered.verfer, offered.pubber, mode)
    {
        Ok(status) => status,
        Err(e) => return Outcome::Failed(e.into()),
    };

    if status == Acceptance::Rejected {
        remote.role = previous_role;
        remote.joined = false;
        remote.clear_session();
        if let Err(e) = core.keep.dump_remote_road(remote) {
            warn!(error = %e, "RAET: failed to persist remote");
        }
        core.stats.trust_failure += 1;
        if let Err(e) = tx.send(core, PacketKind::Reject, Body::Nada, Seal::Signed) {
            warn!(error = %e, "RAET: failed to send reject");
        }
        return Outcome::Failed(RaetError::TrustFailure(format!(
            "{} offered keys this estate rejects",
            offered.name
        )));
    }

    // the joiner trusts the estate it chose to join
    if status == Acceptance::Pending {
        if let Err(e) = core.keep.accept_remote(remote) {
            return Outcome::Failed(e.into());
        }
    }
    if let Err(e) = core.directory.rename(uid, &offered.name) {
        return Outcome::Failed(e);
    }
    let Some(remote) = core.directory.get_mut(uid) else {
        return Outcome::Failed(RaetError::UnknownRemote(format!("uid {uid}")));
    };
    remote.fuid = rx.head.source;
    remote.kind = offered.kind;
    remote.joined = true;
    if let Err(e) = core.keep.dump_remote_road(remote) {
        return Outcome::Failed(e.into());
    }

    tx.de = rx.head.source;
    if let Err(e) = tx.send(core, PacketKind::Ack, Body::Nada, Seal::Signed) {
        return Outcome::Failed(e);
    }
    info!(uid, name = %offered.name, "RAET: joined");
    Outcome::Done
}

// ---------------------------------------------------------------------------
// Joinent
// ---------------------------------------------------------------------------

/// The remote a join request speaks for, if it is already known.
fn locate_joiner(core: &StackCore, rx: &RxPacket, offered: &Offered) -> RaetResult<Option<u32>> {
    let uid = rx.head.destination;
    if uid != 0 {
        if core.directory.get(uid).is_none() {
            return Err(RaetError::UnknownRemote(format!("uid {uid}")));
        }
        return Ok(Some(uid));
    }
    Ok(core.directory.uid_by_name(&offered.name))
}

/// Bring the directory in line with an offer that was not rejected:
/// create the remote, or rename and move the known one.
fn place_joiner(
    core: &mut StackCore,
    known: Option<u32>,
    from: SocketAddr,
    offered: &Offered,
) -> RaetResult<u32> {
    let uid = match known {
        Some(uid) => {
            core.directory.rename(uid, &offered.name)?;
            core.directory.move_ha(uid, from)?;
            uid
        }
        None => {
            let uid = core.directory.allocate_uid();
            core.directory
                .add(RemoteEstate::new(uid, offered.name.clone(), from))?;
            uid
        }
    };
    Ok(uid)
}

/// Handle a new join request. Returns the transaction to hold, if any.
pub(crate) fn start_joinent(
    core: &mut StackCore,
    rx: &RxPacket,
    from: SocketAddr,
) -> Option<Transaction> {
    if !core.local.main {
        debug!(%from, "RAET: not main, refusing join");
        core.reply(&rx.head, from, PacketKind::Refuse);
        return None;
    }
    let offered = match read_identity(rx) {
        Ok(offered) => offered,
        Err(e) => {
            count_identity_error(core, &e);
            warn!(error = %e, %from, "RAET: bad join request");
            return None;
        }
    };
    let known = match locate_joiner(core, rx, &offered) {
        Ok(known) => known,
        Err(e) => {
            warn!(error = %e, name = %offered.name, "RAET: cannot place joiner");
            core.reply(&rx.head, from, PacketKind::Reject);
            return None;
        }
    };

    // judge the offer before anything about the claimed remote changes
    let mode = core.config.auto_mode;
    let scratch;
    let claimed = match known.and_then(|uid| core.directory.get(uid)) {
        Some(remote) => remote,
        None => {
            scratch = RemoteEstate::new(0, offered.name.clone(), from);
            &scratch
        }
    };
    let verdict = core
        .keep
        .evaluate(claimed, &offered.role, offered.verfer, offered.pubber, mode);
    match verdict {
        Ok(Acceptance::Rejected) => {
            warn!(uid = ?known, name = %offered.name, %from, "RAET: join from rejected identity");
            core.stats.trust_failure += 1;
            core.reply(&rx.head, from, PacketKind::Reject);
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, name = %offered.name, "RAET: keep failure during join");
            return None;
        }
    }

    let uid = match place_joiner(core, known, from, &offered) {
        Ok(uid) => uid,
        Err(e) => {
            warn!(error = %e, name = %offered.name, %from, "RAET: cannot place joiner");
            core.reply(&rx.head, from, PacketKind::Reject);
            return None;
        }
    };
    let remote = core.directory.get_mut(uid)?;
    let rekeyed =
        remote.verfer != Some(offered.verfer) || remote.pubber != Some(offered.pubber);
    if rekeyed && remote.allowed() {
        // the session was derived from keys this remote no longer holds
        remote.clear_session();
    }
    remote.fuid = rx.head.source;
    remote.role = offered.role;
    remote.kind = offered.kind;
    let status = match core
        .keep
        .status_remote(remote, offered.verfer, offered.pubber, mode)
    {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, uid, "RAET: keep failure during join");
            return None;
        }
    };
    if let Err(e) = core.keep.dump_remote_road(remote) {
        warn!(error = %e, uid, "RAET: failed to persist remote");
    }

    let now = core.now();
    let mut tx = Transaction {
        index: TxIndex::inbound(&rx.head, from),
        kind: TrnsKind::Join,
        role: Role::Correspondent,
        state: TxState::Pending,
        remote_uid: uid,
        se: uid,
        de: rx.head.source,
        expires_at: now + core.config.timeouts.pend_ms,
        redo: None,
        last: Vec::new(),
        data: TxData::Join,
    };
    let sent = match status {
        Acceptance::Accepted => respond(core, &mut tx),
        Acceptance::Pending => {
            info!(uid, name = %offered.name, "RAET: join pending acceptance");
            tx.send(core, PacketKind::Pend, Body::Nada, Seal::Signed)
        }
        Acceptance::Rejected => {
            // judged again under a role decided since the first look
            warn!(uid, name = %offered.name, "RAET: join from rejected identity");
            core.stats.trust_failure += 1;
            if let Err(e) = tx.send(core, PacketKind::Reject, Body::Nada, Seal::Signed) {
                warn!(error = %e, "RAET: failed to send reject");
            }
            return None;
        }
    };
    match sent {
        Ok(()) => Some(tx),
        Err(e) => {
            warn!(error = %e, uid, "RAET: failed to answer join");
            None
        }
    }
}

fn respond(core: &mut StackCore, tx: &mut Transaction) -> RaetResult<()> {
    tx.state = TxState::Responded;
    tx.expires_at = core.now() + core.config.timeouts.transaction_ms;
    let identity = core.local.identity();
    tx.send(core, PacketKind::Response, Body::Data(identity), Seal::Signed)
}

pub(crate) fn joinent_receive(
    core: &mut StackCore,
    tx: &mut Transaction,
    rx: &RxPacket,
) -> Outcome {
    match rx.head.packet_kind {
        PacketKind::Request => {
            // joiner resend or pending poll: repeat our current answer
            tx.resend_last(core);
            Outcome::Continue
        }
        PacketKind::Ack if tx.state == TxState::Responded => {
            if !authentic(core, tx, rx) {
                core.stats.trust_failure += 1;
                return Outcome::Continue;
            }
            let Some(remote) = core.directory.get_mut(tx.remote_uid) else {
                return Outcome::Failed(RaetError::UnknownRemote(format!(
                    "uid {}",
                    tx.remote_uid
                )));
            };
            remote.joined = true;
            if let Err(e) = core.keep.dump_remote_road(remote) {
                warn!(error = %e, "RAET: failed to persist remote");
            }
            info!(uid = remote.uid, name = %remote.name, "RAET: remote joined");
            Outcome::Done
        }
        kind if kind.is_nack() => {
            if !authentic(core, tx, rx) {
                return Outcome::Continue;
            }
            Outcome::Failed(RaetError::Refused(format!("joiner sent {kind:?}")))
        }
        other => {
            debug!(kind = ?other, "RAET: joinent ignoring packet");
            Outcome::Continue
        }
    }
}

/// Re-evaluate a held join: an accept/reject made through the stack API,
/// or the acceptance policy, settles it.
pub(crate) fn joinent_process(core: &mut StackCore, tx: &mut Transaction) -> Outcome {
    if tx.state != TxState::Pending {
        return Outcome::Continue;
    }
    let Some(remote) = core.directory.get(tx.remote_uid) else {
        return Outcome::Failed(RaetError::UnknownRemote(format!("uid {}", tx.remote_uid)));
    };
    let mut status = remote.acceptance;
    if status == Acceptance::Pending {
        if let Some(policy) = core.policy.as_ref() {
            status = policy.decide(remote);
            if let Err(e) = core.decide(tx.remote_uid, status) {
                warn!(error = %e, "RAET: failed to persist acceptance");
            }
        }
    }
    match status {
        Acceptance::Pending => Outcome::Continue,
        Acceptance::Accepted => {
            info!(uid = tx.remote_uid, "RAET: pending join accepted");
            match respond(core, tx) {
                Ok(()) => Outcome::Continue,
                Err(e) => Outcome::Failed(e),
            }
        }
        Acceptance::Rejected => {
            info!(uid = tx.remote_uid, "RAET: pending join rejected");
            if let Err(e) = tx.send(core, PacketKind::Reject, Body::Nada, Seal::Signed) {
                warn!(error = %e, "RAET: failed to send reject");
            }
            Outcome::Done
        }
    }
}
