//! Estates: the local endpoint and the remotes it talks to.

use raet_types::config::StackConfig;
use raet_types::kinds::Acceptance;
use raet_wire::{Privateer, Publican, SessionKey, Signer, Verifier};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Uid of the local estate in every stack.
pub const LOCAL_UID: u32 = 1;

/// How many completed (sid, tid) pairs each remote remembers.
pub const DONE_CAPACITY: usize = 64;

/// Session freshness: `new` is acceptable after `last` when it lies in the
/// half of the 32-bit circle ahead of (or at) `last`.
pub fn is_fresh(new: u32, last: u32) -> bool {
    new.wrapping_sub(last) < (1 << 31)
}

fn bump(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 {
        *counter = 1;
    }
    *counter
}

/// This node's own identity.
#[derive(Debug, Clone)]
pub struct LocalEstate {
    /// Always [`LOCAL_UID`].
    pub uid: u32,
    /// Unique name.
    pub name: String,
    /// Bound address.
    pub ha: SocketAddr,
    /// Whether this estate accepts joins.
    pub main: bool,
    /// Application role.
    pub role: String,
    /// Application kind.
    pub kind: u8,
    /// Long-term signing key.
    pub signer: Signer,
    /// Long-term encryption key.
    pub privateer: Privateer,
}

impl LocalEstate {
    /// Fresh identity with newly generated keys.
    pub fn generate(config: &StackConfig) -> Self {
        Self {
            uid: LOCAL_UID,
            name: config.name.clone(),
            ha: config.ha,
            main: config.main,
            role: config.role.clone(),
            kind: config.kind,
            signer: Signer::generate(),
            privateer: Privateer::generate(),
        }
    }

    /// The identity document carried by Join request and response bodies.
    pub fn identity(&self) -> Value {
        json!({
            "name": self.name,
            "verhex": self.signer.verhex(),
            "pubhex": self.privateer.pubhex(),
            "role": self.role,
            "kind": self.kind,
        })
    }
}

/// An Allow-established session.
#[derive(Debug)]
pub struct Session {
    /// Session id the session was established under.
    pub sid: u32,
    /// Derived symmetric key.
    pub key: SessionKey,
}

/// A peer as seen from this stack.
#[derive(Debug)]
pub struct RemoteEstate {
    /// Our id for the remote.
    pub uid: u32,
    /// The remote's id for us; 0 until a Join tells us.
    pub fuid: u32,
    /// Remote name; empty while vacuous.
    pub name: String,
    /// Remote address.
    pub ha: SocketAddr,
    /// Application role.
    pub role: String,
    /// Application kind.
    pub kind: u8,
    /// Remote long-term verify key.
    pub verfer: Option<Verifier>,
    /// Remote long-term public key.
    pub pubber: Option<Publican>,
    /// Trust status.
    pub acceptance: Acceptance,
    /// Join completed.
    pub joined: bool,
    /// Last session id we issued as Allow initiator.
    pub sid: u32,
    /// Last session id the remote issued as Allow initiator.
    pub rsid: u32,
    tid: u32,
    session: Option<Session>,
    done: VecDeque<(u32, u32)>,
}

impl RemoteEstate {
    /// New remote with a known name.
    pub fn new(uid: u32, name: impl Into<String>, ha: SocketAddr) -> Self {
        Self {
            uid,
            fuid: 0,
            name: name.into(),
            ha,
            role: String::new(),
            kind: 0,
            verfer: None,
            pubber: None,
            acceptance: Acceptance::Pending,
            joined: false,
            sid: 0,
            rsid: 0,
            tid: 0,
            session: None,
            done: VecDeque::new(),
        }
    }

    /// New remote known only by address.
    pub fn vacuous(uid: u32, ha: SocketAddr) -> Self {
        Self::new(uid, String::new(), ha)
    }

    /// Whether no Join has filled in this remote yet.
    pub fn is_vacuous(&self) -> bool {
        self.fuid == 0
    }

    /// Whether an Allow session is in place.
    pub fn allowed(&self) -> bool {
        self.session.is_some()
    }

    /// Current session, if allowed.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Install a freshly derived session. Replaces (and zeroizes) any old one.
    pub fn set_session(&mut self, sid: u32, key: SessionKey) {
        self.session = Some(Session { sid, key });
    }

    /// Drop the session; the remote must Allow again.
    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// Advance our session counter for a new Allow.
    pub fn next_sid(&mut self) -> u32 {
        bump(&mut self.sid)
    }

    /// Advance the transaction counter.
    pub fn next_tid(&mut self) -> u32 {
        bump(&mut self.tid)
    }

    /// Remember a completed exchange the remote initiated.
    pub fn record_done(&mut self, sid: u32, tid: u32) {
        if self.done.contains(&(sid, tid)) {
            return;
        }
        if self.done.len() >= DONE_CAPACITY {
            self.done.pop_front();
        }
        self.done.push_back((sid, tid));
    }

    /// Whether the remote-initiated exchange `(sid, tid)` already completed.
    pub fn is_done(&self, sid: u32, tid: u32) -> bool {
        self.done.contains(&(sid, tid))
    }

    /// Forget everything learned by Join and Allow.
    pub fn unjoin(&mut self) {
        self.joined = false;
        self.fuid = 0;
        self.session = None;
        self.done.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_window() {
        assert!(is_fresh(5, 5));
        assert!(is_fresh(6, 5));
        assert!(!is_fresh(4, 5));
        assert!(is_fresh(5 + (1 << 31) - 1, 5));
        assert!(!is_fresh(5 + (1 << 31), 5));
    }

    #[test]
    fn test_freshness_wraparound() {
        let last = u32::MAX - 2;
        for new in [u32::MAX - 2, u32::MAX - 1, u32::MAX, 0, 1, 2, 1000] {
            assert!(is_fresh(new, last), "{new} should follow {last}");
        }
        for new in [u32::MAX - 3, u32::MAX - 1000, (1u32 << 31) - 3] {
            assert!(!is_fresh(new, last), "{new} should be stale after {last}");
        }
        // exactly half way round is stale
        assert!(!is_fresh(last.wrapping_add(1 << 31), last));
        assert!(is_fresh(last.wrapping_add((1 << 31) - 1), last));
    }

    #[test]
    fn test_counters_skip_zero() {
        let ha: SocketAddr = "127.0.0.1:7530".parse().unwrap();
        let mut remote = RemoteEstate::vacuous(2, ha);
        remote.sid = u32::MAX;
        assert_eq!(remote.next_sid(), 1);
        assert_eq!(remote.next_tid(), 1);
        assert_eq!(remote.next_tid(), 2);
    }

    #[test]
    fn test_done_set_bounded() {
        let ha: SocketAddr = "127.0.0.1:7530".parse().unwrap();
        let mut remote = RemoteEstate::new(2, "peer", ha);
        for tid in 0..(DONE_CAPACITY as u32 + 10) {
            remote.record_done(1, tid);
        }
        assert!(!remote.is_done(1, 0));
        assert!(remote.is_done(1, DONE_CAPACITY as u32 + 9));
    }

    #[test]
    fn test_session_lifecycle() {
        let ha: SocketAddr = "127.0.0.1:7530".parse().unwrap();
        let mut remote = RemoteEstate::new(2, "peer", ha);
        assert!(!remote.allowed());
        remote.set_session(3, SessionKey::generate());
        assert!(remote.allowed());
        assert_eq!(remote.session().map(|s| s.sid), Some(3));
        remote.unjoin();
        assert!(!remote.allowed());
        assert!(remote.is_vacuous());
    }
}
