//! Integration tests for road stacks talking to each other.
//!
//! Every stack runs over one in-memory datagram network and shares one
//! manual clock, so each scenario is deterministic: nothing is resent
//! unless a test moves the clock.

use raet_road::{Clock, Keep, ManualClock, MemoryNetwork, RemoteEstate, RoadStack};
use raet_types::config::StackConfig;
use raet_types::kinds::{Acceptance, AutoMode, BodyKind, HeadKind, TrnsKind};
use raet_types::RaetError;
use raet_wire::Privateer;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

const MAIN_PORT: u16 = 7530;

fn ha(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Road {
    net: MemoryNetwork,
    clock: ManualClock,
    tmp: tempfile::TempDir,
}

impl Road {
    fn new() -> Self {
        Self {
            net: MemoryNetwork::new(),
            clock: ManualClock::new(1_000),
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, name: &str, port: u16, main: bool, auto_mode: AutoMode) -> StackConfig {
        StackConfig {
            name: name.to_string(),
            ha: ha(port),
            main,
            auto_mode,
            keep_dir: Some(self.tmp.path().join(name)),
            main_ha: Some(ha(MAIN_PORT)),
            ..Default::default()
        }
    }

    fn open(&self, config: StackConfig) -> RoadStack {
        let transport = self.net.bind(config.ha);
        RoadStack::new(config, Box::new(transport), Arc::new(self.clock.clone())).unwrap()
    }

    fn main(&self, auto_mode: AutoMode) -> RoadStack {
        self.open(self.config("main", MAIN_PORT, true, auto_mode))
    }

    fn minion(&self, name: &str, port: u16) -> RoadStack {
        self.open(self.config(name, port, false, AutoMode::Never))
    }
}

/// Tick every stack until the network is quiet.
fn pump(stacks: &mut [&mut RoadStack]) {
    for _ in 0..20 {
        for stack in stacks.iter_mut() {
            stack.service_all();
        }
    }
}

/// Join `minion` to `main` and allow; returns (main's uid on the minion,
/// the minion's uid on main).
fn join_and_allow(main: &mut RoadStack, minion: &mut RoadStack) -> (u32, u32) {
    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut *main, &mut *minion]);
    minion.allow(uid).unwrap();
    pump(&mut [&mut *main, &mut *minion]);
    let back = main.remote_uid(minion.name()).unwrap();
    (uid, back)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_join_allow_message_round_trip() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);

    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);
    let remote = minion.remote(uid).unwrap();
    assert!(remote.joined);
    assert_eq!(remote.name, "main");
    assert_eq!(remote.acceptance, Acceptance::Accepted);
    let back = main.remote_uid("minion").unwrap();
    assert!(main.remote(back).unwrap().joined);
    assert_eq!(remote.fuid, back);

    assert!(matches!(
        minion.transmit(uid, json!({"early": true})),
        Err(RaetError::NotAllowed(u)) if u == uid
    ));

    minion.allow(uid).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert!(minion.remote(uid).unwrap().allowed());
    assert!(main.remote(back).unwrap().allowed());

    minion.transmit(uid, json!({"cmd": "ping", "seq": 1})).unwrap();
    main.transmit(back, json!({"cmd": "pong", "seq": 1})).unwrap();
    pump(&mut [&mut main, &mut minion]);

    assert_eq!(main.inbox_len(), 1);
    let got = main.drain_inbox();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].name, "minion");
    assert_eq!(main.remote_uid_by_ha(&ha(7540)), Some(got[0].uid));
    assert_eq!(got[0].body, json!({"cmd": "ping", "seq": 1}));
    let got = minion.drain_inbox();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body, json!({"cmd": "pong", "seq": 1}));

    assert_eq!(main.transaction_count(), 0);
    assert_eq!(minion.transaction_count(), 0);
    assert!(main.failures().is_empty());
    assert!(minion.failures().is_empty());
}

#[test]
fn test_allow_derives_identical_session_keys() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);

    let ours = minion.remote(uid).unwrap().session().unwrap();
    let theirs = main.remote(back).unwrap().session().unwrap();
    assert_eq!(ours.sid, theirs.sid);
    assert_eq!(ours.key.fingerprint(), theirs.key.fingerprint());
    assert_eq!(main.remote(back).unwrap().rsid, ours.sid);
}

#[test]
fn test_large_message_is_segmented() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, _) = join_and_allow(&mut main, &mut minion);

    let blob: String = (0..50_000)
        .map(|i| char::from(b'a' + (i % 26) as u8))
        .collect();
    minion.transmit(uid, json!({ "blob": blob })).unwrap();
    minion.service_all();
    assert!(road.net.pending(ha(MAIN_PORT)) > 40);

    pump(&mut [&mut main, &mut minion]);
    let got = main.drain_inbox();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body["blob"].as_str().unwrap(), blob);
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_segments_out_of_order() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, _) = join_and_allow(&mut main, &mut minion);

    let blob = "z".repeat(5_000);
    minion.transmit(uid, json!({ "blob": blob })).unwrap();
    minion.service_all();
    let mut segments = road.net.capture(ha(MAIN_PORT));
    assert!(segments.len() > 1);
    segments.reverse();
    for (from, data) in segments {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    pump(&mut [&mut main, &mut minion]);
    let got = main.drain_inbox();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body["blob"], json!(blob));
}

#[test]
fn test_stale_session_replay_is_nacked() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, _) = join_and_allow(&mut main, &mut minion);

    minion.transmit(uid, json!({"n": 1})).unwrap();
    minion.service_all();
    let captured = road.net.capture(ha(MAIN_PORT));
    assert_eq!(captured.len(), 1);
    for (from, data) in captured.iter().cloned() {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    pump(&mut [&mut main, &mut minion]);
    assert_eq!(main.drain_inbox().len(), 1);

    // a second allow moves both sides to a new session
    minion.allow(uid).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert_eq!(minion.remote(uid).unwrap().session().unwrap().sid, 2);

    let stale_before = main.stats().stale_session;
    for (from, data) in captured {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    main.service_all();
    assert_eq!(main.stats().stale_session, stale_before + 1);
    assert_eq!(main.transaction_count(), 0);
    assert!(main.drain_inbox().is_empty());
    // the nack went back to the minion
    assert_eq!(road.net.pending(ha(7540)), 1);
    minion.service_all();
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_repeated_message_and_ack_are_idempotent() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, _) = join_and_allow(&mut main, &mut minion);

    minion.transmit(uid, json!({"n": 1})).unwrap();
    minion.service_all();
    let message = road.net.capture(ha(MAIN_PORT));
    for (from, data) in message.iter().cloned() {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    main.service_all();
    assert_eq!(main.drain_inbox().len(), 1);

    // deliver the ack twice
    let acks = road.net.capture(ha(7540));
    assert_eq!(acks.len(), 1);
    let (from, ack) = acks[0].clone();
    road.net.inject(from, ha(7540), ack.clone());
    road.net.inject(from, ha(7540), ack);
    minion.service_all();
    assert_eq!(minion.transaction_count(), 0);
    assert_eq!(road.net.pending(ha(MAIN_PORT)), 0);

    // a retransmitted message is re-acked, not redelivered
    for (from, data) in message {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    main.service_all();
    assert!(main.drain_inbox().is_empty());
    assert_eq!(main.stats().duplicate_message, 1);
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(road.net.pending(ha(7540)), 1);
    minion.service_all();
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_pending_join_waits_for_accept() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Never);
    let mut minion = road.minion("minion", 7540);

    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);
    let back = main.remote_uid("minion").unwrap();
    assert_eq!(main.remote(back).unwrap().acceptance, Acceptance::Pending);
    assert!(!minion.remote(uid).unwrap().joined);
    assert_eq!(main.transaction_count(), 1);
    assert_eq!(minion.transaction_count(), 1);

    main.accept_remote(back).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert!(minion.remote(uid).unwrap().joined);
    assert!(main.remote(back).unwrap().joined);
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_policy_decides_pending_join() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Never);
    main.set_accept_policy(|remote: &RemoteEstate| {
        if remote.name.starts_with("minion") {
            Acceptance::Accepted
        } else {
            Acceptance::Rejected
        }
    });
    let mut minion = road.minion("minion-1", 7540);
    let mut rogue = road.minion("rogue", 7541);

    let uid = minion.bootstrap().unwrap();
    let rogue_uid = rogue.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion, &mut rogue]);

    assert!(minion.remote(uid).unwrap().joined);
    assert!(!rogue.remote(rogue_uid).unwrap().joined);
    let failures = rogue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, TrnsKind::Join);
    assert!(matches!(failures[0].error, RaetError::Refused(_)));
    let rogue_on_main = main.remote_uid("rogue").unwrap();
    assert_eq!(
        main.remote(rogue_on_main).unwrap().acceptance,
        Acceptance::Rejected
    );
}

#[test]
fn test_non_main_refuses_join() {
    let road = Road::new();
    let mut peer = road.minion("peer", 7541);
    let mut minion = road.minion("minion", 7540);
    let uid = minion.add_vacuous_remote(ha(7541)).unwrap();
    minion.join(uid).unwrap();
    pump(&mut [&mut peer, &mut minion]);

    let failures = minion.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, RaetError::Refused(_)));
    assert_eq!(peer.remotes().count(), 0);
}

#[test]
fn test_join_retries_then_times_out() {
    let road = Road::new();
    let _silent = road.net.bind(ha(MAIN_PORT));
    let mut minion = road.minion("minion", 7540);
    minion.bootstrap().unwrap();

    while road.clock.now_ms() < 11_000 {
        minion.service_all();
        road.clock.advance(500);
    }
    minion.service_all();

    // first send plus resends at 1.5s, 2.5s, 4.5s and 8.5s
    assert_eq!(road.net.pending(ha(MAIN_PORT)), 5);
    assert_eq!(minion.transaction_count(), 0);
    assert_eq!(minion.stats().transaction_timeout, 1);
    let failures = minion.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, RaetError::Timeout(_)));
}

#[test]
fn test_restart_reloads_and_reallows() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);
    let main_key = main.local().signer.verhex();
    drop(main);

    let mut main = road.main(AutoMode::Once);
    assert_eq!(main.local().signer.verhex(), main_key);
    let remote = main.remote(back).unwrap();
    assert_eq!(remote.name, "minion");
    assert!(remote.joined);
    assert_eq!(remote.acceptance, Acceptance::Accepted);
    assert_eq!(remote.rsid, 1);
    assert!(!remote.allowed());

    // the minion still thinks it is allowed; main says otherwise
    minion.transmit(uid, json!({"n": 1})).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert!(main.drain_inbox().is_empty());
    assert!(!minion.remote(uid).unwrap().allowed());
    let failures = minion.failures();
    assert!(matches!(failures[0].error, RaetError::NotAllowed(_)));

    minion.allow(uid).unwrap();
    pump(&mut [&mut main, &mut minion]);
    minion.transmit(uid, json!({"n": 2})).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert_eq!(main.drain_inbox()[0].body, json!({"n": 2}));
}

#[test]
fn test_forgotten_joiner_is_renewed() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);
    let first = main.remote_uid("minion").unwrap();

    main.delete_remote(first).unwrap();
    minion.join(uid).unwrap();
    pump(&mut [&mut main, &mut minion]);

    let second = main.remote_uid("minion").unwrap();
    assert_ne!(first, second);
    let remote = minion.remote(uid).unwrap();
    assert!(remote.joined);
    assert_eq!(remote.fuid, second);
    assert!(minion.failures().is_empty());
}

#[test]
fn test_binary_heads_and_msgpack_bodies() {
    let road = Road::new();
    let mut main_config = road.config("main", MAIN_PORT, true, AutoMode::Once);
    main_config.head_kind = HeadKind::Binary;
    main_config.body_kind = BodyKind::Msgpack;
    let mut minion_config = road.config("minion", 7540, false, AutoMode::Never);
    minion_config.head_kind = HeadKind::Binary;
    minion_config.body_kind = BodyKind::Msgpack;
    let mut main = road.open(main_config);
    let mut minion = road.open(minion_config);

    let (uid, _) = join_and_allow(&mut main, &mut minion);
    let blob = "q".repeat(4_000);
    minion.transmit(uid, json!({"small": [1, 2, 3]})).unwrap();
    minion.transmit(uid, json!({"blob": blob})).unwrap();
    pump(&mut [&mut main, &mut minion]);
    let got = main.drain_inbox();
    assert_eq!(got.len(), 2);
    assert!(got.iter().any(|r| r.body == json!({"small": [1, 2, 3]})));
    assert!(got.iter().any(|r| r.body == json!({"blob": blob})));
}

#[test]
fn test_message_to_unjoined_remote_is_refused() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);

    main.delete_remote(back).unwrap();
    minion.transmit(uid, json!({"n": 1})).unwrap();
    pump(&mut [&mut main, &mut minion]);

    assert!(main.drain_inbox().is_empty());
    assert_eq!(main.stats().invalid_destination, 1);
    let remote = minion.remote(uid).unwrap();
    assert!(!remote.joined);
    assert!(!remote.allowed());
    let failures = minion.failures();
    assert!(matches!(failures[0].error, RaetError::NotJoined(_)));
}

/// Main's view of `uid`: acceptance, address and the session in place.
fn standing(main: &RoadStack, uid: u32) -> (Acceptance, SocketAddr, Option<(u32, String)>) {
    let remote = main.remote(uid).unwrap();
    (
        remote.acceptance,
        remote.ha,
        remote
            .session()
            .map(|s| (s.sid, s.key.fingerprint())),
    )
}

fn allow_trust_failures(failures: &[raet_road::Failure]) -> usize {
    failures
        .iter()
        .filter(|f| f.kind == TrnsKind::Allow && matches!(f.error, RaetError::TrustFailure(_)))
        .count()
}

#[test]
fn test_impostor_join_leaves_accepted_peer_untouched() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);
    let before = standing(&main, back);
    let verfer = main.remote(back).unwrap().verfer;

    // same name, fresh keys, another address
    let mut config = road.config("minion", 7999, false, AutoMode::Never);
    config.keep_dir = Some(road.tmp.path().join("impostor"));
    let mut impostor = road.open(config);
    let fake = impostor.bootstrap().unwrap();
    let trust_before = main.stats().trust_failure;
    pump(&mut [&mut main, &mut minion, &mut impostor]);

    assert_eq!(standing(&main, back), before);
    let remote = main.remote(back).unwrap();
    assert_eq!(remote.ha, ha(7540));
    assert_eq!(remote.verfer, verfer);
    assert!(remote.joined);
    assert_eq!(main.remotes().count(), 1);
    assert_eq!(main.remote_uid_by_ha(&ha(7999)), None);
    assert_eq!(main.stats().trust_failure, trust_before + 1);
    assert!(!impostor.remote(fake).unwrap().joined);
    let failures = impostor.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, RaetError::Refused(_)));

    // the real peer carries on under its session
    minion.transmit(uid, json!({"still": "here"})).unwrap();
    pump(&mut [&mut main, &mut minion]);
    assert_eq!(main.drain_inbox()[0].body, json!({"still": "here"}));

    // and nothing about it changed on disk
    drop(main);
    let main = road.main(AutoMode::Once);
    let remote = main.remote(back).unwrap();
    assert_eq!(remote.ha, ha(7540));
    assert_eq!(remote.verfer, verfer);
    assert_eq!(remote.acceptance, Acceptance::Accepted);
}

#[test]
fn test_shared_role_shares_acceptance() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Never);
    let mut config = road.config("primary-minion", 7540, false, AutoMode::Never);
    config.role = "primary".to_string();
    let mut first = road.open(config);

    // a second estate of the same role holding the same keys
    let mut local = Keep::open(road.tmp.path().join("primary-minion"))
        .unwrap()
        .load_local()
        .unwrap()
        .unwrap();
    local.name = "primary-caller".to_string();
    Keep::open(road.tmp.path().join("primary-caller"))
        .unwrap()
        .dump_local(&local)
        .unwrap();
    let mut config = road.config("primary-caller", 7541, false, AutoMode::Never);
    config.role = "primary".to_string();
    let mut second = road.open(config);
    assert_eq!(second.name(), "primary-caller");

    let a = first.bootstrap().unwrap();
    pump(&mut [&mut main, &mut first]);
    let a_on_main = main.remote_uid("primary-minion").unwrap();
    assert_eq!(main.remote(a_on_main).unwrap().acceptance, Acceptance::Pending);
    main.accept_remote(a_on_main).unwrap();
    pump(&mut [&mut main, &mut first]);
    assert!(first.remote(a).unwrap().joined);

    // the decision made for the first member admits the second at once
    let b = second.bootstrap().unwrap();
    pump(&mut [&mut main, &mut second]);
    assert!(second.remote(b).unwrap().joined);
    let b_on_main = main.remote_uid("primary-caller").unwrap();
    assert_ne!(a_on_main, b_on_main);
    assert_eq!(main.remote(b_on_main).unwrap().acceptance, Acceptance::Accepted);
    assert_eq!(main.transaction_count(), 0);

    // and rejecting one member rejects the role
    main.reject_remote(b_on_main).unwrap();
    assert_eq!(main.remote(a_on_main).unwrap().acceptance, Acceptance::Rejected);
    assert_eq!(main.remote(b_on_main).unwrap().acceptance, Acceptance::Rejected);
}

#[test]
fn test_lost_segment_triggers_whole_message_resend() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, _) = join_and_allow(&mut main, &mut minion);

    let blob = "s".repeat(5_000);
    minion.transmit(uid, json!({ "blob": blob })).unwrap();
    minion.service_all();
    let mut segments = road.net.capture(ha(MAIN_PORT));
    let count = segments.len();
    assert!(count > 2);
    segments.remove(1);
    for (from, data) in segments {
        road.net.inject(from, ha(MAIN_PORT), data);
    }
    pump(&mut [&mut main, &mut minion]);
    assert!(main.drain_inbox().is_empty());
    assert_eq!(main.transaction_count(), 1);
    assert_eq!(minion.transaction_count(), 1);

    // the first resend carries every segment again
    road.clock.advance(500);
    minion.service_all();
    assert_eq!(road.net.pending(ha(MAIN_PORT)), count);
    pump(&mut [&mut main, &mut minion]);

    let got = main.drain_inbox();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body["blob"], json!(blob));
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(minion.transaction_count(), 0);
    assert!(minion.failures().is_empty());
}

#[test]
fn test_allow_survives_lost_hello() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);

    minion.allow(uid).unwrap();
    minion.service_all();
    assert_eq!(road.net.capture(ha(MAIN_PORT)).len(), 1);
    pump(&mut [&mut main, &mut minion]);
    assert!(!minion.remote(uid).unwrap().allowed());

    road.clock.advance(500);
    pump(&mut [&mut main, &mut minion]);
    assert!(minion.remote(uid).unwrap().allowed());
    let back = main.remote_uid("minion").unwrap();
    assert!(main.remote(back).unwrap().allowed());
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_allow_survives_lost_cookie() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);

    minion.allow(uid).unwrap();
    minion.service_all();
    main.service_all();
    assert_eq!(road.net.capture(ha(7540)).len(), 1);
    assert_eq!(main.transaction_count(), 1);

    // the resent hello reaches the held exchange, which repeats its cookie
    road.clock.advance(500);
    pump(&mut [&mut main, &mut minion]);
    let back = main.remote_uid("minion").unwrap();
    let ours = minion.remote(uid).unwrap().session().unwrap();
    let theirs = main.remote(back).unwrap().session().unwrap();
    assert_eq!(ours.key.fingerprint(), theirs.key.fingerprint());
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(minion.transaction_count(), 0);
}

#[test]
fn test_replayed_cookie_is_refused() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let uid = minion.bootstrap().unwrap();
    pump(&mut [&mut main, &mut minion]);
    let back = main.remote_uid("minion").unwrap();
    let relay = ha(7999);
    let _spy = road.net.bind(relay);

    // the hello also arrives from a relaying address, opening a second exchange
    minion.allow(uid).unwrap();
    minion.service_all();
    let hello = road.net.capture(ha(MAIN_PORT));
    assert_eq!(hello.len(), 1);
    road.net.inject(ha(7540), ha(MAIN_PORT), hello[0].1.clone());
    road.net.inject(relay, ha(MAIN_PORT), hello[0].1.clone());
    main.service_all();
    assert_eq!(main.transaction_count(), 2);

    minion.service_all();
    let initiate = road.net.capture(ha(MAIN_PORT));
    assert_eq!(initiate.len(), 1);
    road.net.inject(ha(7540), ha(MAIN_PORT), initiate[0].1.clone());
    pump(&mut [&mut main, &mut minion]);
    assert!(minion.remote(uid).unwrap().allowed());
    let before = standing(&main, back);
    let trust_before = main.stats().trust_failure;
    assert!(main.failures().is_empty());

    // the same cookie presented to the relayed exchange
    road.net.inject(relay, ha(MAIN_PORT), initiate[0].1.clone());
    main.service_all();
    assert_eq!(main.stats().trust_failure, trust_before + 1);
    assert_eq!(allow_trust_failures(&main.failures()), 1);
    assert_eq!(main.transaction_count(), 0);
    assert_eq!(standing(&main, back), before);
    assert!(main.remote(back).unwrap().joined);
}

#[test]
fn test_expired_cookie_is_refused() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);
    let before = standing(&main, back);
    let trust_before = main.stats().trust_failure;

    minion.allow(uid).unwrap();
    minion.service_all();
    main.service_all();
    // the cookie sits in flight past its lifetime
    road.clock.advance(main.config().timeouts.cookie_ms + 1);
    minion.service_all();
    main.service_all();

    assert_eq!(main.stats().trust_failure, trust_before + 1);
    assert_eq!(allow_trust_failures(&main.failures()), 1);
    assert_eq!(standing(&main, back), before);
    assert_eq!(main.remote(back).unwrap().rsid, 1);
    pump(&mut [&mut main, &mut minion]);
    assert_eq!(minion.remote(uid).unwrap().session().unwrap().sid, 1);
}

#[test]
fn test_vouch_from_wrong_key_is_refused() {
    let road = Road::new();
    let mut main = road.main(AutoMode::Once);
    let mut minion = road.minion("minion", 7540);
    let (uid, back) = join_and_allow(&mut main, &mut minion);
    let before = standing(&main, back);
    let pubber = main.remote(back).unwrap().pubber;
    drop(minion);

    // the minion comes back signing as before but encrypting under a new key
    let keep = Keep::open(road.tmp.path().join("minion")).unwrap();
    let mut local = keep.load_local().unwrap().unwrap();
    local.privateer = Privateer::generate();
    keep.dump_local(&local).unwrap();
    let mut minion = road.minion("minion", 7540);
    assert!(minion.remote(uid).unwrap().joined);

    let trust_before = main.stats().trust_failure;
    minion.allow(uid).unwrap();
    pump(&mut [&mut main, &mut minion]);

    assert_eq!(main.stats().trust_failure, trust_before + 1);
    assert_eq!(allow_trust_failures(&main.failures()), 1);
    assert_eq!(standing(&main, back), before);
    assert_eq!(main.remote(back).unwrap().pubber, pubber);
    assert!(!minion.remote(uid).unwrap().allowed());
}
