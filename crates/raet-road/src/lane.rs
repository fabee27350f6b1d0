//! Lane stack: local messaging over unix datagram sockets.
//!
//! Each lane endpoint binds `<sock_dir>/<name>.uxd` and addresses peers by
//! name. Messages are paged with a [`Paginator`] and bound back together
//! with a [`Binder`]; there is no handshake, no encryption and no retry,
//! since the socket never leaves the host. The tick discipline matches the
//! road stack: drain the socket, then flush the transmit queue, never
//! blocking.

use raet_types::config::StackConfig;
use raet_types::kinds::{BodyKind, UXD_MAX_PACKET_SIZE};
use raet_types::{RaetError, RaetResult};
use raet_wire::{Binder, PageKind, Paginator};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SOCKET_SUFFIX: &str = "uxd";

/// How long a partially received message waits for its remaining pages.
pub const BOOK_TTL: Duration = Duration::from_secs(30);

/// Per-lane counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneStats {
    pub pages_received: u64,
    pub pages_sent: u64,
    pub malformed_page: u64,
    pub missing_peer: u64,
    pub would_block: u64,
    pub books_evicted: u64,
}

/// Default socket directory: `~/.raet/uxd`.
pub fn default_sock_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".raet")
        .join("uxd")
}

/// A unix datagram endpoint named within one socket directory.
#[derive(Debug)]
pub struct LaneStack {
    name: String,
    dir: PathBuf,
    path: PathBuf,
    socket: UnixDatagram,
    paginator: Paginator,
    binder: Binder,
    tx_queue: VecDeque<(PathBuf, Vec<u8>)>,
    inbox: VecDeque<(String, Value)>,
    stats: LaneStats,
}

impl LaneStack {
    /// Open a lane per the stack configuration's name and lane settings.
    pub fn open(config: &StackConfig) -> RaetResult<Self> {
        let dir = config.lane.sock_dir.clone().unwrap_or_else(default_sock_dir);
        let kind = match config.body_kind {
            BodyKind::Msgpack => PageKind::Msgpack,
            _ => PageKind::Json,
        };
        Self::open_at(&dir, &config.name, kind, config.lane.page_size)
    }

    /// Open a lane named `name` in `dir`. A socket left behind by a dead
    /// process under the same name is replaced.
    ///
    /// `page_size` only bounds outgoing pages; every lane receives into a
    /// [`UXD_MAX_PACKET_SIZE`] buffer so peers may page at different sizes.
    pub fn open_at(dir: &Path, name: &str, kind: PageKind, page_size: usize) -> RaetResult<Self> {
        if name.is_empty() {
            return Err(RaetError::Config("lane name is empty".to_string()));
        }
        if page_size > UXD_MAX_PACKET_SIZE {
            return Err(RaetError::Config(format!(
                "lane page size {page_size} exceeds {UXD_MAX_PACKET_SIZE}"
            )));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.{SOCKET_SUFFIX}"));
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "RAET: removed stale lane socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let socket = UnixDatagram::bind(&path)?;
        socket.set_nonblocking(true)?;
        info!(name, path = %path.display(), "RAET: lane opened");
        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            path,
            socket,
            paginator: Paginator::new(name, kind, page_size),
            binder: Binder::new(),
            tx_queue: VecDeque::new(),
            inbox: VecDeque::new(),
            stats: LaneStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of this lane's socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &LaneStats {
        &self.stats
    }

    /// Page `body` for the lane named `to`; pages go out on the next tick.
    pub fn transmit(&mut self, to: &str, body: &Value) -> RaetResult<()> {
        let pages = self.paginator.paginate(to, body)?;
        let dest = self.dir.join(format!("{to}.{SOCKET_SUFFIX}"));
        debug!(to, pages = pages.len(), "RAET: lane message queued");
        self.tx_queue
            .extend(pages.into_iter().map(|page| (dest.clone(), page)));
        Ok(())
    }

    /// Run one tick: receive everything waiting, then send what is queued.
    pub fn service_all(&mut self) {
        self.service_receives();
        self.service_tx_queue();
    }

    fn service_receives(&mut self) {
        let mut buf = vec![0u8; UXD_MAX_PACKET_SIZE];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    self.stats.pages_received += 1;
                    match self.binder.parse_at(&buf[..n], Instant::now()) {
                        Ok(Some((sender, body))) => self.inbox.push_back((sender, body)),
                        Ok(None) => {}
                        Err(e) => {
                            self.stats.malformed_page += 1;
                            debug!(error = %e, "RAET: dropping malformed page");
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "RAET: lane receive failed");
                    break;
                }
            }
        }
        let evicted = self.binder.evict_stale(Instant::now(), BOOK_TTL);
        if evicted > 0 {
            self.stats.books_evicted += evicted as u64;
            debug!(evicted, "RAET: dropped incomplete lane messages");
        }
    }

    fn service_tx_queue(&mut self) {
        while let Some((dest, page)) = self.tx_queue.pop_front() {
            match self.socket.send_to(&page, &dest) {
                Ok(_) => self.stats.pages_sent += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.tx_queue.push_front((dest, page));
                    self.stats.would_block += 1;
                    break;
                }
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                    self.stats.missing_peer += 1;
                    debug!(dest = %dest.display(), "RAET: no lane at destination, dropping page");
                }
                Err(e) => warn!(error = %e, dest = %dest.display(), "RAET: lane send failed"),
            }
        }
    }

    /// Take every whole message received so far as `(sender, body)`.
    pub fn drain_inbox(&mut self) -> Vec<(String, Value)> {
        self.inbox.drain(..).collect()
    }
}

impl Drop for LaneStack {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(error = %e, path = %self.path.display(), "RAET: failed to remove lane socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lane(dir: &Path, name: &str, page_size: usize) -> LaneStack {
        LaneStack::open_at(dir, name, PageKind::Json, page_size).unwrap()
    }

    fn settle(lanes: &mut [&mut LaneStack]) {
        for _ in 0..20 {
            for lane in lanes.iter_mut() {
                lane.service_all();
            }
        }
    }

    #[test]
    fn test_lane_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alpha = lane(tmp.path(), "alpha", 8192);
        let mut beta = lane(tmp.path(), "beta", 8192);
        alpha.transmit("beta", &json!({"cmd": "ping"})).unwrap();
        settle(&mut [&mut alpha, &mut beta]);
        assert_eq!(
            beta.drain_inbox(),
            vec![("alpha".to_string(), json!({"cmd": "ping"}))]
        );
        assert!(alpha.drain_inbox().is_empty());
    }

    #[test]
    fn test_lane_pages_large_message() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alpha = lane(tmp.path(), "alpha", 512);
        let mut beta = lane(tmp.path(), "beta", 512);
        let blob: String = (0..5_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        alpha.transmit("beta", &json!({"blob": blob})).unwrap();
        assert!(alpha.stats().pages_sent == 0);
        settle(&mut [&mut alpha, &mut beta]);
        assert!(alpha.stats().pages_sent > 1);
        let inbox = beta.drain_inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].1["blob"], json!(blob));
    }

    #[test]
    fn test_missing_peer_is_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alpha = lane(tmp.path(), "alpha", 8192);
        alpha.transmit("nobody", &json!({})).unwrap();
        alpha.service_all();
        assert_eq!(alpha.stats().missing_peer, 1);
    }

    #[test]
    fn test_socket_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = {
            let alpha = lane(tmp.path(), "alpha", 8192);
            assert!(alpha.path().exists());
            alpha.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_page_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alpha = lane(tmp.path(), "alpha", 8192);
        let raw = UnixDatagram::unbound().unwrap();
        raw.send_to(b"garbage", alpha.path()).unwrap();
        alpha.service_all();
        assert_eq!(alpha.stats().malformed_page, 1);
        assert!(alpha.drain_inbox().is_empty());
    }

    #[test]
    fn test_peers_with_different_page_sizes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alpha = lane(tmp.path(), "alpha", UXD_MAX_PACKET_SIZE);
        let mut beta = lane(tmp.path(), "beta", 512);
        let blob = "w".repeat(3_000);
        alpha.transmit("beta", &json!({"blob": blob})).unwrap();
        settle(&mut [&mut alpha, &mut beta]);
        assert_eq!(alpha.stats().pages_sent, 1);
        let inbox = beta.drain_inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].1["blob"], json!(blob));
        assert_eq!(beta.stats().malformed_page, 0);
    }

    #[test]
    fn test_oversized_page_ceiling_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            LaneStack::open_at(tmp.path(), "alpha", PageKind::Json, UXD_MAX_PACKET_SIZE + 1),
            Err(RaetError::Config(_))
        ));
    }
}
