//! Keep: durable identity and trust storage.
//!
//! Every estate has two JSON documents. The road document holds
//! non-secret routing and session data; the safe document holds keys and
//! trust status and is readable by the owner only.
//!
//! ```text
//! <keep_dir>/local/road.json           <keep_dir>/local/safe.json
//! <keep_dir>/remote/<uid>.road.json    <keep_dir>/remote/<uid>.safe.json
//!                                      <keep_dir>/role/<role>.safe.json
//! ```
//!
//! Remotes that advertise the same non-empty role share one trust record:
//! the role's safe document holds the keys and acceptance every member is
//! judged against, so one decision covers them all.
//!
//! Documents are written to a temporary file and renamed into place, so a
//! crash never leaves a half-written document behind.

use crate::estate::{LocalEstate, RemoteEstate};
use chrono::{DateTime, Utc};
use raet_types::kinds::{Acceptance, AutoMode};
use raet_types::RaetError;
use raet_wire::{Privateer, Publican, Signer, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const ROAD_SUFFIX: &str = ".road.json";
const SAFE_SUFFIX: &str = ".safe.json";

/// Errors from the keep.
#[derive(Debug, Error)]
pub enum KeepError {
    #[error("Keep I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt keep document {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl From<KeepError> for RaetError {
    fn from(e: KeepError) -> Self {
        RaetError::Keep(e.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeepError + '_ {
    move |source| KeepError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> KeepError {
    KeepError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Restrict file permissions to owner-only (0600) on Unix.
#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LocalRoad {
    uid: u32,
    name: String,
    ha: SocketAddr,
    main: bool,
    role: String,
    kind: u8,
}

#[derive(Serialize, Deserialize)]
struct LocalSafe {
    sighex: String,
    prihex: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteRoad {
    uid: u32,
    fuid: u32,
    name: String,
    ha: SocketAddr,
    role: String,
    kind: u8,
    joined: bool,
    sid: u32,
    rsid: u32,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleSafe {
    role: String,
    verhex: Option<String>,
    pubhex: Option<String>,
    acceptance: Acceptance,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteSafe {
    uid: u32,
    name: String,
    verhex: Option<String>,
    pubhex: Option<String>,
    acceptance: Acceptance,
}

/// Whether `role` can name a shared trust record.
pub fn is_valid_role(role: &str) -> bool {
    !role.is_empty()
        && role.len() <= 64
        && !role.starts_with('.')
        && role
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Keys and acceptance an offered identity is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trust {
    pub verfer: Option<Verifier>,
    pub pubber: Option<Publican>,
    pub acceptance: Acceptance,
}

impl Trust {
    fn of(remote: &RemoteEstate) -> Self {
        Self {
            verfer: remote.verfer,
            pubber: remote.pubber,
            acceptance: remote.acceptance,
        }
    }

    fn holds(&self, verfer: Verifier, pubber: Publican) -> bool {
        self.verfer == Some(verfer) && self.pubber == Some(pubber)
    }

    /// Judge an offer against this record.
    ///
    /// | stored status | offered keys | result   |
    /// |---------------|--------------|----------|
    /// | unseen        |              | pending (accepted under `once`) |
    /// | accepted      | same         | accepted |
    /// | accepted      | different    | rejected |
    /// | rejected      | same         | rejected |
    /// | rejected      | different    | pending  |
    /// | pending       | any          | pending  |
    ///
    /// Under `always` every offer is accepted.
    pub fn judge(&self, verfer: Verifier, pubber: Publican, mode: AutoMode) -> Acceptance {
        let seen = self.verfer.is_some() && self.pubber.is_some();
        let same = self.holds(verfer, pubber);
        match (mode, seen, self.acceptance) {
            (AutoMode::Always, _, _) => Acceptance::Accepted,
            (AutoMode::Once, false, _) => Acceptance::Accepted,
            (AutoMode::Never, false, _) => Acceptance::Pending,
            (_, true, Acceptance::Accepted) if same => Acceptance::Accepted,
            (_, true, Acceptance::Accepted) => Acceptance::Rejected,
            (_, true, Acceptance::Rejected) if same => Acceptance::Rejected,
            (_, true, Acceptance::Rejected) => Acceptance::Pending,
            (_, true, Acceptance::Pending) => Acceptance::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Keep
// ---------------------------------------------------------------------------

/// File-backed identity store rooted at one directory.
#[derive(Debug, Clone)]
pub struct Keep {
    dir: PathBuf,
}

impl Keep {
    /// Open (creating if needed) a keep rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeepError> {
        let keep = Self { dir: dir.into() };
        for sub in [keep.local_dir(), keep.remote_dir(), keep.role_dir()] {
            std::fs::create_dir_all(&sub).map_err(io_err(&sub))?;
        }
        Ok(keep)
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn local_dir(&self) -> PathBuf {
        self.dir.join("local")
    }

    fn remote_dir(&self) -> PathBuf {
        self.dir.join("remote")
    }

    fn role_dir(&self) -> PathBuf {
        self.dir.join("role")
    }

    fn role_path(&self, role: &str) -> Option<PathBuf> {
        is_valid_role(role).then(|| self.role_dir().join(format!("{role}{SAFE_SUFFIX}")))
    }

    fn remote_path(&self, uid: u32, suffix: &str) -> PathBuf {
        self.remote_dir().join(format!("{uid}{suffix}"))
    }

    fn write<T: Serialize>(&self, path: &Path, doc: &T, secret: bool) -> Result<(), KeepError> {
        let contents = serde_json::to_vec_pretty(doc).map_err(|e| corrupt(path, e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(io_err(&tmp))?;
        if secret {
            restrict_file_permissions(&tmp).map_err(io_err(&tmp))?;
        }
        std::fs::rename(&tmp, path).map_err(io_err(path))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, KeepError> {
        let contents = match std::fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path)(e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| corrupt(path, e))
    }

    fn remove(&self, path: &Path) -> Result<(), KeepError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path)(e)),
        }
    }

    // -- local --------------------------------------------------------------

    /// Persist the local estate.
    pub fn dump_local(&self, local: &LocalEstate) -> Result<(), KeepError> {
        let road = LocalRoad {
            uid: local.uid,
            name: local.name.clone(),
            ha: local.ha,
            main: local.main,
            role: local.role.clone(),
            kind: local.kind,
        };
        let safe = LocalSafe {
            sighex: local.signer.keyhex(),
            prihex: local.privateer.keyhex(),
        };
        self.write(&self.local_dir().join("road.json"), &road, false)?;
        self.write(&self.local_dir().join("safe.json"), &safe, true)
    }

    /// Load the local estate, if one was saved.
    pub fn load_local(&self) -> Result<Option<LocalEstate>, KeepError> {
        let road_path = self.local_dir().join("road.json");
        let safe_path = self.local_dir().join("safe.json");
        let road: Option<LocalRoad> = self.read(&road_path)?;
        let safe: Option<LocalSafe> = self.read(&safe_path)?;
        let (road, safe) = match (road, safe) {
            (Some(road), Some(safe)) => (road, safe),
            (None, None) => return Ok(None),
            _ => return Err(corrupt(&self.dir, "local road and safe documents out of step")),
        };
        Ok(Some(LocalEstate {
            uid: road.uid,
            name: road.name,
            ha: road.ha,
            main: road.main,
            role: road.role,
            kind: road.kind,
            signer: Signer::from_hex(&safe.sighex).map_err(|e| corrupt(&safe_path, e))?,
            privateer: Privateer::from_hex(&safe.prihex).map_err(|e| corrupt(&safe_path, e))?,
        }))
    }

    // -- remotes ------------------------------------------------------------

    /// Persist a remote's road document.
    pub fn dump_remote_road(&self, remote: &RemoteEstate) -> Result<(), KeepError> {
        let road = RemoteRoad {
            uid: remote.uid,
            fuid: remote.fuid,
            name: remote.name.clone(),
            ha: remote.ha,
            role: remote.role.clone(),
            kind: remote.kind,
            joined: remote.joined,
            sid: remote.sid,
            rsid: remote.rsid,
            updated_at: Utc::now(),
        };
        self.write(&self.remote_path(remote.uid, ROAD_SUFFIX), &road, false)
    }

    /// Persist a remote's safe document.
    pub fn dump_remote_safe(&self, remote: &RemoteEstate) -> Result<(), KeepError> {
        let safe = RemoteSafe {
            uid: remote.uid,
            name: remote.name.clone(),
            verhex: remote.verfer.map(|v| v.hex()),
            pubhex: remote.pubber.map(|p| p.hex()),
            acceptance: remote.acceptance,
        };
        self.write(&self.remote_path(remote.uid, SAFE_SUFFIX), &safe, true)
    }

    /// Persist both documents of a remote.
    pub fn dump_remote(&self, remote: &RemoteEstate) -> Result<(), KeepError> {
        self.dump_remote_road(remote)?;
        self.dump_remote_safe(remote)
    }

    /// Delete both documents of a remote.
    pub fn remove_remote(&self, uid: u32) -> Result<(), KeepError> {
        self.remove(&self.remote_path(uid, ROAD_SUFFIX))?;
        self.remove(&self.remote_path(uid, SAFE_SUFFIX))
    }

    /// Load every saved remote, sorted by uid.
    ///
    /// A remote missing one of its two documents is skipped with a warning.
    pub fn load_remotes(&self) -> Result<Vec<RemoteEstate>, KeepError> {
        let dir = self.remote_dir();
        let entries = std::fs::read_dir(&dir).map_err(io_err(&dir))?;
        let mut remotes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let file_name = entry.file_name();
            let Some(uid) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(ROAD_SUFFIX))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            match self.load_remote(uid)? {
                Some(remote) => remotes.push(remote),
                None => warn!(uid, "RAET: remote road document without safe document, skipping"),
            }
        }
        remotes.sort_by_key(|r| r.uid);
        debug!(count = remotes.len(), dir = %self.dir.display(), "RAET: loaded remotes");
        Ok(remotes)
    }

    fn load_remote(&self, uid: u32) -> Result<Option<RemoteEstate>, KeepError> {
        let safe_path = self.remote_path(uid, SAFE_SUFFIX);
        let road: Option<RemoteRoad> = self.read(&self.remote_path(uid, ROAD_SUFFIX))?;
        let safe: Option<RemoteSafe> = self.read(&safe_path)?;
        let (Some(road), Some(safe)) = (road, safe) else {
            return Ok(None);
        };
        let mut remote = RemoteEstate::new(road.uid, road.name, road.ha);
        remote.fuid = road.fuid;
        remote.role = road.role;
        remote.kind = road.kind;
        remote.joined = road.joined;
        remote.sid = road.sid;
        remote.rsid = road.rsid;
        remote.acceptance = safe.acceptance;
        remote.verfer = safe
            .verhex
            .as_deref()
            .map(Verifier::from_hex)
            .transpose()
            .map_err(|e| corrupt(&safe_path, e))?;
        remote.pubber = safe
            .pubhex
            .as_deref()
            .map(Publican::from_hex)
            .transpose()
            .map_err(|e| corrupt(&safe_path, e))?;
        if let Some(trust) = self.load_role(&remote.role)? {
            remote.verfer = trust.verfer;
            remote.pubber = trust.pubber;
            remote.acceptance = trust.acceptance;
        }
        Ok(Some(remote))
    }

    // -- roles --------------------------------------------------------------

    /// The shared trust record of `role`, if one was saved.
    pub fn load_role(&self, role: &str) -> Result<Option<Trust>, KeepError> {
        let Some(path) = self.role_path(role) else {
            return Ok(None);
        };
        let Some(doc) = self.read::<RoleSafe>(&path)? else {
            return Ok(None);
        };
        Ok(Some(Trust {
            verfer: doc
                .verhex
                .as_deref()
                .map(Verifier::from_hex)
                .transpose()
                .map_err(|e| corrupt(&path, e))?,
            pubber: doc
                .pubhex
                .as_deref()
                .map(Publican::from_hex)
                .transpose()
                .map_err(|e| corrupt(&path, e))?,
            acceptance: doc.acceptance,
        }))
    }

    /// Persist `remote`'s keys and acceptance as its role's shared record.
    /// Remotes without a role have nothing to share.
    fn dump_role(&self, remote: &RemoteEstate) -> Result<(), KeepError> {
        let Some(path) = self.role_path(&remote.role) else {
            return Ok(());
        };
        let doc = RoleSafe {
            role: remote.role.clone(),
            verhex: remote.verfer.map(|v| v.hex()),
            pubhex: remote.pubber.map(|p| p.hex()),
            acceptance: remote.acceptance,
        };
        self.write(&path, &doc, true)
    }

    // -- trust --------------------------------------------------------------

    /// The record an offer from `remote` under `role` is judged against:
    /// the role's when one exists, else the remote's own.
    pub fn stored_trust(&self, remote: &RemoteEstate, role: &str) -> Result<Trust, KeepError> {
        Ok(self.load_role(role)?.unwrap_or_else(|| Trust::of(remote)))
    }

    /// Judge offered keys without storing anything.
    pub fn evaluate(
        &self,
        remote: &RemoteEstate,
        role: &str,
        verfer: Verifier,
        pubber: Publican,
        mode: AutoMode,
    ) -> Result<Acceptance, KeepError> {
        Ok(self.stored_trust(remote, role)?.judge(verfer, pubber, mode))
    }

    /// Judge offered keys for `remote` under its role and store the result.
    ///
    /// The offered keys become the stored keys unless the offer is rejected
    /// for not matching keys already trusted; those are never replaced.
    pub fn status_remote(
        &self,
        remote: &mut RemoteEstate,
        verfer: Verifier,
        pubber: Publican,
        mode: AutoMode,
    ) -> Result<Acceptance, KeepError> {
        let stored = self.stored_trust(remote, &remote.role)?;
        let same = stored.holds(verfer, pubber);
        let status = stored.judge(verfer, pubber, mode);
        if status != stored.acceptance || !same {
            debug!(
                uid = remote.uid,
                role = %remote.role,
                from = ?stored.acceptance,
                to = ?status,
                keys_changed = !same,
                "RAET: remote status evaluated"
            );
        }
        if status == Acceptance::Rejected && !same {
            return Ok(status);
        }
        remote.verfer = Some(verfer);
        remote.pubber = Some(pubber);
        remote.acceptance = status;
        self.dump_remote_safe(remote)?;
        self.dump_role(remote)?;
        Ok(status)
    }

    /// Mark a remote accepted and persist, for its role too.
    pub fn accept_remote(&self, remote: &mut RemoteEstate) -> Result<(), KeepError> {
        remote.acceptance = Acceptance::Accepted;
        self.dump_remote_safe(remote)?;
        self.dump_role(remote)
    }

    /// Mark a remote rejected and persist, for its role too.
    pub fn reject_remote(&self, remote: &mut RemoteEstate) -> Result<(), KeepError> {
        remote.acceptance = Acceptance::Rejected;
        self.dump_remote_safe(remote)?;
        self.dump_role(remote)
    }
}
