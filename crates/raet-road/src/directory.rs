//! Peer directory: every remote estate a stack knows about.
//!
//! Remotes are keyed by uid with reverse indexes by name and by address.
//! The directory is owned by one stack and mutated only from its service
//! loop, so it needs no locking.

use crate::estate::{RemoteEstate, LOCAL_UID};
use raet_types::{RaetError, RaetResult};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Uid/name/address-indexed table of remote estates.
#[derive(Debug)]
pub struct Directory {
    remotes: HashMap<u32, RemoteEstate>,
    by_name: HashMap<String, u32>,
    by_ha: HashMap<SocketAddr, u32>,
    next_uid: u32,
}

impl Directory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self {
            remotes: HashMap::new(),
            by_name: HashMap::new(),
            by_ha: HashMap::new(),
            next_uid: LOCAL_UID + 1,
        }
    }

    /// Hand out the next unused uid.
    pub fn allocate_uid(&mut self) -> u32 {
        loop {
            let uid = self.next_uid;
            self.next_uid = self.next_uid.wrapping_add(1);
            if self.next_uid <= LOCAL_UID {
                self.next_uid = LOCAL_UID + 1;
            }
            if uid > LOCAL_UID && !self.remotes.contains_key(&uid) {
                return uid;
            }
        }
    }

    /// Register a remote. Uid, address and non-empty name must all be unused.
    pub fn add(&mut self, remote: RemoteEstate) -> RaetResult<()> {
        if remote.uid <= LOCAL_UID || self.remotes.contains_key(&remote.uid) {
            return Err(RaetError::RemoteExists(format!("uid {}", remote.uid)));
        }
        if !remote.name.is_empty() && self.by_name.contains_key(&remote.name) {
            return Err(RaetError::RemoteExists(format!("name {}", remote.name)));
        }
        if self.by_ha.contains_key(&remote.ha) {
            return Err(RaetError::RemoteExists(format!("ha {}", remote.ha)));
        }
        if !remote.name.is_empty() {
            self.by_name.insert(remote.name.clone(), remote.uid);
        }
        self.by_ha.insert(remote.ha, remote.uid);
        if remote.uid >= self.next_uid {
            self.next_uid = remote.uid.wrapping_add(1).max(LOCAL_UID + 1);
        }
        self.remotes.insert(remote.uid, remote);
        Ok(())
    }

    /// Remove a remote entirely.
    pub fn remove(&mut self, uid: u32) -> Option<RemoteEstate> {
        let remote = self.remotes.remove(&uid)?;
        if self.by_name.get(&remote.name) == Some(&uid) {
            self.by_name.remove(&remote.name);
        }
        if self.by_ha.get(&remote.ha) == Some(&uid) {
            self.by_ha.remove(&remote.ha);
        }
        Some(remote)
    }

    /// Change a remote's name, keeping the name index unique.
    pub fn rename(&mut self, uid: u32, name: &str) -> RaetResult<()> {
        if let Some(&owner) = self.by_name.get(name) {
            if owner != uid {
                return Err(RaetError::RemoteExists(format!("name {name}")));
            }
        }
        let remote = self
            .remotes
            .get_mut(&uid)
            .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
        if remote.name == name {
            return Ok(());
        }
        if !remote.name.is_empty() {
            self.by_name.remove(&remote.name);
        }
        remote.name = name.to_string();
        self.by_name.insert(name.to_string(), uid);
        Ok(())
    }

    /// Change a remote's address, keeping the address index unique.
    pub fn move_ha(&mut self, uid: u32, ha: SocketAddr) -> RaetResult<()> {
        if let Some(&owner) = self.by_ha.get(&ha) {
            if owner != uid {
                return Err(RaetError::RemoteExists(format!("ha {ha}")));
            }
        }
        let remote = self
            .remotes
            .get_mut(&uid)
            .ok_or_else(|| RaetError::UnknownRemote(format!("uid {uid}")))?;
        if remote.ha == ha {
            return Ok(());
        }
        if self.by_ha.get(&remote.ha) == Some(&uid) {
            self.by_ha.remove(&remote.ha);
        }
        remote.ha = ha;
        self.by_ha.insert(ha, uid);
        Ok(())
    }

    /// Get a remote by uid.
    pub fn get(&self, uid: u32) -> Option<&RemoteEstate> {
        self.remotes.get(&uid)
    }

    /// Get a remote by uid, mutably.
    pub fn get_mut(&mut self, uid: u32) -> Option<&mut RemoteEstate> {
        self.remotes.get_mut(&uid)
    }

    /// Uid of the remote with this name.
    pub fn uid_by_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Uid of the remote at this address.
    pub fn uid_by_ha(&self, ha: &SocketAddr) -> Option<u32> {
        self.by_ha.get(ha).copied()
    }

    /// All remotes, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteEstate> {
        self.remotes.values()
    }

    /// All remotes, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemoteEstate> {
        self.remotes.values_mut()
    }

    /// Number of remotes.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ha(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_and_lookup() {
        let mut dir = Directory::new();
        let uid = dir.allocate_uid();
        assert_eq!(uid, 2);
        dir.add(RemoteEstate::new(uid, "alpha", ha(7001))).unwrap();
        assert_eq!(dir.uid_by_name("alpha"), Some(2));
        assert_eq!(dir.uid_by_ha(&ha(7001)), Some(2));
        assert_eq!(dir.get(2).unwrap().name, "alpha");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_uniqueness() {
        let mut dir = Directory::new();
        dir.add(RemoteEstate::new(2, "alpha", ha(7001))).unwrap();
        assert!(matches!(
            dir.add(RemoteEstate::new(2, "beta", ha(7002))),
            Err(RaetError::RemoteExists(_))
        ));
        assert!(matches!(
            dir.add(RemoteEstate::new(3, "alpha", ha(7003))),
            Err(RaetError::RemoteExists(_))
        ));
        assert!(dir.add(RemoteEstate::new(LOCAL_UID, "self", ha(7004))).is_err());
        // vacuous remotes share the empty name
        dir.add(RemoteEstate::vacuous(4, ha(7005))).unwrap();
        dir.add(RemoteEstate::vacuous(5, ha(7006))).unwrap();
        assert_eq!(dir.len(), 3);
        // but never an address
        assert!(matches!(
            dir.add(RemoteEstate::new(6, "gamma", ha(7001))),
            Err(RaetError::RemoteExists(_))
        ));
        assert!(matches!(
            dir.add(RemoteEstate::vacuous(6, ha(7005))),
            Err(RaetError::RemoteExists(_))
        ));
        assert_eq!(dir.uid_by_ha(&ha(7001)), Some(2));
        assert_eq!(dir.uid_by_ha(&ha(7005)), Some(4));
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_allocator_skips_loaded_uids() {
        let mut dir = Directory::new();
        dir.add(RemoteEstate::new(7, "seven", ha(7007))).unwrap();
        assert_eq!(dir.allocate_uid(), 8);
        let mut other = Directory::new();
        assert_eq!(other.allocate_uid(), 2);
    }

    #[test]
    fn test_rename_and_move() {
        let mut dir = Directory::new();
        dir.add(RemoteEstate::vacuous(2, ha(7001))).unwrap();
        dir.add(RemoteEstate::new(3, "taken", ha(7002))).unwrap();
        dir.rename(2, "fresh").unwrap();
        assert_eq!(dir.uid_by_name("fresh"), Some(2));
        assert!(dir.rename(2, "taken").is_err());
        dir.move_ha(2, ha(7100)).unwrap();
        assert_eq!(dir.uid_by_ha(&ha(7100)), Some(2));
        assert_eq!(dir.uid_by_ha(&ha(7001)), None);
        assert!(dir.move_ha(2, ha(7002)).is_err());
        assert_eq!(dir.get(2).unwrap().ha, ha(7100));
        assert_eq!(dir.uid_by_ha(&ha(7002)), Some(3));
    }

    #[test]
    fn test_remove() {
        let mut dir = Directory::new();
        dir.add(RemoteEstate::new(2, "alpha", ha(7001))).unwrap();
        assert!(dir.remove(2).is_some());
        assert!(dir.remove(2).is_none());
        assert_eq!(dir.uid_by_name("alpha"), None);
        assert!(dir.is_empty());
    }
}
