//! `raet keys`: offline trust management against a stack's keep.
//!
//! These commands touch only the keep files. A running stack reads them at
//! startup, so decisions made here take effect on its next restart.

use crate::ui;
use anyhow::{bail, Context};
use raet_road::{Keep, RemoteEstate};
use raet_types::config::StackConfig;
use raet_types::kinds::Acceptance;
use serde_json::json;

fn acceptance_label(acceptance: Acceptance) -> &'static str {
    match acceptance {
        Acceptance::Pending => "pending",
        Acceptance::Accepted => "accepted",
        Acceptance::Rejected => "rejected",
    }
}

pub fn open_keep(config: &StackConfig) -> anyhow::Result<Keep> {
    let dir = config.resolved_keep_dir();
    Keep::open(&dir).with_context(|| format!("opening keep at {}", dir.display()))
}

/// Find a remote by uid, falling back to name.
pub fn find_remote(keep: &Keep, target: &str) -> anyhow::Result<RemoteEstate> {
    let remotes = keep.load_remotes()?;
    let by_uid = target.parse::<u32>().ok();
    let mut found = remotes
        .into_iter()
        .filter(|r| Some(r.uid) == by_uid || r.name == target);
    match (found.next(), found.next()) {
        (Some(remote), None) => Ok(remote),
        (Some(_), Some(_)) => bail!("'{target}' matches more than one remote, use the uid"),
        (None, _) => bail!("no remote named '{target}' in the keep"),
    }
}

pub fn list(keep: &Keep, as_json: bool) -> anyhow::Result<String> {
    let remotes = keep.load_remotes()?;
    if as_json {
        let rows: Vec<_> = remotes
            .iter()
            .map(|r| {
                json!({
                    "uid": r.uid,
                    "fuid": r.fuid,
                    "name": r.name,
                    "ha": r.ha.to_string(),
                    "role": r.role,
                    "acceptance": acceptance_label(r.acceptance),
                    "joined": r.joined,
                    "verhex": r.verfer.map(|v| v.hex()),
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&rows)?);
    }
    let rows: Vec<Vec<String>> = remotes
        .iter()
        .map(|r| {
            let verhex = r.verfer.map(|v| v.hex()).unwrap_or_default();
            vec![
                r.uid.to_string(),
                r.name.clone(),
                r.ha.to_string(),
                acceptance_label(r.acceptance).to_string(),
                if r.joined { "yes" } else { "no" }.to_string(),
                verhex.chars().take(16).collect(),
            ]
        })
        .collect();
    Ok(ui::columns(
        &["UID", "NAME", "ADDRESS", "STATUS", "JOINED", "VERKEY"],
        &rows,
    ))
}

pub fn accept(keep: &Keep, target: &str) -> anyhow::Result<RemoteEstate> {
    let mut remote = find_remote(keep, target)?;
    keep.accept_remote(&mut remote)?;
    Ok(remote)
}

pub fn reject(keep: &Keep, target: &str) -> anyhow::Result<RemoteEstate> {
    let mut remote = find_remote(keep, target)?;
    remote.joined = false;
    keep.reject_remote(&mut remote)?;
    keep.dump_remote_road(&remote)?;
    Ok(remote)
}

pub fn delete(keep: &Keep, target: &str) -> anyhow::Result<RemoteEstate> {
    let remote = find_remote(keep, target)?;
    keep.remove_remote(remote.uid)?;
    Ok(remote)
}

/// Run a keys subcommand and report to the terminal.
pub fn cmd_keys(config: &StackConfig, sub: crate::cli::KeysCommands) -> anyhow::Result<()> {
    use crate::cli::KeysCommands;

    let keep = open_keep(config)?;
    match sub {
        KeysCommands::List { json } => {
            let out = list(&keep, json)?;
            if out.lines().count() <= 1 && !json {
                ui::hint("no remotes yet; they appear after a join");
            }
            println!("{out}");
        }
        KeysCommands::Accept { remote } => {
            let r = accept(&keep, &remote)?;
            ui::success(&format!("accepted {} (uid {})", r.name, r.uid));
        }
        KeysCommands::Reject { remote } => {
            let r = reject(&keep, &remote)?;
            ui::success(&format!("rejected {} (uid {})", r.name, r.uid));
        }
        KeysCommands::Delete { remote } => {
            let r = delete(&keep, &remote)?;
            ui::success(&format!("deleted {} (uid {})", r.name, r.uid));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn seeded_keep() -> (tempfile::TempDir, Keep) {
        let tmp = tempfile::tempdir().unwrap();
        let keep = Keep::open(tmp.path()).unwrap();
        for (uid, name, port) in [(2, "minion-1", 7540), (3, "minion-2", 7541)] {
            let remote = RemoteEstate::new(uid, name, SocketAddr::from(([127, 0, 0, 1], port)));
            keep.dump_remote(&remote).unwrap();
        }
        (tmp, keep)
    }

    #[test]
    fn test_find_remote_by_uid_or_name() {
        let (_tmp, keep) = seeded_keep();
        assert_eq!(find_remote(&keep, "3").unwrap().name, "minion-2");
        assert_eq!(find_remote(&keep, "minion-1").unwrap().uid, 2);
        assert!(find_remote(&keep, "nobody").is_err());
    }

    #[test]
    fn test_accept_and_reject_persist() {
        let (_tmp, keep) = seeded_keep();
        accept(&keep, "minion-1").unwrap();
        assert_eq!(
            find_remote(&keep, "2").unwrap().acceptance,
            Acceptance::Accepted
        );
        reject(&keep, "2").unwrap();
        let remote = find_remote(&keep, "minion-1").unwrap();
        assert_eq!(remote.acceptance, Acceptance::Rejected);
        assert!(!remote.joined);
    }

    #[test]
    fn test_delete_removes_remote() {
        let (_tmp, keep) = seeded_keep();
        delete(&keep, "minion-2").unwrap();
        assert_eq!(keep.load_remotes().unwrap().len(), 1);
        assert!(delete(&keep, "minion-2").is_err());
    }

    #[test]
    fn test_list_json() {
        let (_tmp, keep) = seeded_keep();
        let out = list(&keep, true).unwrap();
        let rows: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["name"], "minion-1");
        assert_eq!(rows[0]["acceptance"], "pending");
    }
}
