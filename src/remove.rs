//! Member removal and quorum-loss recovery.
//!
//! Graceful removal runs on the leader (the request plane forwards it
//! there): the departing member gets a `pre_remove` RPC, the engine drops
//! its address from raft (refusing quorum-breaking removals unless forced,
//! and the last voter always), its row is deleted, and every remaining
//! member runs `post_remove`.
//!
//! Offline recovery rewrites the raft membership file from an
//! operator-edited view and packs `recovery.tar.gz` for out-of-band
//! distribution; the next startup on each member detects the tarball and
//! loads it before opening the store.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use crate::daemon::State;
use crate::errors::{Error, Result};
use crate::hooks;
use crate::join::trust_entries;
use crate::members::Role;
use crate::raft::{Command, RaftMemberEntry, RaftMembersFile};
use crate::state_dir::StateDir;

/// Body of the internal hooks RPC.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HookRequest {
    #[serde(default)]
    pub force: bool,
}

/// Remove `name` from the cluster. Runs on the leader.
pub async fn handle_remove(state: &Arc<State>, name: &str, force: bool) -> Result<()> {
    if !state.db.is_open() {
        return Err(Error::NotReady);
    }
    let _guard = state
        .ops_lock
        .try_lock()
        .map_err(|_| Error::Conflict("another cluster operation is in progress".into()))?;

    let snapshot = state.db.snapshot();
    let target = snapshot
        .members
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Conflict(format!("no such member {:?}", name)))?;
    let local_name = state.name();

    info!(member = %name, force = force, "Removing cluster member");

    // Step 1: pre_remove on the departing member.
    if target.name == local_name {
        hooks::run("pre_remove", state.shutdown_rx(), || {
            state.hooks.pre_remove(state, force)
        })
        .await?;
    } else {
        let outcome: Result<serde_json::Value> = state
            .pool
            .request(
                hyper::Method::POST,
                &target.address,
                "core/internal/hooks/pre-remove",
                Some(&HookRequest { force }),
            )
            .await;
        match outcome {
            Ok(_) => {}
            Err(e) if force => {
                warn!(member = %name, error = %e, "pre_remove unreachable; forced removal continues");
            }
            Err(_) => {
                return Err(Error::Transient(format!(
                    "target {:?} unreachable; re-run with force to skip its pre-remove hook",
                    name
                )));
            }
        }
    }

    // Step 2: drop the address from raft. Quorum and last-voter rules are
    // enforced by the engine.
    if target.role.is_assigned() {
        state.db.remove_raft_member(&target.address, force).await?;
    }

    // Step 3: delete the row. If we just removed ourselves from the voter
    // set this commit forwards to the new leader.
    state
        .db
        .commit(vec![Command::DeleteMember {
            name: target.name.clone(),
        }])
        .await?;

    // Our truststore follows immediately; followers converge on the next
    // heartbeat or the post_remove fan-out below.
    state
        .truststore
        .replace_all(trust_entries(state.db.snapshot().members.values()))?;
    state.refresh_pool()?;

    // Step 4: post_remove everywhere that remains.
    let remaining: Vec<_> = state
        .db
        .snapshot()
        .members
        .values()
        .filter(|m| m.role.is_assigned() && m.name != local_name)
        .cloned()
        .collect();
    for member in remaining {
        let pool = state.pool.clone();
        let address = member.address.clone();
        hooks::run_remote("post_remove", &member.name, state.shutdown_rx(), || async move {
            let _: serde_json::Value = pool
                .request(
                    hyper::Method::POST,
                    &address,
                    "core/internal/hooks/post-remove",
                    Some(&HookRequest { force }),
                )
                .await?;
            Ok(())
        })
        .await;
    }
    if target.name != local_name {
        hooks::run("post_remove", state.shutdown_rx(), || {
            state.hooks.post_remove(state, force)
        })
        .await?;
    }

    info!(member = %name, "Member removed");
    Ok(())
}

// ── Offline recovery ──────────────────────────────────────────────────────────

/// Validate an operator-edited membership view against the current one:
/// same entry count, same IDs, same names and addresses — only roles may
/// change, and at least one entry must remain a voter.
pub fn validate_recovery(
    current: &[RaftMemberEntry],
    edited: &[RaftMemberEntry],
) -> Result<()> {
    if current.len() != edited.len() {
        return Err(Error::Conflict(format!(
            "edited view has {} entries, expected {}",
            edited.len(),
            current.len()
        )));
    }
    let by_id: BTreeMap<u64, &RaftMemberEntry> = current.iter().map(|m| (m.id, m)).collect();
    for entry in edited {
        let original = by_id.get(&entry.id).ok_or_else(|| {
            Error::Conflict(format!("entry {} is not part of the cluster", entry.id))
        })?;
        if original.name != entry.name {
            return Err(Error::Conflict(format!(
                "member name of {} may not change",
                entry.id
            )));
        }
        if original.address != entry.address {
            return Err(Error::Conflict(format!(
                "member address of {} may not change",
                entry.id
            )));
        }
    }
    if !edited.iter().any(|m| m.role == Role::Voter) {
        return Err(Error::Conflict(
            "edited view must keep at least one voter".into(),
        ));
    }
    Ok(())
}

/// Rewrite the membership file from `edited` and pack the recovery tarball.
///
/// Offline only: the daemon must be stopped. Returns the tarball path the
/// operator distributes to the remaining members.
pub fn recover(dir: &StateDir, edited: Vec<RaftMemberEntry>) -> Result<PathBuf> {
    let current = RaftMembersFile::load(dir)?
        .ok_or_else(|| Error::Fatal("no raft membership file to recover from".into()))?;
    validate_recovery(&current.members, &edited)?;

    let file = RaftMembersFile {
        recovered: true,
        members: edited,
    };
    file.save(dir)?;

    let tarball = dir.recovery_tarball();
    let out = File::create(&tarball)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.append_path_with_name(dir.raft_members(), "raft_members.yaml")?;
    archive.append_path_with_name(dir.cluster_cert(), "cluster.crt")?;
    archive.append_path_with_name(dir.cluster_key(), "cluster.key")?;
    if dir.database_state().is_file() {
        archive.append_path_with_name(dir.database_state(), "state.json")?;
    }
    archive
        .into_inner()
        .and_then(|encoder| encoder.finish())?
        .sync_all()?;

    info!(tarball = %tarball.display(), "Recovery tarball written");
    Ok(tarball)
}

/// Detect and load a recovery tarball left by the operator. Called before
/// the store opens; consumes the tarball.
pub fn apply_pending_recovery(dir: &StateDir) -> Result<()> {
    let tarball = dir.recovery_tarball();
    if !tarball.is_file() {
        return Ok(());
    }
    info!(tarball = %tarball.display(), "Loading recovery tarball");

    let decoder = GzDecoder::new(File::open(&tarball)?);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        let target = match path.to_str() {
            Some("raft_members.yaml") => dir.raft_members(),
            Some("cluster.crt") => dir.cluster_cert(),
            Some("cluster.key") => dir.cluster_key(),
            Some("state.json") => dir.database_state(),
            other => {
                warn!(entry = ?other, "Ignoring unexpected recovery entry");
                continue;
            }
        };
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents)?;
        if target == dir.cluster_key() {
            StateDir::write_sensitive(&target, &contents)?;
        } else {
            StateDir::write_atomic(&target, &contents)?;
        }
    }
    std::fs::remove_file(&tarball)?;
    info!("Recovery state loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: u64, name: &str, role: Role) -> RaftMemberEntry {
        RaftMemberEntry {
            id,
            name: name.to_string(),
            address: format!("127.0.0.1:{}", 9000 + id),
            role,
        }
    }

    #[test]
    fn recovery_accepts_role_only_changes() {
        let current = vec![entry(1, "a", Role::Voter), entry(2, "b", Role::Voter)];
        let edited = vec![entry(1, "a", Role::Voter), entry(2, "b", Role::Spare)];
        validate_recovery(&current, &edited).unwrap();
    }

    #[test]
    fn recovery_rejects_entry_count_change() {
        let current = vec![entry(1, "a", Role::Voter), entry(2, "b", Role::Voter)];
        let edited = vec![entry(1, "a", Role::Voter)];
        assert!(validate_recovery(&current, &edited).is_err());
    }

    #[test]
    fn recovery_rejects_renames_and_readdressing() {
        let current = vec![entry(1, "a", Role::Voter)];
        let mut renamed = vec![entry(1, "a", Role::Voter)];
        renamed[0].name = "z".into();
        assert!(validate_recovery(&current, &renamed).is_err());

        let mut moved = vec![entry(1, "a", Role::Voter)];
        moved[0].address = "10.0.0.1:9001".into();
        assert!(validate_recovery(&current, &moved).is_err());
    }

    #[test]
    fn recovery_rejects_unknown_ids() {
        let current = vec![entry(1, "a", Role::Voter)];
        let edited = vec![entry(9, "a", Role::Voter)];
        assert!(validate_recovery(&current, &edited).is_err());
    }

    #[test]
    fn recovery_requires_a_voter() {
        let current = vec![entry(1, "a", Role::Voter), entry(2, "b", Role::Voter)];
        let edited = vec![entry(1, "a", Role::Spare), entry(2, "b", Role::Spare)];
        assert!(validate_recovery(&current, &edited).is_err());
    }

    #[test]
    fn recover_roundtrips_through_tarball() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path().join("node1")).unwrap();

        // Seed the files the tarball carries.
        let members = vec![entry(1, "a", Role::Voter), entry(2, "b", Role::Voter)];
        RaftMembersFile {
            recovered: false,
            members: members.clone(),
        }
        .save(&dir)
        .unwrap();
        StateDir::write_atomic(&dir.cluster_cert(), b"CERT").unwrap();
        StateDir::write_sensitive(&dir.cluster_key(), b"KEY").unwrap();
        StateDir::write_atomic(&dir.database_state(), b"{}").unwrap();

        let mut edited = members;
        edited[1].role = Role::Spare;
        let tarball = recover(&dir, edited.clone()).unwrap();
        assert!(tarball.is_file());

        // A second node loads the tarball before opening its store.
        let dir2 = StateDir::create(tmp.path().join("node2")).unwrap();
        std::fs::copy(&tarball, dir2.recovery_tarball()).unwrap();
        apply_pending_recovery(&dir2).unwrap();

        let loaded = RaftMembersFile::load(&dir2).unwrap().unwrap();
        assert!(loaded.recovered);
        assert_eq!(loaded.members, edited);
        assert_eq!(std::fs::read(dir2.cluster_cert()).unwrap(), b"CERT");
        assert_eq!(std::fs::read(dir2.cluster_key()).unwrap(), b"KEY");
        assert!(!dir2.recovery_tarball().exists());
    }

    #[test]
    fn apply_without_tarball_is_a_noop() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        apply_pending_recovery(&dir).unwrap();
    }
}
