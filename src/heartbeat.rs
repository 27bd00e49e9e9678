//! The heartbeat engine.
//!
//! Runs only on the raft leader. Each round reconciles the replicated member
//! table with the engine's role assignment, pushes the result to every
//! follower, and commits role + liveness updates in one transaction. The
//! round trigger is either the local interval timer or a `begin_round`
//! request the leader sends itself after membership transitions.
//!
//! Ordering guarantee: follower truststores are rewritten by the fan-out
//! *before* the leader commits the round's role updates, so a truststore
//! never lags the table by more than one interval.
//!
//! Fan-out failures are skip-and-continue: an unreachable peer keeps its old
//! `last_heartbeat` (and will read as OFFLINE once it misses two intervals)
//! but never fails the round.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::daemon::State;
use crate::errors::{Error, Result};
use crate::hooks;
use crate::join::trust_entries;
use crate::members::{max_schema, now_ms, Member, Role};
use crate::raft::{Command, MemberTouch};
use crate::tokens;

/// Payload POSTed to `core/internal/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    /// True when the leader asks itself to start a round; false on the
    /// fan-out payload followers receive.
    #[serde(default)]
    pub begin_round: bool,
    pub cluster_members: Vec<Member>,
    /// Engine role per member address.
    pub raft_roles: BTreeMap<String, Role>,
    pub max_schema_internal: u64,
    pub max_schema_external: u64,
    pub leader_address: String,
}

impl HeartbeatInfo {
    fn begin_round() -> Self {
        Self {
            begin_round: true,
            cluster_members: Vec::new(),
            raft_roles: BTreeMap::new(),
            max_schema_internal: 0,
            max_schema_external: 0,
            leader_address: String::new(),
        }
    }
}

/// Per-node round bookkeeping.
#[derive(Default)]
pub struct RoundState {
    /// Serializes rounds on this node.
    pub running: tokio::sync::Mutex<()>,
    /// Delivery map of the in-flight round: member name → delivery time.
    pub deliveries: std::sync::RwLock<HashMap<String, u64>>,
}

/// Ask the leader (ourselves) to start a round, through the same HTTP path
/// any other trigger uses. Fire-and-forget.
pub fn kick_round(state: &Arc<State>) {
    let state = state.clone();
    tokio::spawn(async move {
        let address = state.address();
        let outcome: Result<serde_json::Value> = state
            .pool
            .request(
                hyper::Method::POST,
                &address,
                "core/internal/heartbeat",
                Some(&HeartbeatInfo::begin_round()),
            )
            .await;
        if let Err(e) = outcome {
            debug!(error = %e, "Heartbeat kick failed");
        }
    });
}

/// Receive half of `core/internal/heartbeat`.
pub async fn handle(state: &Arc<State>, info: HeartbeatInfo) -> Result<()> {
    if info.begin_round {
        if !state.db.is_leader() {
            return Err(Error::NotLeader);
        }
        return run_round(state).await;
    }
    apply_on_follower(state, info).await
}

/// One leader round.
pub async fn run_round(state: &Arc<State>) -> Result<()> {
    let Ok(_running) = state.round.running.try_lock() else {
        debug!("Heartbeat round already in flight");
        return Ok(());
    };

    // Step 1: we must still be the leader.
    if !state.db.is_leader() {
        return Err(Error::NotLeader);
    }

    let interval = state.interval();
    let interval_ms = interval.as_millis() as u64;
    let local_name = state.name();
    let local_address = state.address();

    // Step 2: one consistent view of the table and the schema maxima.
    let snapshot = state.db.snapshot();
    let (max_internal, max_external) = max_schema(&snapshot.members);

    // Step 3: the engine's current role assignment.
    let raft_roles = state.db.roles();
    if snapshot.members.values().all(|m| !m.role.is_assigned()) || raft_roles.is_empty() {
        debug!("Nothing to reconcile; skipping round");
        return Ok(());
    }

    // Step 4: working copy with roles overwritten from the engine.
    let mut working: BTreeMap<String, Member> = BTreeMap::new();
    for member in snapshot.members.values() {
        let mut m = member.clone();
        match raft_roles.get(&m.address) {
            Some(role) => m.role = *role,
            None if m.role == Role::Pending => {
                // Redeemed but not yet admitted; leave it for a later round.
                continue;
            }
            None => {
                // An assigned member the engine has no entry for: a cold
                // restart re-initializes raft from the voter-only membership
                // file, so stand-by and spare learners come back absent.
                // Re-admit at the recorded role — never the capacity-driven
                // role a fresh joiner would get — and skip the member for
                // this round if re-admission fails, like the PENDING case.
                warn!(
                    member = %m.name,
                    role = %m.role.as_str(),
                    "Member missing from raft; re-admitting at its recorded role"
                );
                if let Err(e) = state.db.readd_raft_member(&m.address, m.role).await {
                    warn!(member = %m.name, error = %e, "Re-admission failed; skipping this round");
                    continue;
                }
            }
        }
        working.insert(m.name.clone(), m);
    }

    // Step 5: stampede guard — two triggers in the same interval, one round.
    if let Some(own) = snapshot.members.get(&local_name) {
        if now_ms().saturating_sub(own.last_heartbeat) < interval_ms {
            debug!("Own heartbeat is fresh; aborting duplicate round");
            return Ok(());
        }
    }

    // Step 6: local truststore follows the working copy.
    state.truststore.replace_all(trust_entries(working.values()))?;
    state.refresh_pool()?;

    // Step 7: parallel fan-out to every non-leader member.
    let payload = HeartbeatInfo {
        begin_round: false,
        cluster_members: working.values().cloned().collect(),
        raft_roles: raft_roles.clone(),
        max_schema_internal: max_internal,
        max_schema_external: max_external,
        leader_address: local_address.clone(),
    };
    if let Ok(mut deliveries) = state.round.deliveries.write() {
        deliveries.clear();
    }

    let mut tasks = JoinSet::new();
    for member in working.values() {
        if member.address == local_address {
            continue;
        }
        if now_ms().saturating_sub(member.last_heartbeat) < interval_ms {
            debug!(member = %member.name, "Heartbeat is fresh; skipping");
            continue;
        }
        let recently_delivered = state
            .round
            .deliveries
            .read()
            .ok()
            .and_then(|d| d.get(&member.name).copied())
            .map(|at| now_ms().saturating_sub(at) < interval_ms)
            .unwrap_or(false);
        if recently_delivered {
            continue;
        }

        let state = state.clone();
        let payload = payload.clone();
        let name = member.name.clone();
        let address = member.address.clone();
        tasks.spawn(async move {
            let outcome: Result<serde_json::Value> = state
                .pool
                .request(
                    hyper::Method::POST,
                    &address,
                    "core/internal/heartbeat",
                    Some(&payload),
                )
                .await;
            match outcome {
                Ok(_) => {
                    let at = now_ms();
                    if let Ok(mut deliveries) = state.round.deliveries.write() {
                        deliveries.insert(name.clone(), at);
                    }
                    Some((name, at))
                }
                Err(e) => {
                    warn!(member = %name, error = %e, "Heartbeat delivery failed (continuing)");
                    None
                }
            }
        });
    }

    let mut delivered: BTreeMap<String, u64> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some((name, at))) = joined {
            delivered.insert(name, at);
        }
    }

    // Step 8: one transaction — roles for everyone, timestamps for the
    // reached, the leader's own stamp only after at least one delivery, and
    // the expired-token purge.
    let mut updates: BTreeMap<String, MemberTouch> = BTreeMap::new();
    let mut role_changes: BTreeMap<String, Role> = BTreeMap::new();
    for member in working.values() {
        let old_role = snapshot.members.get(&member.name).map(|m| m.role);
        if old_role != Some(member.role) {
            role_changes.insert(member.name.clone(), member.role);
        }
        updates.insert(
            member.name.clone(),
            MemberTouch {
                role: member.role,
                last_heartbeat: delivered.get(&member.name).copied(),
            },
        );
    }
    if !delivered.is_empty() {
        if let Some(own) = updates.get_mut(&local_name) {
            own.last_heartbeat = Some(now_ms());
        }
    }
    state
        .db
        .commit(vec![
            Command::TouchMembers { updates },
            tokens::purge_expired_command(),
        ])
        .await?;

    info!(
        reached = delivered.len(),
        role_changes = role_changes.len(),
        "Heartbeat round complete"
    );

    // Step 9: the application observes the round.
    hooks::run("on_heartbeat", state.shutdown_rx(), || {
        state.hooks.on_heartbeat(state, &role_changes)
    })
    .await?;
    Ok(())
}

/// Follower receive path.
async fn apply_on_follower(state: &Arc<State>, info: HeartbeatInfo) -> Result<()> {
    if !state.db.is_open() {
        return Err(Error::NotReady);
    }

    // The leader's member list is authoritative for our truststore.
    state
        .truststore
        .replace_all(trust_entries(info.cluster_members.iter()))?;
    state.refresh_pool()?;

    // Schema lag: upgrade in the background; the next round observes
    // progress through our row.
    let local_name = state.name();
    if let Some(own) = state.db.snapshot().members.get(&local_name) {
        if own.schema_internal < info.max_schema_internal
            || own.schema_external < info.max_schema_external
        {
            info!(
                have_internal = own.schema_internal,
                have_external = own.schema_external,
                max_internal = info.max_schema_internal,
                max_external = info.max_schema_external,
                "Schema versions lag the cluster; starting upgrade"
            );
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = state.db.update_schema(&state.name()).await {
                    warn!(error = %e, "Schema upgrade failed");
                }
            });
        }
    }

    debug!(leader = %info.leader_address, "Applied heartbeat");
    Ok(())
}
