//! Embedded replicated store engine.
//!
//! The store is an `openraft` (0.9) state machine holding the replicated
//! tables (`cluster_members`, `token_records`). Mutations are typed
//! [`Command`]s batched into one log entry per logical transaction;
//! preconditions are checked inside `apply_to_state_machine`, so conflicting
//! writers serialize at the log and exactly one observes success.
//!
//! ## Storage
//!
//! In-memory combined `RaftStorage` (v1 API) bridged through
//! `openraft::storage::Adaptor` into the v2 split interface. The state
//! machine is persisted to `database/state.json` after every apply and the
//! membership view to `database/raft_members.yaml` — the file offline
//! recovery edits and startup re-initializes from.
//!
//! ## Transport
//!
//! Raft RPCs are JSON-serialized and POSTed to peers on
//! `core/internal/raft/{append-entries,vote,snapshot}` over the cluster's
//! mTLS listener.
//!
//! ## Roles
//!
//! openraft knows voters and learners; the stand-by/spare split is an
//! engine-side policy: up to [`MAX_VOTERS`] voters, then up to
//! [`MAX_STANDBY`] learners rank as stand-by (ordered by address), the rest
//! are spare.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::{Arc, RwLock};

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, ChangeMembers, Entry, LogId, LogState, Membership, RaftLogId, Snapshot,
    SnapshotMeta, StorageError, StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::client::PeerPool;
use crate::errors::{Error, Result};
use crate::members::{Member, Role};
use crate::state_dir::StateDir;
use crate::tokens::TokenRecord;

/// Maximum voters the engine assigns.
pub const MAX_VOTERS: usize = 3;
/// Maximum learners ranked stand-by.
pub const MAX_STANDBY: usize = 3;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ── Commands and state ────────────────────────────────────────────────────────

/// One typed mutation of the replicated tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Insert a member; fails with a conflict if the name or address exists.
    InsertMember { member: Member },
    /// Overwrite a member row by name.
    UpdateMember { member: Member },
    DeleteMember { name: String },
    /// Heartbeat commit: per-member role + last-heartbeat updates.
    TouchMembers {
        updates: BTreeMap<String, MemberTouch>,
    },
    /// Insert a token record; fails if the secret or name exists.
    InsertToken { record: TokenRecord },
    /// Delete a token by its human label.
    DeleteToken { name: String },
    /// Verify + insert PENDING joiner + consume the record, atomically.
    RedeemToken {
        secret: String,
        joiner: Member,
        now_ms: u64,
    },
    PurgeExpiredTokens { now_ms: u64 },
    /// Stamp a member's schema-version pair.
    SetSchema {
        name: String,
        internal: u64,
        external: u64,
    },
}

/// One member's update inside a [`Command::TouchMembers`] batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberTouch {
    pub role: Role,
    /// `None` keeps the member's existing timestamp (role-only update for a
    /// peer the round could not reach).
    pub last_heartbeat: Option<u64>,
}

/// A log entry: one transaction's worth of commands, applied atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub commands: Vec<Command>,
}

/// State-machine response; `conflict` carries a precondition failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub conflict: Option<String>,
}

/// The replicated tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    /// Keyed by member name.
    pub members: BTreeMap<String, Member>,
    /// Keyed by secret.
    pub tokens: BTreeMap<String, TokenRecord>,
}

/// Check every precondition, then apply. Returns the conflict message on
/// failure, in which case `data` is untouched.
fn apply_commands(data: &mut StoreData, commands: &[Command]) -> std::result::Result<(), String> {
    // Precondition pass over the unmodified state.
    for command in commands {
        match command {
            Command::InsertMember { member } => {
                if data.members.contains_key(&member.name) {
                    return Err(format!("member {:?} already exists", member.name));
                }
                if data.members.values().any(|m| m.address == member.address) {
                    return Err(format!("address {:?} already in use", member.address));
                }
            }
            Command::UpdateMember { member } => {
                if !data.members.contains_key(&member.name) {
                    return Err(format!("no such member {:?}", member.name));
                }
            }
            Command::DeleteMember { name } => {
                if !data.members.contains_key(name) {
                    return Err(format!("no such member {:?}", name));
                }
            }
            Command::InsertToken { record } => {
                if data.tokens.contains_key(&record.secret) {
                    return Err("token secret already exists".into());
                }
                if data.tokens.values().any(|t| t.name == record.name) {
                    return Err(format!("token for {:?} already exists", record.name));
                }
                if data.members.contains_key(&record.name) {
                    return Err(format!("member {:?} already exists", record.name));
                }
            }
            Command::DeleteToken { name } => {
                if !data.tokens.values().any(|t| &t.name == name) {
                    return Err(format!("no token for {:?}", name));
                }
            }
            Command::RedeemToken {
                secret,
                joiner,
                now_ms,
            } => {
                let record = data
                    .tokens
                    .get(secret)
                    .ok_or_else(|| "token does not exist or was already consumed".to_string())?;
                if record.expired(*now_ms) {
                    return Err(format!("token for {:?} has expired", record.name));
                }
                if data.members.contains_key(&joiner.name) {
                    return Err(format!("member {:?} already exists", joiner.name));
                }
                if data.members.values().any(|m| m.address == joiner.address) {
                    return Err(format!("address {:?} already in use", joiner.address));
                }
            }
            Command::TouchMembers { .. }
            | Command::PurgeExpiredTokens { .. }
            | Command::SetSchema { .. } => {}
        }
    }

    for command in commands {
        match command {
            Command::InsertMember { member } | Command::UpdateMember { member } => {
                data.members.insert(member.name.clone(), member.clone());
            }
            Command::DeleteMember { name } => {
                data.members.remove(name);
            }
            Command::TouchMembers { updates } => {
                for (name, touch) in updates {
                    if let Some(m) = data.members.get_mut(name) {
                        m.role = touch.role;
                        if let Some(at) = touch.last_heartbeat {
                            m.last_heartbeat = at;
                        }
                    }
                }
            }
            Command::InsertToken { record } => {
                data.tokens.insert(record.secret.clone(), record.clone());
            }
            Command::DeleteToken { name } => {
                data.tokens.retain(|_, t| &t.name != name);
            }
            Command::RedeemToken { secret, joiner, .. } => {
                data.tokens.remove(secret);
                data.members.insert(joiner.name.clone(), joiner.clone());
            }
            Command::PurgeExpiredTokens { now_ms } => {
                data.tokens.retain(|_, t| !t.expired(*now_ms));
            }
            Command::SetSchema {
                name,
                internal,
                external,
            } => {
                if let Some(m) = data.members.get_mut(name) {
                    m.schema_internal = *internal;
                    m.schema_external = *external;
                }
            }
        }
    }
    Ok(())
}

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Request,
        R            = Response,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node ID from a member address.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── Membership file ───────────────────────────────────────────────────────────

/// One row of `database/raft_members.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftMemberEntry {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub role: Role,
}

/// On-disk raft membership view, consumed by startup and offline recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftMembersFile {
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub members: Vec<RaftMemberEntry>,
}

impl RaftMembersFile {
    pub fn load(dir: &StateDir) -> Result<Option<Self>> {
        let path = dir.raft_members();
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&raw)?))
    }

    pub fn save(&self, dir: &StateDir) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        StateDir::write_atomic(&dir.raft_members(), yaml.as_bytes())
    }
}

/// Project an openraft membership into per-address engine roles.
pub fn membership_roles(membership: &Membership<NodeId, BasicNode>) -> BTreeMap<String, Role> {
    let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
    let mut learners: Vec<(NodeId, String)> = membership
        .nodes()
        .filter(|(id, _)| !voters.contains(*id))
        .map(|(id, node)| (*id, node.addr.clone()))
        .collect();
    learners.sort_by(|a, b| a.1.cmp(&b.1));

    let mut roles = BTreeMap::new();
    for (id, node) in membership.nodes() {
        if voters.contains(id) {
            roles.insert(node.addr.clone(), Role::Voter);
        }
    }
    for (idx, (_, addr)) in learners.into_iter().enumerate() {
        let role = if idx < MAX_STANDBY {
            Role::StandBy
        } else {
            Role::Spare
        };
        roles.insert(addr, role);
    }
    roles
}

fn membership_entries(
    membership: &Membership<NodeId, BasicNode>,
    members: &BTreeMap<String, Member>,
) -> Vec<RaftMemberEntry> {
    let roles = membership_roles(membership);
    membership
        .nodes()
        .map(|(id, node)| {
            let name = members
                .values()
                .find(|m| m.address == node.addr)
                .map(|m| m.name.clone())
                .unwrap_or_default();
            RaftMemberEntry {
                id: *id,
                name,
                address: node.addr.clone(),
                role: roles.get(&node.addr).copied().unwrap_or(Role::Spare),
            }
        })
        .collect()
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Combined in-memory raft storage sharing its state machine with the store
/// facade through `Arc<RwLock<StoreData>>`.
pub struct StoreStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
    data: Arc<RwLock<StoreData>>,
    dir: StateDir,
}

impl StoreStorage {
    /// Create storage, loading any persisted state machine from
    /// `database/state.json`.
    pub fn new(dir: StateDir) -> (Self, Arc<RwLock<StoreData>>) {
        let initial = match std::fs::read(dir.database_state()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable database/state.json");
                StoreData::default()
            }),
            Err(_) => StoreData::default(),
        };
        let data = Arc::new(RwLock::new(initial));
        let storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
            data: data.clone(),
            dir,
        };
        (storage, data)
    }

    /// Best-effort persistence; the replicated log is the source of truth
    /// and a failed write must not wedge consensus.
    fn persist(&self) {
        let data = match self.data.read() {
            Ok(d) => d.clone(),
            Err(_) => return,
        };
        match serde_json::to_vec_pretty(&data) {
            Ok(bytes) => {
                if let Err(e) = StateDir::write_atomic(&self.dir.database_state(), &bytes) {
                    error!(error = %e, "Failed to persist store state");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize store state"),
        }
    }

    fn persist_membership(&self) {
        let members = match self.data.read() {
            Ok(d) => d.members.clone(),
            Err(_) => return,
        };
        let file = RaftMembersFile {
            recovered: false,
            members: membership_entries(self.last_membership.membership(), &members),
        };
        if let Err(e) = file.save(&self.dir) {
            error!(error = %e, "Failed to persist raft membership file");
        }
    }
}

impl RaftLogReader<TypeConfig> for StoreStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a point-in-time copy of the log.
pub struct StoreLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for StoreLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serializes the full table state as JSON.
pub struct StoreSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    data: StoreData,
}

impl RaftSnapshotBuilder<TypeConfig> for StoreSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&self.data).unwrap_or_default();
        let snapshot_id = self
            .last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "empty".to_string());
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStorage<TypeConfig> for StoreStorage {
    type LogReader = StoreLogReader;
    type SnapshotBuilder = StoreSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(
        &mut self,
        vote: &Vote<NodeId>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(
        &mut self,
    ) -> std::result::Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> std::result::Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        StoreLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> std::result::Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> std::result::Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>),
        StorageError<NodeId>,
    > {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> std::result::Result<Vec<Response>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut touched = false;
        let mut membership_changed = false;

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());
            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(Response { conflict: None });
                }
                openraft::EntryPayload::Normal(req) => {
                    let conflict = {
                        let mut data = self
                            .data
                            .write()
                            .map_err(|_| storage_error("store lock poisoned"))?;
                        apply_commands(&mut data, &req.commands).err()
                    };
                    if conflict.is_none() {
                        touched = true;
                    }
                    responses.push(Response { conflict });
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    membership_changed = true;
                    responses.push(Response { conflict: None });
                }
            }
        }

        if touched {
            self.persist();
        }
        if membership_changed || touched {
            self.persist_membership();
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        StoreSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            data: self.data.read().map(|d| d.clone()).unwrap_or_default(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        let incoming: StoreData = serde_json::from_slice(snapshot.get_ref()).unwrap_or_default();
        {
            let mut data = self
                .data
                .write()
                .map_err(|_| storage_error("store lock poisoned"))?;
            *data = incoming;
        }
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.persist();
        self.persist_membership();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

fn storage_error(msg: &str) -> StorageError<NodeId> {
    StorageError::IO {
        source: openraft::StorageIOError::write_state_machine(&AnyError::error(msg.to_string())),
    }
}

// ── HTTP transport ────────────────────────────────────────────────────────────

/// Per-peer raft transport over the cluster's internal endpoints.
pub struct HttpNetwork {
    target_addr: String,
    pool: Arc<PeerPool>,
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        AppendEntriesResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId>>,
    > {
        let body = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .pool
            .post_raft(&self.target_addr, "append-entries", body)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let body = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .pool
            .post_raft(&self.target_addr, "vote", body)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let body = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .pool
            .post_raft(&self.target_addr, "snapshot", body)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates [`HttpNetwork`]s per target peer.
pub struct HttpNetworkFactory {
    pool: Arc<PeerPool>,
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        HttpNetwork {
            target_addr: node.addr.clone(),
            pool: self.pool.clone(),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// A running embedded store engine.
#[derive(Clone)]
pub struct Engine {
    pub raft: Arc<RaftInstance>,
    pub id: NodeId,
    pub addr: String,
    data: Arc<RwLock<StoreData>>,
    dir: StateDir,
}

impl Engine {
    /// Start the raft instance (no cluster membership yet).
    pub async fn open(dir: StateDir, addr: &str, pool: Arc<PeerPool>) -> Result<Self> {
        let id = node_id_from_str(addr);
        let config = Arc::new(
            openraft::Config {
                cluster_name: "microcluster".to_string(),
                heartbeat_interval: 500,
                election_timeout_min: 1_500,
                election_timeout_max: 3_000,
                ..Default::default()
            }
            .validate()
            .map_err(|e| Error::Fatal(format!("invalid raft config: {}", e)))?,
        );

        let (storage, data) = StoreStorage::new(dir.clone());
        let (log_store, state_machine) = Adaptor::new(storage);
        let raft = openraft::Raft::new(
            id,
            config,
            HttpNetworkFactory { pool },
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| Error::Fatal(format!("failed to start raft: {}", e)))?;

        info!(node_id = id, addr = %addr, "Replicated store engine started");
        Ok(Self {
            raft: Arc::new(raft),
            id,
            addr: addr.to_string(),
            data,
            dir,
        })
    }

    /// Shared handle to the state machine tables.
    pub fn data(&self) -> Arc<RwLock<StoreData>> {
        self.data.clone()
    }

    /// Form a fresh single-voter cluster with this node.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.id,
            BasicNode {
                addr: self.addr.clone(),
            },
        );
        self.raft
            .initialize(members)
            .await
            .map_err(|e| Error::Fatal(format!("raft initialize failed: {}", e)))?;
        self.wait_for_leader(Duration::from_secs(30)).await
    }

    /// Re-initialize from the persisted membership file after a restart or
    /// an offline recovery. Entries tagged spare stay out of the voter set.
    pub async fn reinitialize(&self, file: &RaftMembersFile) -> Result<()> {
        let voters: BTreeMap<NodeId, BasicNode> = file
            .members
            .iter()
            .filter(|m| m.role == Role::Voter)
            .map(|m| {
                (
                    m.id,
                    BasicNode {
                        addr: m.address.clone(),
                    },
                )
            })
            .collect();
        if voters.is_empty() {
            return Err(Error::Fatal(
                "membership file contains no voters".into(),
            ));
        }
        if let Err(e) = self.raft.initialize(voters).await {
            // Raft refuses re-initialization of a non-empty log; on a fresh
            // process the log is empty, so this only fires on double open.
            warn!(error = %e, "Raft already initialized");
        }
        Ok(())
    }

    async fn wait_for_leader(&self, limit: Duration) -> Result<()> {
        let mut rx = self.raft.metrics();
        let wait = async {
            loop {
                if rx.borrow().current_leader.is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        timeout(limit, wait)
            .await
            .map_err(|_| Error::NotReady)
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// Address of the current leader, if one is known.
    pub fn leader_address(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let addr = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone());
        addr
    }

    /// Engine role per member address.
    pub fn roles(&self) -> BTreeMap<String, Role> {
        let metrics = self.raft.metrics().borrow().clone();
        membership_roles(metrics.membership_config.membership())
    }

    fn voter_count(&self) -> usize {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .count()
    }

    /// Add `addr` to the raft cluster, returning the role it was assigned.
    pub async fn add_member(&self, addr: &str) -> Result<Role> {
        let id = node_id_from_str(addr);
        let node = BasicNode {
            addr: addr.to_string(),
        };
        timeout(WRITE_TIMEOUT, self.raft.add_learner(id, node, true))
            .await
            .map_err(|_| Error::Transient("timed out adding raft member".into()))?
            .map_err(map_write_err)?;

        if self.voter_count() < MAX_VOTERS {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            timeout(
                WRITE_TIMEOUT,
                self.raft
                    .change_membership(ChangeMembers::AddVoterIds(ids), false),
            )
            .await
            .map_err(|_| Error::Transient("timed out promoting raft member".into()))?
            .map_err(map_write_err)?;
        }

        Ok(self
            .roles()
            .get(addr)
            .copied()
            .unwrap_or(Role::Spare))
    }

    /// Re-admit a previously assigned member at its recorded role.
    ///
    /// Unlike [`Engine::add_member`] this never applies the capacity-driven
    /// voter promotion new joiners get: a recorded voter is promoted back to
    /// voter, everything else comes back as a learner. Non-blocking, so a
    /// still-unreachable member cannot stall the caller for the full write
    /// timeout.
    pub async fn readd_member(&self, addr: &str, role: Role) -> Result<()> {
        let id = node_id_from_str(addr);
        let node = BasicNode {
            addr: addr.to_string(),
        };
        timeout(WRITE_TIMEOUT, self.raft.add_learner(id, node, false))
            .await
            .map_err(|_| Error::Transient("timed out re-adding raft member".into()))?
            .map_err(map_write_err)?;

        if role == Role::Voter {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            timeout(
                WRITE_TIMEOUT,
                self.raft
                    .change_membership(ChangeMembers::AddVoterIds(ids), false),
            )
            .await
            .map_err(|_| Error::Transient("timed out re-promoting raft member".into()))?
            .map_err(map_write_err)?;
        }
        Ok(())
    }

    /// Remove `addr` from the raft cluster.
    ///
    /// Refuses to remove the last voter even when forced; without `force`,
    /// refuses any removal that drops the voter set below quorum.
    pub async fn remove_member(&self, addr: &str, force: bool) -> Result<()> {
        let id = node_id_from_str(addr);
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();

        if voters.contains(&id) {
            let remaining = voters.len() - 1;
            if remaining == 0 {
                return Err(Error::Conflict(
                    "cannot remove the last voter".into(),
                ));
            }
            let quorum = voters.len() / 2 + 1;
            if !force && remaining < quorum {
                return Err(Error::Conflict("would lose quorum".into()));
            }
            let mut ids = BTreeSet::new();
            ids.insert(id);
            timeout(
                WRITE_TIMEOUT,
                self.raft
                    .change_membership(ChangeMembers::RemoveVoters(ids.clone()), false),
            )
            .await
            .map_err(|_| Error::Transient("timed out demoting raft member".into()))?
            .map_err(map_write_err)?;
            timeout(
                WRITE_TIMEOUT,
                self.raft
                    .change_membership(ChangeMembers::RemoveNodes(ids), false),
            )
            .await
            .map_err(|_| Error::Transient("timed out removing raft member".into()))?
            .map_err(map_write_err)?;
        } else if membership.nodes().any(|(nid, _)| *nid == id) {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            timeout(
                WRITE_TIMEOUT,
                self.raft
                    .change_membership(ChangeMembers::RemoveNodes(ids), false),
            )
            .await
            .map_err(|_| Error::Transient("timed out removing raft member".into()))?
            .map_err(map_write_err)?;
        }
        Ok(())
    }

    /// Commit a batch of commands as one log entry.
    pub async fn write(&self, commands: Vec<Command>) -> Result<()> {
        let result = timeout(
            WRITE_TIMEOUT,
            self.raft.client_write(Request { commands }),
        )
        .await
        .map_err(|_| Error::Transient("timed out writing to the store".into()))?;
        let resp = result.map_err(map_write_err)?;
        match resp.data.conflict {
            Some(msg) => Err(Error::Conflict(msg)),
            None => Ok(()),
        }
    }

    /// Shut the raft instance down.
    pub async fn close(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = ?e, "Raft shutdown reported an error");
        }
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.dir
    }
}

fn map_write_err<E: std::fmt::Display>(e: RaftError<NodeId, E>) -> Error {
    match &e {
        RaftError::APIError(inner) => {
            let msg = inner.to_string();
            if msg.contains("forward request to") || msg.contains("has to forward request to") {
                Error::NotLeader
            } else {
                Error::Transient(format!("raft write failed: {}", msg))
            }
        }
        RaftError::Fatal(f) => Error::Fatal(format!("raft fatal: {}", f)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::members::now_ms;

    fn member(name: &str, port: u16, role: Role) -> Member {
        Member {
            name: name.to_string(),
            address: format!("127.0.0.1:{}", port),
            certificate: String::new(),
            role,
            schema_internal: 1,
            schema_external: 1,
            api_extensions: vec![],
            last_heartbeat: 0,
        }
    }

    #[test]
    fn node_id_is_deterministic() {
        assert_eq!(
            node_id_from_str("127.0.0.1:9001"),
            node_id_from_str("127.0.0.1:9001")
        );
        assert_ne!(
            node_id_from_str("127.0.0.1:9001"),
            node_id_from_str("127.0.0.1:9002")
        );
    }

    #[test]
    fn insert_member_conflicts_on_duplicate_name() {
        let mut data = StoreData::default();
        apply_commands(
            &mut data,
            &[Command::InsertMember {
                member: member("m1", 9001, Role::Voter),
            }],
        )
        .unwrap();
        let err = apply_commands(
            &mut data,
            &[Command::InsertMember {
                member: member("m1", 9002, Role::Voter),
            }],
        )
        .unwrap_err();
        assert!(err.contains("already exists"));
        assert_eq!(data.members.len(), 1);
    }

    #[test]
    fn insert_member_conflicts_on_duplicate_address() {
        let mut data = StoreData::default();
        apply_commands(
            &mut data,
            &[Command::InsertMember {
                member: member("m1", 9001, Role::Voter),
            }],
        )
        .unwrap();
        assert!(apply_commands(
            &mut data,
            &[Command::InsertMember {
                member: member("m2", 9001, Role::Voter),
            }],
        )
        .is_err());
    }

    #[test]
    fn batch_is_atomic_on_conflict() {
        let mut data = StoreData::default();
        let err = apply_commands(
            &mut data,
            &[
                Command::InsertMember {
                    member: member("m1", 9001, Role::Voter),
                },
                Command::DeleteMember {
                    name: "ghost".into(),
                },
            ],
        )
        .unwrap_err();
        assert!(err.contains("ghost"));
        // The first command must not have applied.
        assert!(data.members.is_empty());
    }

    #[test]
    fn redeem_consumes_token_once() {
        let mut data = StoreData::default();
        data.tokens.insert(
            "s1".into(),
            TokenRecord {
                secret: "s1".into(),
                name: "m2".into(),
                expiry: None,
            },
        );

        apply_commands(
            &mut data,
            &[Command::RedeemToken {
                secret: "s1".into(),
                joiner: member("m2", 9002, Role::Pending),
                now_ms: now_ms(),
            }],
        )
        .unwrap();
        assert!(data.tokens.is_empty());
        assert_eq!(data.members["m2"].role, Role::Pending);

        // Second redemption of the same secret loses.
        let err = apply_commands(
            &mut data,
            &[Command::RedeemToken {
                secret: "s1".into(),
                joiner: member("m3", 9003, Role::Pending),
                now_ms: now_ms(),
            }],
        )
        .unwrap_err();
        assert!(err.contains("consumed"));
    }

    #[test]
    fn redeem_rejects_expired_token() {
        let mut data = StoreData::default();
        data.tokens.insert(
            "s1".into(),
            TokenRecord {
                secret: "s1".into(),
                name: "m2".into(),
                expiry: Some(1),
            },
        );
        let err = apply_commands(
            &mut data,
            &[Command::RedeemToken {
                secret: "s1".into(),
                joiner: member("m2", 9002, Role::Pending),
                now_ms: now_ms(),
            }],
        )
        .unwrap_err();
        assert!(err.contains("expired"));
        // An expired token is not consumed by a failed redemption; the
        // heartbeat tail purges it.
        assert_eq!(data.tokens.len(), 1);
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut data = StoreData::default();
        data.tokens.insert(
            "old".into(),
            TokenRecord {
                secret: "old".into(),
                name: "a".into(),
                expiry: Some(10),
            },
        );
        data.tokens.insert(
            "new".into(),
            TokenRecord {
                secret: "new".into(),
                name: "b".into(),
                expiry: None,
            },
        );
        apply_commands(&mut data, &[Command::PurgeExpiredTokens { now_ms: 100 }]).unwrap();
        assert_eq!(data.tokens.len(), 1);
        assert!(data.tokens.contains_key("new"));
    }

    #[test]
    fn touch_members_updates_role_and_heartbeat() {
        let mut data = StoreData::default();
        data.members
            .insert("m1".into(), member("m1", 9001, Role::Pending));
        let mut updates = BTreeMap::new();
        updates.insert(
            "m1".to_string(),
            MemberTouch {
                role: Role::Voter,
                last_heartbeat: Some(42),
            },
        );
        apply_commands(&mut data, &[Command::TouchMembers { updates }]).unwrap();
        assert_eq!(data.members["m1"].role, Role::Voter);
        assert_eq!(data.members["m1"].last_heartbeat, 42);

        // A role-only touch keeps the timestamp.
        let mut updates = BTreeMap::new();
        updates.insert(
            "m1".to_string(),
            MemberTouch {
                role: Role::StandBy,
                last_heartbeat: None,
            },
        );
        apply_commands(&mut data, &[Command::TouchMembers { updates }]).unwrap();
        assert_eq!(data.members["m1"].role, Role::StandBy);
        assert_eq!(data.members["m1"].last_heartbeat, 42);
    }

    #[test]
    fn token_name_collides_with_member() {
        let mut data = StoreData::default();
        data.members
            .insert("m1".into(), member("m1", 9001, Role::Voter));
        assert!(apply_commands(
            &mut data,
            &[Command::InsertToken {
                record: TokenRecord {
                    secret: "s".into(),
                    name: "m1".into(),
                    expiry: None,
                },
            }],
        )
        .is_err());
    }

    #[test]
    fn membership_roles_policy() {
        let mut nodes = BTreeMap::new();
        let mk = |addr: &str| (node_id_from_str(addr), BasicNode { addr: addr.into() });
        let voters: Vec<(u64, BasicNode)> = vec![mk("10.0.0.1:1"), mk("10.0.0.2:1"), mk("10.0.0.3:1")];
        let learners: Vec<(u64, BasicNode)> = vec![
            mk("10.0.0.4:1"),
            mk("10.0.0.5:1"),
            mk("10.0.0.6:1"),
            mk("10.0.0.7:1"),
        ];
        for (id, n) in voters.iter().chain(learners.iter()) {
            nodes.insert(*id, n.clone());
        }
        let voter_ids: BTreeSet<u64> = voters.iter().map(|(id, _)| *id).collect();
        let membership = Membership::<u64, BasicNode>::new(vec![voter_ids], nodes);

        let roles = membership_roles(&membership);
        assert_eq!(roles["10.0.0.1:1"], Role::Voter);
        assert_eq!(roles["10.0.0.2:1"], Role::Voter);
        assert_eq!(roles["10.0.0.3:1"], Role::Voter);
        assert_eq!(roles["10.0.0.4:1"], Role::StandBy);
        assert_eq!(roles["10.0.0.5:1"], Role::StandBy);
        assert_eq!(roles["10.0.0.6:1"], Role::StandBy);
        assert_eq!(roles["10.0.0.7:1"], Role::Spare);
    }

    #[test]
    fn members_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        let file = RaftMembersFile {
            recovered: false,
            members: vec![RaftMemberEntry {
                id: 7,
                name: "m1".into(),
                address: "127.0.0.1:9001".into(),
                role: Role::Voter,
            }],
        };
        file.save(&dir).unwrap();
        let loaded = RaftMembersFile::load(&dir).unwrap().unwrap();
        assert_eq!(loaded.members, file.members);
        assert!(!loaded.recovered);
    }
}
