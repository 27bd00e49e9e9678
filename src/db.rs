//! Replicated store facade.
//!
//! Thin wrapper over the embedded engine ([`crate::raft::Engine`]): the
//! open/ready gate, transactional command batches, leader and role lookup,
//! and the schema-version pair. Writes from a non-leader are transparently
//! forwarded to the leader's `core/internal/store` endpoint, which is what
//! lets follower-side code compose reads and writes without caring where
//! the leader currently is.
//!
//! The schema-migration engine is a black box here: [`Db::update_schema`]
//! "runs" the migrations embedded in this binary and stamps the local
//! member row with the binary's `(internal, external)` pair.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hyper::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::info;

use crate::client::PeerPool;
use crate::errors::{Error, Result};
use crate::members::Role;
use crate::raft::{Command, Engine, RaftMembersFile, StoreData};
use crate::state_dir::StateDir;

/// Internal schema version compiled into this binary.
pub const SCHEMA_INTERNAL: u64 = 2;
/// External (extension) schema version compiled into this binary.
pub const SCHEMA_EXTERNAL: u64 = 1;

/// Poll interval for ready-waiters.
pub const READY_POLL: Duration = Duration::from_millis(500);

/// How the store is being opened.
pub enum OpenMode {
    /// Fresh single-node cluster; this node becomes the sole voter.
    Bootstrap,
    /// Joining an existing cluster; membership arrives from the leader.
    Join,
    /// Restart of an existing member; re-initialize from the persisted
    /// membership file.
    Restart(RaftMembersFile),
}

/// Shared facade over the replicated store.
pub struct Db {
    engine: RwLock<Option<Engine>>,
    pool: Arc<PeerPool>,
    dir: StateDir,
    ready_tx: watch::Sender<bool>,
}

impl Db {
    pub fn new(dir: StateDir, pool: Arc<PeerPool>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            engine: RwLock::new(None),
            pool,
            dir,
            ready_tx,
        }
    }

    /// Open the store. Idempotence is a conflict: a second open fails.
    pub async fn open(&self, addr: &str, mode: OpenMode) -> Result<()> {
        if self.is_open() {
            return Err(Error::Conflict("store is already open".into()));
        }
        let engine = Engine::open(self.dir.clone(), addr, self.pool.clone()).await?;
        match mode {
            OpenMode::Bootstrap => engine.bootstrap().await?,
            OpenMode::Join => {}
            OpenMode::Restart(file) => engine.reinitialize(&file).await?,
        }
        *self
            .engine
            .write()
            .map_err(|_| Error::Fatal("db lock poisoned".into()))? = Some(engine);
        let _ = self.ready_tx.send(true);
        info!(addr = %addr, "Replicated store open");
        Ok(())
    }

    pub async fn close(&self) {
        let engine = self
            .engine
            .write()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(engine) = engine {
            let _ = self.ready_tx.send(false);
            engine.close().await;
            info!("Replicated store closed");
        }
    }

    fn engine(&self) -> Result<Engine> {
        self.engine
            .read()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(Error::NotReady)
    }

    /// Engine handle for the raft transport endpoints.
    pub(crate) fn raft_engine(&self) -> Result<Engine> {
        self.engine()
    }

    pub fn is_open(&self) -> bool {
        self.engine.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Readiness channel; `true` once the store is open.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Block until the store opens or `limit` elapses.
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.ready();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                // Poll as a backstop; the watch fires promptly on open but a
                // lagging subscriber must still converge.
                let _ = timeout(READY_POLL, rx.changed()).await;
            }
        };
        timeout(limit, wait).await.map_err(|_| Error::NotReady)
    }

    /// Point-in-time copy of the replicated tables.
    pub fn snapshot(&self) -> StoreData {
        self.engine()
            .ok()
            .and_then(|e| e.data().read().ok().map(|d| d.clone()))
            .unwrap_or_default()
    }

    /// Commit a batch of commands as one transaction.
    ///
    /// On the leader this writes to the log directly; on a follower it is
    /// forwarded to the leader's internal store endpoint.
    pub async fn commit(&self, commands: Vec<Command>) -> Result<()> {
        let engine = self.engine()?;
        if engine.is_leader() {
            return engine.write(commands).await;
        }
        let leader = engine.leader_address().ok_or(Error::NotReady)?;
        if leader == engine.addr {
            return engine.write(commands).await;
        }
        let _: serde_json::Value = self
            .pool
            .request(Method::POST, &leader, "core/internal/store", Some(&commands))
            .await?;
        Ok(())
    }

    /// Apply a command batch locally; the receive side of commit forwarding.
    /// Fails with NotLeader if this node lost leadership in flight.
    pub async fn apply_local(&self, commands: Vec<Command>) -> Result<()> {
        let engine = self.engine()?;
        if !engine.is_leader() {
            return Err(Error::NotLeader);
        }
        engine.write(commands).await
    }

    pub fn is_leader(&self) -> bool {
        self.engine().map(|e| e.is_leader()).unwrap_or(false)
    }

    pub fn leader_address(&self) -> Option<String> {
        self.engine().ok().and_then(|e| e.leader_address())
    }

    /// Raft role per member address.
    pub fn roles(&self) -> BTreeMap<String, Role> {
        self.engine().map(|e| e.roles()).unwrap_or_default()
    }

    /// Add a member address to the raft cluster (leader only).
    pub async fn add_raft_member(&self, addr: &str) -> Result<Role> {
        let engine = self.engine()?;
        if !engine.is_leader() {
            return Err(Error::NotLeader);
        }
        engine.add_member(addr).await
    }

    /// Re-admit a known member at its recorded role (leader only). Used by
    /// heartbeat reconciliation when the engine has lost track of an
    /// assigned member.
    pub async fn readd_raft_member(&self, addr: &str, role: Role) -> Result<()> {
        let engine = self.engine()?;
        if !engine.is_leader() {
            return Err(Error::NotLeader);
        }
        engine.readd_member(addr, role).await
    }

    /// Remove a member address from the raft cluster (leader only).
    pub async fn remove_raft_member(&self, addr: &str, force: bool) -> Result<()> {
        let engine = self.engine()?;
        if !engine.is_leader() {
            return Err(Error::NotLeader);
        }
        engine.remove_member(addr, force).await
    }

    /// The schema pair compiled into this binary.
    pub fn schema_pair() -> (u64, u64) {
        (SCHEMA_INTERNAL, SCHEMA_EXTERNAL)
    }

    /// Run the embedded migrations and stamp `name`'s row with this binary's
    /// schema pair.
    pub async fn update_schema(&self, name: &str) -> Result<()> {
        // Migrations themselves are owned by the embedding application; by
        // the time this binary runs, its tables are at the compiled version.
        self.commit(vec![Command::SetSchema {
            name: name.to_string(),
            internal: SCHEMA_INTERNAL,
            external: SCHEMA_EXTERNAL,
        }])
        .await
    }

    /// Execute a statement from the control-socket sql endpoint.
    pub fn execute_sql(&self, query: &str) -> Result<SqlResult> {
        if !self.is_open() {
            return Err(Error::NotReady);
        }
        let q = query.trim().trim_end_matches(';').trim();
        let snapshot = self.snapshot();
        match q {
            ".schema" => Ok(SqlResult::Schema(SCHEMA_DDL.to_string())),
            ".dump" => Ok(SqlResult::Dump(serde_json::to_value(&snapshot)?)),
            _ if q.eq_ignore_ascii_case("select * from cluster_members") => {
                let columns = vec![
                    "name",
                    "address",
                    "certificate",
                    "role",
                    "schema_internal",
                    "schema_external",
                    "api_extensions",
                    "last_heartbeat",
                ]
                .into_iter()
                .map(String::from)
                .collect();
                let rows = snapshot
                    .members
                    .values()
                    .map(|m| {
                        vec![
                            serde_json::json!(m.name),
                            serde_json::json!(m.address),
                            serde_json::json!(m.certificate),
                            serde_json::json!(m.role.as_str()),
                            serde_json::json!(m.schema_internal),
                            serde_json::json!(m.schema_external),
                            serde_json::json!(m.api_extensions),
                            serde_json::json!(m.last_heartbeat),
                        ]
                    })
                    .collect();
                Ok(SqlResult::Rows { columns, rows })
            }
            _ if q.eq_ignore_ascii_case("select * from token_records") => {
                let columns = vec!["secret", "name", "expiry"]
                    .into_iter()
                    .map(String::from)
                    .collect();
                let rows = snapshot
                    .tokens
                    .values()
                    .map(|t| {
                        vec![
                            serde_json::json!(t.secret),
                            serde_json::json!(t.name),
                            serde_json::json!(t.expiry),
                        ]
                    })
                    .collect();
                Ok(SqlResult::Rows { columns, rows })
            }
            _ => Err(Error::Conflict(format!(
                "unsupported statement: {:?}",
                q
            ))),
        }
    }
}

/// Result of a sql endpoint statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SqlResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Schema(String),
    Dump(serde_json::Value),
}

const SCHEMA_DDL: &str = "\
CREATE TABLE cluster_members (
  name TEXT PRIMARY KEY,
  address TEXT NOT NULL UNIQUE,
  certificate TEXT NOT NULL,
  role TEXT NOT NULL,
  schema_internal INTEGER NOT NULL,
  schema_external INTEGER NOT NULL,
  api_extensions TEXT NOT NULL,
  last_heartbeat INTEGER NOT NULL
);
CREATE TABLE token_records (
  secret TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  expiry INTEGER
);
";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn closed_db() -> Db {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        Db::new(dir, Arc::new(PeerPool::new()))
    }

    #[test]
    fn closed_db_is_not_ready() {
        let db = closed_db();
        assert!(!db.is_open());
        assert!(!db.is_leader());
        assert!(db.leader_address().is_none());
        assert!(db.roles().is_empty());
        assert!(matches!(db.execute_sql(".schema"), Err(Error::NotReady)));
    }

    #[test]
    fn snapshot_of_closed_db_is_empty() {
        let db = closed_db();
        let snapshot = db.snapshot();
        assert!(snapshot.members.is_empty());
        assert!(snapshot.tokens.is_empty());
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_closed() {
        let db = closed_db();
        let outcome = db.wait_ready(Duration::from_millis(50)).await;
        assert!(matches!(outcome, Err(Error::NotReady)));
    }

    #[test]
    fn schema_pair_is_the_compiled_one() {
        assert_eq!(Db::schema_pair(), (SCHEMA_INTERNAL, SCHEMA_EXTERNAL));
    }

    #[tokio::test]
    async fn bootstrap_then_sql() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        let db = Db::new(dir, Arc::new(PeerPool::new()));
        db.open("127.0.0.1:9001", OpenMode::Bootstrap).await.unwrap();
        assert!(db.is_open());
        assert!(db.is_leader());
        assert_eq!(db.leader_address().as_deref(), Some("127.0.0.1:9001"));

        match db.execute_sql("SELECT * FROM cluster_members").unwrap() {
            SqlResult::Rows { columns, rows } => {
                assert_eq!(columns[0], "name");
                assert!(rows.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            db.execute_sql("DROP TABLE cluster_members"),
            Err(Error::Conflict(_))
        ));
        db.close().await;
        assert!(!db.is_open());
    }

    #[tokio::test]
    async fn double_open_is_a_conflict() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        let db = Db::new(dir, Arc::new(PeerPool::new()));
        db.open("127.0.0.1:9001", OpenMode::Bootstrap).await.unwrap();
        let second = db.open("127.0.0.1:9001", OpenMode::Bootstrap).await;
        assert!(matches!(second, Err(Error::Conflict(_))));
        db.close().await;
    }

    #[tokio::test]
    async fn readd_keeps_recorded_role() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        let db = Db::new(dir, Arc::new(PeerPool::new()));
        db.open("127.0.0.1:9001", OpenMode::Bootstrap).await.unwrap();

        // A recorded stand-by comes back as a learner, not a voter, even
        // though the voter set is below capacity.
        db.readd_raft_member("127.0.0.1:9002", Role::StandBy)
            .await
            .unwrap();
        // The metrics watch propagates the membership change asynchronously.
        let mut roles = db.roles();
        for _ in 0..40 {
            if roles.contains_key("127.0.0.1:9002") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            roles = db.roles();
        }
        assert_eq!(roles.get("127.0.0.1:9001"), Some(&Role::Voter));
        assert_eq!(roles.get("127.0.0.1:9002"), Some(&Role::StandBy));
        db.close().await;
    }

    #[tokio::test]
    async fn leader_commit_applies() {
        let tmp = tempdir().unwrap();
        let dir = StateDir::create(tmp.path()).unwrap();
        let db = Db::new(dir, Arc::new(PeerPool::new()));
        db.open("127.0.0.1:9001", OpenMode::Bootstrap).await.unwrap();

        let member = crate::members::Member {
            name: "m1".into(),
            address: "127.0.0.1:9001".into(),
            certificate: String::new(),
            role: crate::members::Role::Voter,
            schema_internal: SCHEMA_INTERNAL,
            schema_external: SCHEMA_EXTERNAL,
            api_extensions: vec![],
            last_heartbeat: 0,
        };
        db.commit(vec![Command::InsertMember { member }]).await.unwrap();
        assert_eq!(db.snapshot().members.len(), 1);

        db.update_schema("m1").await.unwrap();
        let m = &db.snapshot().members["m1"];
        assert_eq!(m.schema_internal, SCHEMA_INTERNAL);
        assert_eq!(m.schema_external, SCHEMA_EXTERNAL);
        db.close().await;
    }
}
