//! Daemon supervisor: wiring, startup/shutdown orchestration, and the
//! shared state handle.
//!
//! Boot order: filesystem layout → TLS identity → truststore → store facade
//! → request plane → listeners → heartbeat task. A fresh daemon (no
//! `daemon.yaml`) starts only the control socket and waits for a bootstrap
//! or join request; an initialized one re-opens the replicated store and
//! brings the cluster listeners up immediately.
//!
//! Shutdown is a single idempotent sequence triggered by
//! SIGINT/SIGTERM/SIGQUIT/SIGPWR or the control-socket shutdown endpoint:
//! stop accepting requests → grace period for in-flight work → close
//! listeners → close the replicated store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use crate::client::PeerPool;
use crate::config::DaemonConfig;
use crate::db::{Db, OpenMode};
use crate::endpoints::Registry;
use crate::errors::{Error, Result};
use crate::heartbeat;
use crate::hooks::Hooks;
use crate::members::MemberInfo;
use crate::raft::RaftMembersFile;
use crate::state_dir::StateDir;
use crate::tls::{self, KeyPairPem};
use crate::truststore::Truststore;

/// Grace period between closing listeners and closing the store.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Shared daemon state, cheap to clone via `Arc`.
pub struct State {
    pub dir: StateDir,
    pub config: RwLock<Option<DaemonConfig>>,
    pub truststore: Truststore,
    pub db: Db,
    pub pool: Arc<PeerPool>,
    pub hooks: Arc<dyn Hooks>,
    /// This member's server keypair; set once the node has an identity.
    pub server_keypair: RwLock<Option<KeyPairPem>>,
    /// The shared cluster keypair; set at bootstrap or join.
    pub cluster_keypair: RwLock<Option<KeyPairPem>>,
    /// Keypairs for additional named listeners.
    pub extra_keypairs: RwLock<BTreeMap<String, KeyPairPem>>,
    /// API extensions this binary advertises.
    pub extensions: Vec<String>,
    /// Control-plane singleton: bootstrap, join, and remove are mutually
    /// exclusive on one node.
    pub ops_lock: tokio::sync::Mutex<()>,
    pub shutdown_tx: watch::Sender<bool>,
    /// Heartbeat round bookkeeping.
    pub round: heartbeat::RoundState,
    /// The endpoint registry, installed by [`Daemon::new`]; handlers use it
    /// to bring cluster listeners up after bootstrap or join.
    registry: RwLock<Option<Arc<Registry>>>,
    shutting_down: AtomicBool,
}

impl State {
    /// This member's name; empty until bootstrapped or joined.
    pub fn name(&self) -> String {
        self.config
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.name.clone()))
            .unwrap_or_default()
    }

    /// This member's cluster address; empty until bootstrapped or joined.
    pub fn address(&self) -> String {
        self.config
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.address.clone()))
            .unwrap_or_default()
    }

    pub fn interval(&self) -> Duration {
        self.config
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.interval()))
            .unwrap_or(crate::config::DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub fn is_initialized(&self) -> bool {
        self.config.read().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn set_config(&self, config: DaemonConfig) -> Result<()> {
        config.save(&self.dir)?;
        *self
            .config
            .write()
            .map_err(|_| Error::Fatal("config lock poisoned".into()))? = Some(config);
        Ok(())
    }

    pub fn server_keypair(&self) -> Result<KeyPairPem> {
        self.server_keypair
            .read()
            .ok()
            .and_then(|k| k.clone())
            .ok_or_else(|| Error::Fatal("server keypair not initialized".into()))
    }

    pub fn cluster_keypair(&self) -> Result<KeyPairPem> {
        self.cluster_keypair
            .read()
            .ok()
            .and_then(|k| k.clone())
            .ok_or_else(|| Error::Fatal("cluster keypair not initialized".into()))
    }

    /// SHA-256 fingerprint of the cluster certificate.
    pub fn fingerprint(&self) -> Result<String> {
        tls::fingerprint_pem(&self.cluster_keypair()?.cert)
    }

    /// Rebuild the peer client pool from the current identity and
    /// truststore. Called after every credential or truststore change.
    pub fn refresh_pool(&self) -> Result<()> {
        let identity = self.server_keypair()?;
        let mut trusted = self.truststore.trusted_certs();
        if let Ok(cluster) = self.cluster_keypair() {
            trusted.append(&mut tls::certs_from_pem(&cluster.cert)?);
        }
        self.pool
            .configure(identity, trusted, &self.name(), &self.address())
    }

    /// Wire view of the replicated member table.
    pub fn members_info(&self) -> Vec<MemberInfo> {
        let interval = self.interval();
        let local = self.name();
        self.db
            .snapshot()
            .members
            .values()
            .map(|m| MemberInfo::new(m, interval, &local))
            .collect()
    }

    pub fn registry(&self) -> Result<Arc<Registry>> {
        self.registry
            .read()
            .ok()
            .and_then(|r| r.clone())
            .ok_or_else(|| Error::Fatal("registry not installed".into()))
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Persist a keypair under its state-directory paths.
    pub fn save_keypair(&self, kp: &KeyPairPem, cert: &PathBuf, key: &PathBuf) -> Result<()> {
        StateDir::write_atomic(cert, kp.cert.as_bytes())?;
        StateDir::write_sensitive(key, kp.key.as_bytes())
    }
}

fn load_keypair(cert: &PathBuf, key: &PathBuf) -> Result<Option<KeyPairPem>> {
    if cert.is_file() && key.is_file() {
        Ok(Some(KeyPairPem {
            cert: std::fs::read_to_string(cert)?,
            key: std::fs::read_to_string(key)?,
        }))
    } else {
        Ok(None)
    }
}

/// The daemon: shared state plus the endpoint registry.
pub struct Daemon {
    pub state: Arc<State>,
    pub registry: Arc<Registry>,
}

impl Daemon {
    /// Wire up a daemon rooted at `state_dir`. No listeners start here.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        hooks: Arc<dyn Hooks>,
        extensions: Vec<String>,
    ) -> Result<Self> {
        Self::with_endpoints(state_dir, hooks, extensions, Vec::new())
    }

    /// Like [`Daemon::new`], registering embedder-supplied extended
    /// endpoints on top of the built-in surface.
    pub fn with_endpoints(
        state_dir: impl Into<PathBuf>,
        hooks: Arc<dyn Hooks>,
        extensions: Vec<String>,
        extra_endpoints: Vec<crate::endpoints::Endpoint>,
    ) -> Result<Self> {
        tls::ensure_crypto_provider();
        let dir = StateDir::create(state_dir)?;
        let config = crate::config::load_if_initialized(&dir)?;
        let truststore = Truststore::load(&dir)?;
        let pool = Arc::new(PeerPool::new());
        let db = Db::new(dir.clone(), pool.clone());
        let (shutdown_tx, _) = watch::channel(false);

        let server_keypair = load_keypair(&dir.server_cert(), &dir.server_key())?;
        let cluster_keypair = load_keypair(&dir.cluster_cert(), &dir.cluster_key())?;
        let mut extra_keypairs = BTreeMap::new();
        if let Some(config) = &config {
            for name in config.servers.keys() {
                if let Some(kp) = load_keypair(&dir.listener_cert(name), &dir.listener_key(name))? {
                    extra_keypairs.insert(name.clone(), kp);
                }
            }
        }

        let state = Arc::new(State {
            dir,
            config: RwLock::new(config),
            truststore,
            db,
            pool,
            hooks,
            server_keypair: RwLock::new(server_keypair),
            cluster_keypair: RwLock::new(cluster_keypair),
            extra_keypairs: RwLock::new(extra_keypairs),
            extensions,
            ops_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            round: heartbeat::RoundState::default(),
            registry: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let mut built = crate::api::build_registry();
        for endpoint in extra_endpoints {
            built.register(endpoint);
        }
        let registry = Arc::new(built);
        *state
            .registry
            .write()
            .map_err(|_| Error::Fatal("registry lock poisoned".into()))? = Some(registry.clone());
        Ok(Self { state, registry })
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        crate::remove::apply_pending_recovery(&self.state.dir)?;

        crate::server::serve_control(self.state.clone(), self.registry.clone()).await?;

        if self.state.is_initialized() {
            self.start_existing().await?;
        } else {
            info!("Daemon is uninitialized; waiting for bootstrap or join on the control socket");
        }

        self.wait_for_shutdown().await;
        self.shutdown().await;
        Ok(())
    }

    /// Restart path for a node that is already a cluster member.
    async fn start_existing(&self) -> Result<()> {
        let address = self.state.address();
        if self.state.server_keypair().is_err() {
            return Err(Error::Fatal(
                "daemon.yaml exists but the server keypair is missing".into(),
            ));
        }
        self.state.refresh_pool()?;

        let mode = match RaftMembersFile::load(&self.state.dir)? {
            Some(file) if !file.members.is_empty() => OpenMode::Restart(file),
            // A joiner that crashed before raft admission has no membership
            // view yet; open passively and wait for the leader to reach us.
            _ => OpenMode::Join,
        };
        self.state.db.open(&address, mode).await?;

        start_cluster_services(&self.state).await?;
        crate::hooks::run("on_start", self.state.shutdown_rx(), || {
            self.state.hooks.on_start(&self.state)
        })
        .await?;
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.state.shutdown_rx();
        let mut sigint = expect_signal(SignalKind::interrupt());
        let mut sigterm = expect_signal(SignalKind::terminate());
        let mut sigquit = expect_signal(SignalKind::quit());
        let mut sigpwr = expect_signal(SignalKind::from_raw(libc::SIGPWR));

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
            _ = sigpwr.recv() => info!("Received SIGPWR"),
            _ = shutdown_rx.changed() => info!("Shutdown requested via control socket"),
        }
    }

    /// The idempotent shutdown sequence.
    pub async fn shutdown(&self) {
        if self.state.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down");
        // Stop accepting new requests; in-flight handlers get a grace period.
        self.state.trigger_shutdown();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        self.state.db.close().await;
        let _ = std::fs::remove_file(self.state.dir.control_socket());
        info!("Shutdown complete");
    }
}

fn expect_signal(kind: SignalKind) -> tokio::signal::unix::Signal {
    signal(kind).expect("failed to install signal handler")
}

/// Bring up the cluster TLS listeners and the heartbeat task.
///
/// Called on the restart path and at the end of bootstrap/join.
pub async fn start_cluster_services(state: &Arc<State>) -> Result<()> {
    let registry = state.registry()?;
    crate::server::serve_cluster(state.clone(), registry).await?;
    spawn_heartbeat_task(state.clone());
    Ok(())
}

fn spawn_heartbeat_task(state: Arc<State>) {
    let mut shutdown_rx = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            let interval = state.interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
            if !state.db.is_open() || !state.db.is_leader() {
                continue;
            }
            if let Err(e) = heartbeat::run_round(&state).await {
                match e {
                    Error::NotLeader | Error::Conflict(_) => {
                        // Lost leadership mid-round or a parallel round ran;
                        // both are normal.
                    }
                    e => error!(error = %e, "Heartbeat round failed"),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;
    use tempfile::tempdir;

    #[test]
    fn fresh_daemon_is_uninitialized() {
        let tmp = tempdir().unwrap();
        let daemon = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        assert!(!daemon.state.is_initialized());
        assert!(daemon.state.name().is_empty());
        assert!(daemon.state.server_keypair().is_err());
        assert!(daemon.state.fingerprint().is_err());
    }

    #[test]
    fn config_roundtrips_through_state() {
        let tmp = tempdir().unwrap();
        let daemon = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        daemon
            .state
            .set_config(DaemonConfig::new("member1", "127.0.0.1:9001"))
            .unwrap();
        assert!(daemon.state.is_initialized());
        assert_eq!(daemon.state.name(), "member1");
        assert_eq!(daemon.state.address(), "127.0.0.1:9001");

        // A second daemon over the same directory sees the saved config.
        let daemon2 = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        assert_eq!(daemon2.state.name(), "member1");
    }

    #[test]
    fn keypairs_reload_from_disk() {
        let tmp = tempdir().unwrap();
        let daemon = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        let kp = tls::generate_server_keypair("member1").unwrap();
        daemon
            .state
            .save_keypair(
                &kp,
                &daemon.state.dir.server_cert(),
                &daemon.state.dir.server_key(),
            )
            .unwrap();

        let daemon2 = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        assert_eq!(daemon2.state.server_keypair().unwrap(), kp);
    }

    #[test]
    fn trigger_shutdown_fires_watch() {
        let tmp = tempdir().unwrap();
        let daemon = Daemon::new(tmp.path(), Arc::new(NoopHooks), vec![]).unwrap();
        let rx = daemon.state.shutdown_rx();
        daemon.state.trigger_shutdown();
        assert!(*rx.borrow());
    }
}
