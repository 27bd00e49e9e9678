//! `microclusterd` — the cluster daemon.
//!
//! Usage:
//!
//! ```text
//! microclusterd <state_dir>                     # run the daemon
//! microclusterd <state_dir> --recover <view>    # offline quorum-loss recovery
//! ```
//!
//! The recovery view is a YAML list of `{id, name, address, role}` entries;
//! only the role column may differ from the current membership file. The
//! command writes `recovery.tar.gz` for out-of-band distribution to the
//! remaining members and exits.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use microcluster::daemon::Daemon;
use microcluster::hooks::NoopHooks;
use microcluster::raft::RaftMemberEntry;
use microcluster::state_dir::StateDir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let state_dir = args
        .get(1)
        .cloned()
        .or_else(|| std::env::var("MICROCLUSTER_STATE_DIR").ok())
        .ok_or("usage: microclusterd <state_dir> [--recover <view.yaml>]")?;

    if let Some(flag) = args.get(2) {
        if flag != "--recover" {
            return Err(format!("unknown flag {:?}", flag).into());
        }
        let view_path = args.get(3).ok_or("--recover requires a view file")?;
        let dir = StateDir::create(&state_dir)?;
        let raw = std::fs::read_to_string(view_path)?;
        let edited: Vec<RaftMemberEntry> = serde_yaml::from_str(&raw)?;
        let tarball = microcluster::remove::recover(&dir, edited)?;
        println!("{}", tarball.display());
        return Ok(());
    }

    info!(state_dir = %state_dir, version = env!("CARGO_PKG_VERSION"), "Starting microclusterd");
    let daemon = Daemon::new(&state_dir, Arc::new(NoopHooks), Vec::new())?;
    daemon.run().await?;
    Ok(())
}
