//! Lifecycle hooks supplied by the embedding application.
//!
//! Hooks run sequentially with respect to the lifecycle event that triggered
//! them; a hook error aborts the triggering operation and is surfaced to the
//! caller. Hooks on remote peers (`on_new_member`, `post_remove`) are invoked
//! over internal endpoints and their failures are logged but do not abort the
//! cluster-wide operation.
//!
//! Hook context is cancellable: [`run`] and [`run_remote`] race the hook
//! future against a cancellation watch (the daemon's shutdown channel at
//! every call site), so a hanging hook cannot wedge the control socket, the
//! heartbeat round, or shutdown itself. A hook that wants to unwind cleanly
//! rather than be abandoned should subscribe via [`State::shutdown_rx`] and
//! observe the signal promptly.
//!
//! The state handle is read-only by convention: a hook that wants to mutate
//! the store must go back through the public control plane, otherwise it can
//! deadlock with the transaction that invoked it.
//!
//! [`State::shutdown_rx`]: crate::daemon::State::shutdown_rx

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::DaemonConfig;
use crate::daemon::State;
use crate::errors::{Error, Result};
use crate::members::Role;

/// Named lifecycle callbacks. All default to no-ops.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// On the bootstrapping node, after its own row exists but before the
    /// TLS listener opens. `init_config` is the operator-provided map from
    /// the control request.
    async fn pre_bootstrap(
        &self,
        _state: &State,
        _init_config: &BTreeMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    /// After the bootstrapping node is listening.
    async fn post_bootstrap(&self, _state: &State) -> Result<()> {
        Ok(())
    }

    /// On every daemon start, before listeners open.
    async fn on_start(&self, _state: &State) -> Result<()> {
        Ok(())
    }

    /// On the joiner, after credentials are persisted but before the
    /// cluster-wide member fan-out.
    async fn pre_join(&self, _state: &State) -> Result<()> {
        Ok(())
    }

    /// On the joiner, after the fan-out completed.
    async fn post_join(&self, _state: &State) -> Result<()> {
        Ok(())
    }

    /// On the departing member, before removal proceeds.
    async fn pre_remove(&self, _state: &State, _force: bool) -> Result<()> {
        Ok(())
    }

    /// On every remaining member, after a removal.
    async fn post_remove(&self, _state: &State, _force: bool) -> Result<()> {
        Ok(())
    }

    /// On every existing member when a new member joins.
    async fn on_new_member(&self, _state: &State, _member: &str) -> Result<()> {
        Ok(())
    }

    /// On the leader at the end of each heartbeat round, with the members
    /// whose role changed in this round.
    async fn on_heartbeat(&self, _state: &State, _role_changes: &BTreeMap<String, Role>) -> Result<()> {
        Ok(())
    }

    /// On explicit daemon-config update RPCs.
    async fn on_daemon_config_update(&self, _state: &State, _config: &DaemonConfig) -> Result<()> {
        Ok(())
    }
}

/// The default hook set: everything is a no-op.
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}

/// Resolve once `cancel` observes `true`. A closed channel counts as
/// cancelled: the sender lives as long as the daemon, so losing it means
/// the daemon is going away.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Run a local hook, logging entry and failure, racing it against `cancel`.
///
/// On cancellation the hook future is dropped and the enclosing lifecycle
/// operation aborts with Transient; otherwise the hook's own error is
/// returned unchanged so the operation aborts with it.
pub async fn run<F, Fut>(name: &str, mut cancel: watch::Receiver<bool>, f: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    debug!(hook = name, "Running hook");
    let outcome = tokio::select! {
        outcome = f() => outcome,
        _ = cancelled(&mut cancel) => {
            warn!(hook = name, "Hook cancelled");
            Err(Error::Transient(format!("hook {} cancelled", name)))
        }
    };
    if let Err(e) = &outcome {
        error!(hook = name, error = %e, "Hook failed");
    }
    outcome
}

/// Run a hook on a remote peer, racing it against `cancel`; failures and
/// cancellation are logged and swallowed.
pub async fn run_remote<F, Fut>(name: &str, peer: &str, mut cancel: watch::Receiver<bool>, f: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    debug!(hook = name, peer = %peer, "Invoking remote hook");
    tokio::select! {
        outcome = f() => {
            if let Err(e) = outcome {
                error!(hook = name, peer = %peer, error = %e, "Remote hook failed (continuing)");
            }
        }
        _ = cancelled(&mut cancel) => {
            warn!(hook = name, peer = %peer, "Remote hook cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_completes_without_cancellation() {
        let (_tx, rx) = watch::channel(false);
        let outcome = run("test_hook", rx, || async { Ok(()) }).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn run_surfaces_hook_errors() {
        let (_tx, rx) = watch::channel(false);
        let outcome = run("test_hook", rx, || async {
            Err(Error::Conflict("boom".into()))
        })
        .await;
        assert!(matches!(outcome, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn run_abandons_hanging_hook_on_cancel() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run("test_hook", rx, || async {
            std::future::pending::<Result<()>>().await
        }));
        tx.send(true).unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn run_treats_closed_channel_as_cancelled() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let outcome = run("test_hook", rx, || async {
            std::future::pending::<Result<()>>().await
        })
        .await;
        assert!(matches!(outcome, Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn run_remote_swallows_cancellation() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        // Must return rather than hang; nothing to assert beyond that.
        run_remote("test_hook", "member2", rx, || async {
            std::future::pending::<Result<()>>().await
        })
        .await;
    }
}
