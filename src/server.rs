//! Listener plumbing: the unix control socket and the cluster TLS
//! listeners.
//!
//! Each listener runs its own accept loop on a background task and stops
//! accepting the moment the shutdown watch fires; per-connection tasks run
//! `hyper`'s HTTP/1.1 connection state machine and hand every request to the
//! endpoint registry together with the connection's identity (listener kind,
//! remote address, presented client certificate).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use tokio::net::{lookup_host, TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::daemon::State;
use crate::endpoints::{ConnInfo, Listener, Registry};
use crate::errors::{Error, Result};
use crate::tls;

/// Start the control-socket listener at `<state_dir>/control.socket`.
pub async fn serve_control(state: Arc<State>, registry: Arc<Registry>) -> Result<()> {
    let path = state.dir.control_socket();
    // A stale socket from a crashed daemon blocks bind.
    let _ = fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o660))?;
    info!(socket = %path.display(), "Control socket listening");

    let mut shutdown = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!(error = %e, "Control socket accept failed");
                            continue;
                        }
                    };
                    let conn = ConnInfo {
                        listener: Listener::Control,
                        remote: "unix".to_string(),
                        peer_cert: None,
                    };
                    spawn_connection(state.clone(), registry.clone(), conn, stream);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Control socket listener stopping");
                        return;
                    }
                }
            }
        }
    });
    Ok(())
}

/// Start the main cluster TLS listener plus any additional named listeners.
pub async fn serve_cluster(state: Arc<State>, registry: Arc<Registry>) -> Result<()> {
    let keypair = state.server_keypair()?;
    serve_tls(
        state.clone(),
        registry.clone(),
        Listener::Cluster,
        &state.address(),
        &keypair,
    )
    .await?;

    let servers = state
        .config
        .read()
        .ok()
        .and_then(|c| c.as_ref().map(|c| c.servers.clone()))
        .unwrap_or_default();
    for (name, server) in servers {
        let kp = state
            .extra_keypairs
            .read()
            .ok()
            .and_then(|k| k.get(&name).cloned());
        match kp {
            Some(kp) => {
                serve_tls(
                    state.clone(),
                    registry.clone(),
                    Listener::Extra(name.clone()),
                    &server.address,
                    &kp,
                )
                .await?;
            }
            None => {
                warn!(listener = %name, "No keypair for additional listener; skipping");
            }
        }
    }
    Ok(())
}

/// Bind one TLS listener and spawn its accept loop.
async fn serve_tls(
    state: Arc<State>,
    registry: Arc<Registry>,
    kind: Listener,
    address: &str,
    keypair: &tls::KeyPairPem,
) -> Result<()> {
    let config = tls::server_config(keypair)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let addr = lookup_host(address)
        .await
        .map_err(|e| Error::Fatal(format!("cannot resolve {:?}: {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Fatal(format!("cannot resolve {:?}", address)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Fatal(format!("cannot bind {:?}: {}", address, e)))?;
    info!(listener = ?kind, addr = %addr, "TLS listener up");

    let mut shutdown = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "TCP accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let state = state.clone();
                    let registry = registry.clone();
                    let kind = kind.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                debug!(remote = %remote, error = %e, "TLS handshake failed");
                                return;
                            }
                        };
                        let peer_cert = tls_stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(|c| c.as_ref().to_vec());
                        let conn = ConnInfo {
                            listener: kind,
                            remote: remote.to_string(),
                            peer_cert,
                        };
                        serve_one(state, registry, conn, tls_stream).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("TLS listener stopping");
                        return;
                    }
                }
            }
        }
    });
    Ok(())
}

fn spawn_connection<S>(state: Arc<State>, registry: Arc<Registry>, conn: ConnInfo, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(serve_one(state, registry, conn, stream));
}

async fn serve_one<S>(state: Arc<State>, registry: Arc<Registry>, conn: ConnInfo, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Body>| {
        let state = state.clone();
        let registry = registry.clone();
        let conn = conn.clone();
        async move {
            let resp: Response<Body> = registry.dispatch(state, conn, req).await;
            Ok::<_, hyper::Error>(resp)
        }
    });
    if let Err(e) = Http::new().serve_connection(stream, service).await {
        debug!(error = %e, "Connection closed with error");
    }
}
