//! Outbound HTTP plumbing.
//!
//! Three distinct clients:
//!
//! - [`PeerPool`] — the long-lived intra-cluster client. Presents the local
//!   server keypair as identity, trusts exactly the truststore set plus the
//!   cluster certificate, and stamps every request with the cluster-notifier
//!   User-Agent and the forwarded-identity headers. Rebuilt whenever the
//!   truststore or local identity changes.
//! - [`pinned_client`] — the join dial. The joiner knows nothing about the
//!   cluster except the fingerprint inside the token, so the server
//!   certificate is verified by fingerprint alone.
//! - [`LocalClient`] — plain HTTP over the daemon's unix control socket.
//!
//! Proxies from the environment (`HTTPS_PROXY`) are honored by reqwest's
//! defaults for outbound calls that are not intra-cluster; the cluster
//! clients opt out with `.no_proxy()`.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use hyper::{Body, Method, StatusCode};
use rustls::pki_types::CertificateDer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::debug;

use crate::errors::{from_wire, Error, Result};
use crate::tls::{self, KeyPairPem};

/// User-Agent sentinel marking a request as a trusted intra-cluster forward.
pub const CLUSTER_NOTIFIER_UA: &str = "lxd-cluster-notifier";

/// Original caller identity carried on forwarded requests.
pub const HEADER_FORWARDED_USERNAME: &str = "X-LXD-Forwarded-Username";
pub const HEADER_FORWARDED_PROTOCOL: &str = "X-LXD-Forwarded-Protocol";
pub const HEADER_FORWARDED_ADDRESS: &str = "X-LXD-Forwarded-Address";

/// Default deadline for a single intra-cluster RPC.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PoolState {
    identity: Option<KeyPairPem>,
    trusted: Vec<CertificateDer<'static>>,
    local_name: String,
    local_address: String,
}

/// Shared intra-cluster client, safe to clone via `Arc`.
#[derive(Default)]
pub struct PeerPool {
    state: RwLock<PoolState>,
    client: RwLock<Option<reqwest::Client>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the local identity and trusted certificate set,
    /// rebuilding the underlying client.
    pub fn configure(
        &self,
        identity: KeyPairPem,
        trusted: Vec<CertificateDer<'static>>,
        local_name: &str,
        local_address: &str,
    ) -> Result<()> {
        let client = build_peer_client(&identity, trusted.clone(), local_name, local_address)?;
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| Error::Fatal("client pool lock poisoned".into()))?;
            state.identity = Some(identity);
            state.trusted = trusted;
            state.local_name = local_name.to_string();
            state.local_address = local_address.to_string();
        }
        *self
            .client
            .write()
            .map_err(|_| Error::Fatal("client pool lock poisoned".into()))? = Some(client);
        debug!("Peer client pool reconfigured");
        Ok(())
    }

    /// The configured reqwest client, if [`PeerPool::configure`] has run.
    pub fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::NotReady)
    }

    pub fn local_address(&self) -> String {
        self.state
            .read()
            .map(|s| s.local_address.clone())
            .unwrap_or_default()
    }

    /// POST a raft RPC payload to `core/internal/raft/<op>` on a peer.
    pub async fn post_raft(&self, addr: &str, op: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("https://{}/core/internal/raft/{}", addr, op);
        let resp = self
            .client()?
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if status >= 400 {
            return Err(from_wire(status, &bytes));
        }
        Ok(bytes.to_vec())
    }

    /// Send a JSON request to a peer and decode the JSON response.
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        addr: &str,
        path: &str,
        body: Option<&T>,
    ) -> Result<R> {
        let url = format!("https://{}/{}", addr, path.trim_start_matches('/'));
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| Error::Fatal(format!("invalid method: {}", e)))?;
        let mut req = self.client()?.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if status >= 400 {
            return Err(from_wire(status, &bytes));
        }
        if bytes.is_empty() {
            serde_json::from_slice(b"null").map_err(Error::from)
        } else {
            serde_json::from_slice(&bytes).map_err(Error::from)
        }
    }
}

fn build_peer_client(
    identity: &KeyPairPem,
    trusted: Vec<CertificateDer<'static>>,
    local_name: &str,
    local_address: &str,
) -> Result<reqwest::Client> {
    let tls_config = tls::peer_client_config(identity, trusted)?;
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        HEADER_FORWARDED_USERNAME,
        header_value(local_name)?,
    );
    headers.insert(HEADER_FORWARDED_PROTOCOL, header_value("cluster")?);
    headers.insert(HEADER_FORWARDED_ADDRESS, header_value(local_address)?);
    reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .user_agent(CLUSTER_NOTIFIER_UA)
        .default_headers(headers)
        .timeout(RPC_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(|e| Error::Fatal(format!("failed to build peer client: {}", e)))
}

fn header_value(v: &str) -> Result<reqwest::header::HeaderValue> {
    reqwest::header::HeaderValue::from_str(v)
        .map_err(|e| Error::Fatal(format!("invalid header value {:?}: {}", v, e)))
}

/// Build the one-shot join client pinning the cluster fingerprint.
pub fn pinned_client(identity: &KeyPairPem, fingerprint: &str) -> Result<reqwest::Client> {
    let tls_config = tls::pinned_client_config(identity, fingerprint)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .timeout(RPC_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(|e| Error::Fatal(format!("failed to build join client: {}", e)))
}

/// Plain HTTP client for the local unix control socket.
#[derive(Debug, Clone)]
pub struct LocalClient {
    socket: PathBuf,
}

impl LocalClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Send a request over the control socket and decode the JSON response.
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<R> {
        let (status, bytes) = self.request_raw(method, path, body).await?;
        if status.as_u16() >= 400 {
            return Err(from_wire(status.as_u16(), &bytes));
        }
        if bytes.is_empty() {
            serde_json::from_slice(b"null").map_err(Error::from)
        } else {
            serde_json::from_slice(&bytes).map_err(Error::from)
        }
    }

    /// Send a request and return the raw status + body.
    pub async fn request_raw<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| Error::Transient(format!("control socket unavailable: {}", e)))?;
        let (mut sender, conn) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| Error::Transient(format!("control handshake failed: {}", e)))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("Host", "microcluster");
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(body)?)),
            None => {
                builder = builder.header("Content-Length", "0");
                builder.body(Body::empty())
            }
        }
        .map_err(|e| Error::Fatal(format!("failed to build request: {}", e)))?;

        let resp = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Transient(format!("control request failed: {}", e)))?;
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| Error::Transient(format!("control response failed: {}", e)))?;
        Ok((status, bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_not_ready_until_configured() {
        let pool = PeerPool::new();
        assert!(matches!(pool.client(), Err(Error::NotReady)));
    }

    #[test]
    fn pool_configure_builds_client() {
        let identity = tls::generate_server_keypair("member1").unwrap();
        let peer = tls::generate_server_keypair("member2").unwrap();
        let trusted = tls::certs_from_pem(&peer.cert).unwrap();
        let pool = PeerPool::new();
        pool.configure(identity, trusted, "member1", "127.0.0.1:9001")
            .unwrap();
        assert!(pool.client().is_ok());
        assert_eq!(pool.local_address(), "127.0.0.1:9001");
    }

    #[test]
    fn pinned_client_builds() {
        let identity = tls::generate_server_keypair("member1").unwrap();
        pinned_client(&identity, &"ab".repeat(32)).unwrap();
    }

    #[test]
    fn sentinel_constants_match_wire_contract() {
        assert_eq!(CLUSTER_NOTIFIER_UA, "lxd-cluster-notifier");
        assert_eq!(HEADER_FORWARDED_USERNAME, "X-LXD-Forwarded-Username");
        assert_eq!(HEADER_FORWARDED_PROTOCOL, "X-LXD-Forwarded-Protocol");
        assert_eq!(HEADER_FORWARDED_ADDRESS, "X-LXD-Forwarded-Address");
    }
}
