//! Integration tests for the request plane: endpoint classes, trust
//! resolution, and the dispatch rules, driven through the registry without
//! real sockets.

use std::sync::Arc;

use hyper::{Body, Method, Request};
use microcluster::api::build_registry;
use microcluster::daemon::Daemon;
use microcluster::endpoints::{ConnInfo, Listener};
use microcluster::hooks::NoopHooks;
use microcluster::tls;
use serial_test::serial;
use tempfile::tempdir;

fn daemon(path: &std::path::Path) -> Daemon {
    Daemon::new(path, Arc::new(NoopHooks), vec![]).unwrap()
}

fn control_conn() -> ConnInfo {
    ConnInfo {
        listener: Listener::Control,
        remote: "unix".to_string(),
        peer_cert: None,
    }
}

fn tls_conn(peer_cert: Option<Vec<u8>>) -> ConnInfo {
    ConnInfo {
        listener: Listener::Cluster,
        remote: "127.0.0.1:50000".to_string(),
        peer_cert,
    }
}

fn request(method: Method, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(resp: hyper::Response<Body>) -> String {
    String::from_utf8(
        hyper::body::to_bytes(resp.into_body())
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap()
}

#[tokio::test]
async fn unknown_path_is_404() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();
    let resp = registry
        .dispatch(
            d.state.clone(),
            control_conn(),
            request(Method::GET, "/core/control/nonsense"),
        )
        .await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn wrong_method_is_405() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();
    let resp = registry
        .dispatch(
            d.state.clone(),
            control_conn(),
            request(Method::DELETE, "/core/control/ready"),
        )
        .await;
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn control_endpoints_rejected_on_tls_listener() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();
    let resp = registry
        .dispatch(
            d.state.clone(),
            tls_conn(None),
            request(Method::POST, "/core/control/shutdown"),
        )
        .await;
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn public_endpoints_rejected_on_control_socket() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();
    let resp = registry
        .dispatch(
            d.state.clone(),
            control_conn(),
            request(Method::GET, "/core/1.0"),
        )
        .await;
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn server_info_is_reachable_untrusted() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();
    let resp = registry
        .dispatch(
            d.state.clone(),
            tls_conn(None),
            request(Method::GET, "/core/1.0"),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body = body_string(resp).await;
    assert!(body.contains("\"ready\":false"));
}

#[tokio::test]
async fn trusted_endpoint_rejects_unknown_certificate() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();

    // A certificate that is not in the (empty) truststore.
    let stranger = tls::generate_server_keypair("stranger").unwrap();
    let der = tls::certs_from_pem(&stranger.cert).unwrap()[0].as_ref().to_vec();
    let resp = registry
        .dispatch(
            d.state.clone(),
            tls_conn(Some(der)),
            request(Method::GET, "/core/1.0/cluster"),
        )
        .await;
    assert_eq!(resp.status(), 403);
    let body = body_string(resp).await;
    assert!(body.contains("\"type\":\"error\""));
    assert!(body.contains("\"error_code\":403"));
}

#[tokio::test]
async fn trusted_member_reaches_public_cluster_list() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();

    let member = tls::generate_server_keypair("member2").unwrap();
    d.state
        .truststore
        .replace_all(vec![microcluster::truststore::TrustEntry {
            name: "member2".into(),
            address: "127.0.0.1:9002".into(),
            certificate: member.cert.clone(),
        }])
        .unwrap();
    let der = tls::certs_from_pem(&member.cert).unwrap()[0].as_ref().to_vec();

    // Trusted, but the store is closed: the documented 503 body.
    let resp = registry
        .dispatch(
            d.state.clone(),
            tls_conn(Some(der)),
            request(Method::GET, "/core/1.0/cluster"),
        )
        .await;
    assert_eq!(resp.status(), 503);
    assert!(body_string(resp).await.contains("database not ready"));
}

#[tokio::test]
async fn internal_endpoint_requires_forwarded_sentinel() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();

    let member = tls::generate_server_keypair("member2").unwrap();
    d.state
        .truststore
        .replace_all(vec![microcluster::truststore::TrustEntry {
            name: "member2".into(),
            address: "127.0.0.1:9002".into(),
            certificate: member.cert.clone(),
        }])
        .unwrap();
    let der = tls::certs_from_pem(&member.cert).unwrap()[0].as_ref().to_vec();

    // Trusted but without the sentinel UA: internal endpoints refuse.
    let resp = registry
        .dispatch(
            d.state.clone(),
            tls_conn(Some(der.clone())),
            request(Method::GET, "/core/internal/database"),
        )
        .await;
    assert_eq!(resp.status(), 403);

    // With the sentinel the same call is admitted (and reports 503 because
    // the store is closed — trust passed, readiness did not).
    let req = Request::builder()
        .method(Method::GET)
        .uri("/core/internal/database")
        .header("User-Agent", microcluster::client::CLUSTER_NOTIFIER_UA)
        .body(Body::empty())
        .unwrap();
    let resp = registry.dispatch(d.state.clone(), tls_conn(Some(der)), req).await;
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn join_request_admitted_untrusted_but_store_closed() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();

    let body = serde_json::json!({
        "name": "member2",
        "address": "127.0.0.1:9002",
        "certificate": "",
        "secret": "s",
        "schema_internal": 1,
        "schema_external": 1,
    });
    let req = Request::builder()
        .method(Method::POST)
        .uri("/core/internal/cluster")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = registry.dispatch(d.state.clone(), tls_conn(None), req).await;
    // Untrusted is fine for token redemption; the closed store is what
    // rejects it here.
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
#[serial] // binds a real port for the cluster listener
async fn second_bootstrap_conflicts_and_leaves_state() {
    let tmp = tempdir().unwrap();
    let d = daemon(tmp.path());
    let registry = build_registry();

    let body = serde_json::json!({
        "bootstrap": true,
        "name": "member1",
        "address": "127.0.0.1:19701",
    });
    let req = Request::builder()
        .method(Method::POST)
        .uri("/core/control")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = registry.dispatch(d.state.clone(), control_conn(), req).await;
    assert_eq!(resp.status(), 200, "first bootstrap must succeed");
    assert!(d.state.is_initialized());
    let fingerprint = d.state.fingerprint().unwrap();

    let req = Request::builder()
        .method(Method::POST)
        .uri("/core/control")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let resp = registry.dispatch(d.state.clone(), control_conn(), req).await;
    assert_eq!(resp.status(), 409, "second bootstrap must conflict");
    // State unchanged: same cluster identity.
    assert_eq!(d.state.fingerprint().unwrap(), fingerprint);
    d.state.db.close().await;
}
