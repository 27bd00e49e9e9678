//! Integration tests for the token lifecycle against a live single-node
//! store: issue, list, redeem-once, revoke, and expiry purge.

use std::sync::Arc;
use std::time::Duration;

use microcluster::client::PeerPool;
use microcluster::db::{Db, OpenMode};
use microcluster::errors::Error;
use microcluster::members::{now_ms, Role};
use microcluster::raft::Command;
use microcluster::state_dir::StateDir;
use microcluster::tokens::{self, JoinRequest, Token};
use tempfile::tempdir;

const FINGERPRINT: &str = "6ff36c25a0b0f2b3b465c1e23e25c61c6c3bcb0f4ecb08b0d25d5a8c5bba9f21";

async fn bootstrapped_db(path: &std::path::Path) -> Db {
    let dir = StateDir::create(path).unwrap();
    let db = Db::new(dir, Arc::new(PeerPool::new()));
    db.open("127.0.0.1:9001", OpenMode::Bootstrap).await.unwrap();
    // The bootstrapper's own row, as the bootstrap flow inserts it.
    db.commit(vec![Command::InsertMember {
        member: microcluster::members::Member {
            name: "member1".into(),
            address: "127.0.0.1:9001".into(),
            certificate: String::new(),
            role: Role::Voter,
            schema_internal: 1,
            schema_external: 1,
            api_extensions: vec![],
            last_heartbeat: now_ms(),
        },
    }])
    .await
    .unwrap();
    db
}

fn join_request(name: &str, port: u16, secret: &str) -> JoinRequest {
    JoinRequest {
        name: name.to_string(),
        address: format!("127.0.0.1:{}", port),
        certificate: String::new(),
        secret: secret.to_string(),
        api_extensions: vec![],
        schema_internal: 1,
        schema_external: 1,
    }
}

#[tokio::test]
async fn issued_token_advertises_current_members() {
    let tmp = tempdir().unwrap();
    let db = bootstrapped_db(tmp.path()).await;

    let encoded = tokens::issue(&db, "member2", None, FINGERPRINT).await.unwrap();
    let token = Token::decode(&encoded).unwrap();
    assert_eq!(token.fingerprint, FINGERPRINT);
    assert_eq!(token.join_addresses, vec!["127.0.0.1:9001".to_string()]);
    assert!(token.secret.len() >= 32);

    let listed = tokens::list(&db, FINGERPRINT).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "member2");
    assert_eq!(Token::decode(&listed[0].token).unwrap().secret, token.secret);
    db.close().await;
}

#[tokio::test]
async fn duplicate_token_name_conflicts() {
    let tmp = tempdir().unwrap();
    let db = bootstrapped_db(tmp.path()).await;

    tokens::issue(&db, "member2", None, FINGERPRINT).await.unwrap();
    let second = tokens::issue(&db, "member2", None, FINGERPRINT).await;
    assert!(matches!(second, Err(Error::Conflict(_))));
    db.close().await;
}

#[tokio::test]
async fn redeem_is_one_shot() {
    let tmp = tempdir().unwrap();
    let db = bootstrapped_db(tmp.path()).await;

    let encoded = tokens::issue(&db, "member2", None, FINGERPRINT).await.unwrap();
    let secret = Token::decode(&encoded).unwrap().secret;

    tokens::redeem(&db, &join_request("member2", 9002, &secret))
        .await
        .unwrap();

    let snapshot = db.snapshot();
    assert_eq!(snapshot.members["member2"].role, Role::Pending);
    assert!(snapshot.tokens.is_empty(), "consumed token must be deleted");

    // A second redemption with the same secret loses.
    let replay = tokens::redeem(&db, &join_request("member3", 9003, &secret)).await;
    assert!(matches!(replay, Err(Error::Conflict(_))));
    assert!(!db.snapshot().members.contains_key("member3"));
    db.close().await;
}

#[tokio::test]
async fn revoked_token_cannot_be_redeemed() {
    let tmp = tempdir().unwrap();
    let db = bootstrapped_db(tmp.path()).await;

    let encoded = tokens::issue(&db, "member2", None, FINGERPRINT).await.unwrap();
    let secret = Token::decode(&encoded).unwrap().secret;
    tokens::revoke(&db, "member2").await.unwrap();
    assert!(tokens::list(&db, FINGERPRINT).unwrap().is_empty());

    let outcome = tokens::redeem(&db, &join_request("member2", 9002, &secret)).await;
    assert!(matches!(outcome, Err(Error::Conflict(_))));
    db.close().await;
}

#[tokio::test]
async fn expired_tokens_are_purged_not_redeemable() {
    let tmp = tempdir().unwrap();
    let db = bootstrapped_db(tmp.path()).await;

    let encoded = tokens::issue(&db, "member2", Some(Duration::from_millis(1)), FINGERPRINT)
        .await
        .unwrap();
    let secret = Token::decode(&encoded).unwrap().secret;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = tokens::redeem(&db, &join_request("member2", 9002, &secret)).await;
    assert!(matches!(outcome, Err(Error::Conflict(_))));

    // The heartbeat tail garbage-collects the record.
    db.commit(vec![tokens::purge_expired_command()]).await.unwrap();
    assert!(db.snapshot().tokens.is_empty());
    db.close().await;
}
