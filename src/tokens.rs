//! Join tokens: issue, list, revoke, redeem.
//!
//! A token exists in two forms. The replicated `token_records` row holds
//! only `(secret, name, expiry)`; the transport form handed to the operator
//! is `base64(JSON{secret, fingerprint, join_addresses})`, reconstructed on
//! demand so the advertised fingerprint and candidate addresses are always
//! current. The decoded blob is never persisted by a joiner.
//!
//! One-shot semantics: a secret is either unused (row present) or consumed
//! (row deleted). Consumption happens inside the replicated state machine,
//! so two concurrent redemptions serialize at the log and exactly one wins.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::errors::{Error, Result};
use crate::members::{now_ms, Member, Role};
use crate::raft::Command;
use crate::tls::KeyPairPem;

/// One row of the replicated `token_records` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub secret: String,
    pub name: String,
    /// Milliseconds since the epoch; `None` = never expires.
    pub expiry: Option<u64>,
}

impl TokenRecord {
    pub fn expired(&self, now: u64) -> bool {
        matches!(self.expiry, Some(at) if at <= now)
    }
}

/// Transport form of a join token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "Secret")]
    pub secret: String,
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
    #[serde(rename = "JoinAddresses")]
    pub join_addresses: Vec<String>,
}

impl Token {
    pub fn encode(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|e| Error::Conflict(format!("malformed token: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Conflict(format!("malformed token payload: {}", e)))
    }
}

/// Listing entry returned by the tokens endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub name: String,
    pub expiry: Option<u64>,
    /// The reconstructed transport token.
    pub token: String,
}

/// Body of the join request a joiner POSTs to `core/internal/cluster`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub address: String,
    /// The joiner's PEM server certificate.
    pub certificate: String,
    pub secret: String,
    #[serde(default)]
    pub api_extensions: Vec<String>,
    pub schema_internal: u64,
    pub schema_external: u64,
}

/// `(name, address, certificate)` triple carried in token responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub name: String,
    pub address: String,
    pub certificate: String,
}

/// Everything a joiner needs to become a member, returned by redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub cluster_cert: String,
    pub cluster_key: String,
    pub cluster_members: Vec<MemberRecord>,
    /// Keypairs for additional named listeners, issued under the cluster CA.
    #[serde(default)]
    pub additional_keypairs: BTreeMap<String, KeyPairPem>,
    /// The acting leader; the joiner targets it for the member fan-out
    /// before the rest of the cluster trusts it.
    pub trusted_member: MemberRecord,
}

/// Generate a fresh 256-bit random secret, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Issue a token for a prospective member called `name` (leader only).
///
/// Inserts the record, then assembles the transport token from the current
/// cluster fingerprint and the non-pending member addresses.
pub async fn issue(
    db: &Db,
    name: &str,
    expiry: Option<Duration>,
    fingerprint: &str,
) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Conflict("token name cannot be empty".into()));
    }
    let record = TokenRecord {
        secret: generate_secret(),
        name: name.to_string(),
        expiry: expiry.map(|d| now_ms() + d.as_millis() as u64),
    };
    db.commit(vec![Command::InsertToken {
        record: record.clone(),
    }])
    .await?;

    let snapshot = db.snapshot();
    Token {
        secret: record.secret,
        fingerprint: fingerprint.to_string(),
        join_addresses: crate::members::assigned_addresses(&snapshot.members),
    }
    .encode()
}

/// List outstanding tokens, reconstructing their transport form.
pub fn list(db: &Db, fingerprint: &str) -> Result<Vec<TokenInfo>> {
    let snapshot = db.snapshot();
    let join_addresses = crate::members::assigned_addresses(&snapshot.members);
    snapshot
        .tokens
        .values()
        .map(|record| {
            let token = Token {
                secret: record.secret.clone(),
                fingerprint: fingerprint.to_string(),
                join_addresses: join_addresses.clone(),
            }
            .encode()?;
            Ok(TokenInfo {
                name: record.name.clone(),
                expiry: record.expiry,
                token,
            })
        })
        .collect()
}

/// Delete the token issued under `name` (leader only).
pub async fn revoke(db: &Db, name: &str) -> Result<()> {
    db.commit(vec![Command::DeleteToken {
        name: name.to_string(),
    }])
    .await
    .map(|_| ())
}

/// Redeem a token: atomically verify the secret, insert the joiner as
/// PENDING, and delete the record (leader only).
///
/// The three steps are one state-machine command so a concurrent redemption
/// of the same secret loses with Conflict and observes no partial state.
pub async fn redeem(db: &Db, request: &JoinRequest) -> Result<()> {
    crate::config::validate_address(&request.address)?;
    let joiner = Member {
        name: request.name.clone(),
        address: request.address.clone(),
        certificate: request.certificate.clone(),
        role: Role::Pending,
        schema_internal: request.schema_internal,
        schema_external: request.schema_external,
        api_extensions: request.api_extensions.clone(),
        last_heartbeat: 0,
    };
    db.commit(vec![Command::RedeemToken {
        secret: request.secret.clone(),
        joiner,
        now_ms: now_ms(),
    }])
    .await
    .map(|_| ())
}

/// The heartbeat-tail command that garbage-collects expired records.
pub fn purge_expired_command() -> Command {
    Command::PurgeExpiredTokens { now_ms: now_ms() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_long_and_random() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_roundtrip() {
        let token = Token {
            secret: generate_secret(),
            fingerprint: "ab".repeat(32),
            join_addresses: vec!["127.0.0.1:9001".into(), "127.0.0.1:9002".into()],
        };
        let encoded = token.encode().unwrap();
        let decoded = Token::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn token_wire_field_names() {
        let token = Token {
            secret: "s".into(),
            fingerprint: "f".into(),
            join_addresses: vec![],
        };
        let json = String::from_utf8(BASE64.decode(token.encode().unwrap()).unwrap()).unwrap();
        assert!(json.contains(r#""Secret""#));
        assert!(json.contains(r#""Fingerprint""#));
        assert!(json.contains(r#""JoinAddresses""#));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Token::decode("%%%"), Err(Error::Conflict(_))));
        let not_json = BASE64.encode(b"plainly not a token");
        assert!(matches!(Token::decode(&not_json), Err(Error::Conflict(_))));
    }

    #[test]
    fn decode_trims_whitespace() {
        let token = Token {
            secret: "s".into(),
            fingerprint: "f".into(),
            join_addresses: vec![],
        };
        let padded = format!("  {}\n", token.encode().unwrap());
        assert_eq!(Token::decode(&padded).unwrap(), token);
    }

    #[test]
    fn expiry_check() {
        let record = TokenRecord {
            secret: "s".into(),
            name: "m2".into(),
            expiry: Some(1_000),
        };
        assert!(record.expired(1_000));
        assert!(record.expired(2_000));
        assert!(!record.expired(999));
        let forever = TokenRecord {
            secret: "s".into(),
            name: "m2".into(),
            expiry: None,
        };
        assert!(!forever.expired(u64::MAX));
    }
}
