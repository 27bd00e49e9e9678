//! Bootstrap and the join protocol.
//!
//! Bootstrap forms a cluster of one; join admits a node to an existing
//! cluster through a one-shot token. Both run under the control-plane
//! singleton lock, so at most one of bootstrap/join/remove is in flight per
//! process.
//!
//! The join state machine, on the joiner:
//!
//! 1. decode the token (secret, fingerprint, candidate addresses);
//! 2. dial candidates in randomized order with the fingerprint-pinned client;
//! 3. POST the join request; the receiver forwards to the leader, which
//!    redeems the token and answers with the cluster credentials;
//! 4. persist cluster cert/key and additional listener keypairs;
//! 5. replace the local truststore from the response's member list;
//! 6. open the store and the TLS listener so peer traffic can reach us;
//! 7. run `pre_join`;
//! 8. announce ourselves to the trusted member, which fans out to every
//!    existing member;
//! 9. run `post_join`.
//!
//! A joiner that dies before step 4 left no trace locally and is recovered
//! by operator removal of its PENDING row; one that dies later is already
//! named by the replicated state and resumes on restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::client;
use crate::config::DaemonConfig;
use crate::daemon::{start_cluster_services, State};
use crate::db::OpenMode;
use crate::errors::{Error, Result};
use crate::hooks;
use crate::members::{now_ms, Member, Role};
use crate::raft::Command;
use crate::tls;
use crate::tokens::{self, JoinRequest, MemberRecord, Token, TokenResponse};
use crate::truststore::TrustEntry;

/// Body of the trust fan-out endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrustAnnouncement {
    pub member: MemberRecord,
    /// True on the joiner's initial call; the receiver then repeats the
    /// announcement to every other member with `fan_out` unset.
    #[serde(default)]
    pub fan_out: bool,
}

/// Project member rows into truststore entries.
pub fn trust_entries<'a>(members: impl Iterator<Item = &'a Member>) -> Vec<TrustEntry> {
    members
        .filter(|m| !m.certificate.is_empty())
        .map(|m| TrustEntry {
            name: m.name.clone(),
            address: m.address.clone(),
            certificate: m.certificate.clone(),
        })
        .collect()
}

/// Form a new single-node cluster.
pub async fn bootstrap(
    state: &Arc<State>,
    name: &str,
    address: &str,
    init_config: &BTreeMap<String, String>,
) -> Result<()> {
    let _guard = state
        .ops_lock
        .try_lock()
        .map_err(|_| Error::Conflict("another cluster operation is in progress".into()))?;
    if state.is_initialized() || state.db.is_open() {
        return Err(Error::Conflict("daemon is already part of a cluster".into()));
    }
    let config = DaemonConfig::new(name, address);
    config.validate()?;

    info!(name = %name, address = %address, "Bootstrapping new cluster");

    // Identity first: server keypair with our name as SAN, then the cluster
    // CA every future member will share.
    let server_kp = tls::generate_server_keypair(name)?;
    state.save_keypair(&server_kp, &state.dir.server_cert(), &state.dir.server_key())?;
    let cluster_kp = tls::generate_cluster_keypair("microcluster")?;
    state.save_keypair(
        &cluster_kp,
        &state.dir.cluster_cert(),
        &state.dir.cluster_key(),
    )?;
    let mut extra = BTreeMap::new();
    for listener in config.servers.keys() {
        let kp = tls::issue_listener_keypair(listener, &cluster_kp)?;
        state.save_keypair(
            &kp,
            &state.dir.listener_cert(listener),
            &state.dir.listener_key(listener),
        )?;
        extra.insert(listener.clone(), kp);
    }

    {
        let mut guard = state
            .server_keypair
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = Some(server_kp.clone());
    }
    {
        let mut guard = state
            .cluster_keypair
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = Some(cluster_kp);
    }
    {
        let mut guard = state
            .extra_keypairs
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = extra;
    }

    state.set_config(config)?;
    state.refresh_pool()?;

    state.db.open(address, OpenMode::Bootstrap).await?;

    let member = Member {
        name: name.to_string(),
        address: address.to_string(),
        certificate: server_kp.cert.clone(),
        role: Role::Voter,
        schema_internal: crate::db::SCHEMA_INTERNAL,
        schema_external: crate::db::SCHEMA_EXTERNAL,
        api_extensions: state.extensions.clone(),
        last_heartbeat: now_ms(),
    };
    state.db.commit(vec![Command::InsertMember { member }]).await?;

    state
        .truststore
        .replace_all(trust_entries(state.db.snapshot().members.values()))?;
    state.refresh_pool()?;

    hooks::run("pre_bootstrap", state.shutdown_rx(), || {
        state.hooks.pre_bootstrap(state, init_config)
    })
    .await?;
    start_cluster_services(state).await?;
    hooks::run("post_bootstrap", state.shutdown_rx(), || {
        state.hooks.post_bootstrap(state)
    })
    .await?;

    info!(name = %name, "Bootstrap complete");
    Ok(())
}

/// Join an existing cluster with a one-shot token.
pub async fn join(state: &Arc<State>, token: &str, name: &str, address: &str) -> Result<()> {
    let _guard = state
        .ops_lock
        .try_lock()
        .map_err(|_| Error::Conflict("another cluster operation is in progress".into()))?;
    if state.is_initialized() || state.db.is_open() {
        return Err(Error::Conflict("daemon is already part of a cluster".into()));
    }
    let config = DaemonConfig::new(name, address);
    config.validate()?;
    let token = Token::decode(token)?;
    if token.join_addresses.is_empty() {
        return Err(Error::Conflict("token advertises no join addresses".into()));
    }

    info!(name = %name, address = %address, "Joining cluster");

    let server_kp = tls::generate_server_keypair(name)?;
    state.save_keypair(&server_kp, &state.dir.server_cert(), &state.dir.server_key())?;
    {
        let mut guard = state
            .server_keypair
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = Some(server_kp.clone());
    }

    let request = JoinRequest {
        name: name.to_string(),
        address: address.to_string(),
        certificate: server_kp.cert.clone(),
        secret: token.secret.clone(),
        api_extensions: state.extensions.clone(),
        schema_internal: crate::db::SCHEMA_INTERNAL,
        schema_external: crate::db::SCHEMA_EXTERNAL,
    };
    let response = redeem_against_candidates(&server_kp, &token, &request).await?;

    // Step 4: persist received credentials.
    state.save_keypair(
        &response.cluster_cert_keypair(),
        &state.dir.cluster_cert(),
        &state.dir.cluster_key(),
    )?;
    {
        let mut guard = state
            .cluster_keypair
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = Some(response.cluster_cert_keypair());
    }
    for (listener, kp) in &response.additional_keypairs {
        state.save_keypair(
            kp,
            &state.dir.listener_cert(listener),
            &state.dir.listener_key(listener),
        )?;
    }
    {
        let mut guard = state
            .extra_keypairs
            .write()
            .map_err(|_| Error::Fatal("keypair lock poisoned".into()))?;
        *guard = response.additional_keypairs.clone();
    }
    state.set_config(config)?;

    // Step 5: the replicated member list becomes our truststore.
    let entries: Vec<TrustEntry> = response
        .cluster_members
        .iter()
        .map(|m| TrustEntry {
            name: m.name.clone(),
            address: m.address.clone(),
            certificate: m.certificate.clone(),
        })
        .collect();
    state.truststore.replace_all(entries)?;
    state.refresh_pool()?;

    // Step 6: open the store and the listener so the leader can reach us.
    state.db.open(address, OpenMode::Join).await?;
    start_cluster_services(state).await?;

    hooks::run("pre_join", state.shutdown_rx(), || state.hooks.pre_join(state)).await?;

    // Step 8: cluster-wide fan-out via the member that redeemed our token.
    let announcement = TrustAnnouncement {
        member: MemberRecord {
            name: name.to_string(),
            address: address.to_string(),
            certificate: server_kp.cert.clone(),
        },
        fan_out: true,
    };
    let _: serde_json::Value = state
        .pool
        .request(
            hyper::Method::POST,
            &response.trusted_member.address,
            "core/internal/trust",
            Some(&announcement),
        )
        .await?;

    hooks::run("post_join", state.shutdown_rx(), || state.hooks.post_join(state)).await?;

    info!(name = %name, "Join complete");
    Ok(())
}

impl TokenResponse {
    fn cluster_cert_keypair(&self) -> tls::KeyPairPem {
        tls::KeyPairPem {
            cert: self.cluster_cert.clone(),
            key: self.cluster_key.clone(),
        }
    }
}

/// Steps 2–3: dial candidates in randomized order until one redeems.
async fn redeem_against_candidates(
    identity: &tls::KeyPairPem,
    token: &Token,
    request: &JoinRequest,
) -> Result<TokenResponse> {
    let client = client::pinned_client(identity, &token.fingerprint)?;
    let mut candidates = token.join_addresses.clone();
    candidates.shuffle(&mut rand::thread_rng());

    let mut last_error = Error::Transient("no join candidate reachable".into());
    for candidate in candidates {
        let url = format!("https://{}/core/internal/cluster", candidate);
        let outcome = async {
            let resp = client.post(&url).json(request).send().await?;
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await?;
            if status >= 400 {
                return Err(crate::errors::from_wire(status, &bytes));
            }
            serde_json::from_slice::<TokenResponse>(&bytes).map_err(Error::from)
        }
        .await;
        match outcome {
            Ok(response) => return Ok(response),
            // A conflict is authoritative (consumed token, duplicate name);
            // trying another candidate cannot change the answer.
            Err(e @ Error::Conflict(_)) => return Err(e),
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "Join candidate failed; trying next");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Leader-side token redemption (the receive half of join step 3).
pub async fn handle_join_request(state: &Arc<State>, request: JoinRequest) -> Result<TokenResponse> {
    if !state.db.is_open() {
        return Err(Error::NotReady);
    }
    if request.api_extensions != state.extensions {
        return Err(Error::Conflict(format!(
            "joiner API extensions {:?} do not match the cluster's {:?}",
            request.api_extensions, state.extensions
        )));
    }
    tls::certs_from_pem(&request.certificate)
        .map_err(|_| Error::Conflict("joiner certificate is not valid PEM".into()))?;

    tokens::redeem(&state.db, &request).await?;

    // Trust the joiner immediately so its fan-out call can reach us; every
    // other member learns of it through the announcement or the next
    // heartbeat.
    let snapshot = state.db.snapshot();
    state
        .truststore
        .replace_all(trust_entries(snapshot.members.values()))?;
    state.refresh_pool()?;

    info!(joiner = %request.name, address = %request.address, "Token redeemed; member is PENDING");

    let cluster_kp = state.cluster_keypair()?;
    let members = snapshot
        .members
        .values()
        .map(|m| MemberRecord {
            name: m.name.clone(),
            address: m.address.clone(),
            certificate: m.certificate.clone(),
        })
        .collect();
    Ok(TokenResponse {
        cluster_cert: cluster_kp.cert,
        cluster_key: cluster_kp.key,
        cluster_members: members,
        additional_keypairs: state
            .extra_keypairs
            .read()
            .map(|k| k.clone())
            .unwrap_or_default(),
        trusted_member: MemberRecord {
            name: state.name(),
            address: state.address(),
            certificate: state.server_keypair()?.cert,
        },
    })
}

/// Apply a trust announcement locally and, when asked, repeat it to every
/// other member (join step 8's receive half).
pub async fn handle_trust_announcement(
    state: &Arc<State>,
    announcement: TrustAnnouncement,
) -> Result<()> {
    if !state.db.is_open() {
        return Err(Error::NotReady);
    }
    let member = announcement.member.clone();

    // Rebuild the truststore from the replicated table; merge the announced
    // record in case replication has not reached this node yet.
    let snapshot = state.db.snapshot();
    let mut entries = trust_entries(snapshot.members.values());
    if !entries.iter().any(|e| e.name == member.name) {
        entries.push(TrustEntry {
            name: member.name.clone(),
            address: member.address.clone(),
            certificate: member.certificate.clone(),
        });
    }
    state.truststore.replace_all(entries)?;
    state.refresh_pool()?;

    // The leader also admits the joiner to raft and promotes its row.
    if state.db.is_leader() {
        let role = state.db.add_raft_member(&member.address).await?;
        let mut updates = BTreeMap::new();
        updates.insert(
            member.name.clone(),
            crate::raft::MemberTouch {
                role,
                last_heartbeat: Some(now_ms()),
            },
        );
        state.db.commit(vec![Command::TouchMembers { updates }]).await?;
        info!(member = %member.name, role = %role.as_str(), "New member admitted to raft");
        crate::heartbeat::kick_round(state);
    }

    hooks::run("on_new_member", state.shutdown_rx(), || {
        state.hooks.on_new_member(state, &member.name)
    })
    .await?;

    if announcement.fan_out {
        let repeat = TrustAnnouncement {
            member: member.clone(),
            fan_out: false,
        };
        let local = state.address();
        for target in snapshot.members.values() {
            if target.address == local
                || target.address == member.address
                || !target.role.is_assigned()
            {
                continue;
            }
            let outcome: Result<serde_json::Value> = state
                .pool
                .request(
                    hyper::Method::POST,
                    &target.address,
                    "core/internal/trust",
                    Some(&repeat),
                )
                .await;
            if let Err(e) = outcome {
                warn!(member = %target.name, error = %e, "Trust fan-out failed (continuing)");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_entries_skip_certless_rows() {
        let with_cert = Member {
            name: "a".into(),
            address: "127.0.0.1:9001".into(),
            certificate: "-----BEGIN CERTIFICATE-----\n".into(),
            role: Role::Voter,
            schema_internal: 1,
            schema_external: 1,
            api_extensions: vec![],
            last_heartbeat: 0,
        };
        let mut without = with_cert.clone();
        without.name = "b".into();
        without.address = "127.0.0.1:9002".into();
        without.certificate = String::new();

        let entries = trust_entries([&with_cert, &without].into_iter());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
    }

    #[test]
    fn announcement_fan_out_defaults_off() {
        let json = r#"{"member":{"name":"m","address":"127.0.0.1:9001","certificate":"c"}}"#;
        let a: TrustAnnouncement = serde_json::from_str(json).unwrap();
        assert!(!a.fan_out);
    }
}
