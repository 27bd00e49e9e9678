//! The replicated `cluster_members` table: row type, roles, and derived
//! status views.
//!
//! Role lifecycle of a member:
//!
//! ```text
//! absent → PENDING (token redeemed)
//!        → voter | stand-by | spare   (first heartbeat after raft admission)
//!        → absent (removed)
//! ```
//!
//! `PENDING` is deliberately outside the raft role set: it marks a member
//! admitted by token redemption that the replicated store does not know yet.
//! Only the leader moves a member out of PENDING, during heartbeat
//! reconciliation.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Application-level role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "voter")]
    Voter,
    #[serde(rename = "stand-by")]
    StandBy,
    #[serde(rename = "spare")]
    Spare,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "PENDING",
            Role::Voter => "voter",
            Role::StandBy => "stand-by",
            Role::Spare => "spare",
        }
    }

    /// Raft-assigned roles, i.e. everything except PENDING.
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Role::Pending)
    }
}

/// Liveness of a member as derived from its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "PENDING")]
    Pending,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "ONLINE",
            Status::Offline => "OFFLINE",
            Status::Pending => "PENDING",
        }
    }
}

/// One row of the replicated `cluster_members` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub address: String,
    /// PEM server certificate presented by this member.
    pub certificate: String,
    pub role: Role,
    pub schema_internal: u64,
    pub schema_external: u64,
    #[serde(default)]
    pub api_extensions: Vec<String>,
    /// Milliseconds since the epoch of the last heartbeat touch; 0 = never.
    #[serde(default)]
    pub last_heartbeat: u64,
}

impl Member {
    /// Derive liveness. `is_self` short-circuits to ONLINE: the node
    /// answering the query is alive by definition, and a single-node
    /// cluster's leader never receives fan-out heartbeats.
    pub fn status(&self, interval: Duration, is_self: bool) -> Status {
        if self.role == Role::Pending {
            return Status::Pending;
        }
        if is_self {
            return Status::Online;
        }
        let threshold = interval * 2;
        if now_ms().saturating_sub(self.last_heartbeat) <= threshold.as_millis() as u64 {
            Status::Online
        } else {
            Status::Offline
        }
    }
}

/// Wire view of a member row, as returned by the cluster list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub address: String,
    pub certificate: String,
    pub role: Role,
    pub status: Status,
    pub schema_internal: u64,
    pub schema_external: u64,
    pub api_extensions: Vec<String>,
    pub last_heartbeat: u64,
}

impl MemberInfo {
    pub fn new(member: &Member, interval: Duration, local_name: &str) -> Self {
        Self {
            name: member.name.clone(),
            address: member.address.clone(),
            certificate: member.certificate.clone(),
            role: member.role,
            status: member.status(interval, member.name == local_name),
            schema_internal: member.schema_internal,
            schema_external: member.schema_external,
            api_extensions: member.api_extensions.clone(),
            last_heartbeat: member.last_heartbeat,
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Addresses of all non-pending members, the set a token advertises as join
/// candidates.
pub fn assigned_addresses(members: &BTreeMap<String, Member>) -> Vec<String> {
    members
        .values()
        .filter(|m| m.role.is_assigned())
        .map(|m| m.address.clone())
        .collect()
}

/// Highest `(internal, external)` schema pair across non-pending members.
pub fn max_schema(members: &BTreeMap<String, Member>) -> (u64, u64) {
    let mut max = (0, 0);
    for m in members.values().filter(|m| m.role.is_assigned()) {
        max.0 = max.0.max(m.schema_internal);
        max.1 = max.1.max(m.schema_external);
    }
    max
}
