//! MicroCluster — a reusable substrate for building small, self-organizing
//! clusters of daemons that share a replicated state store and expose an
//! mTLS REST control plane.
//!
//! Every node runs the same binary; a cluster forms by one node
//! bootstrapping and others joining with a short-lived token. The embedding
//! application supplies lifecycle [`hooks::Hooks`] and optional extended
//! endpoints; everything else — membership, truststores, heartbeats,
//! removal, recovery — is handled here.
//!
//! Module map:
//!
//! | Module       | Responsibility                                       |
//! |--------------|------------------------------------------------------|
//! | `state_dir`  | On-disk layout of the state directory                |
//! | `config`     | `daemon.yaml`                                        |
//! | `tls`        | Keypairs, fingerprints, rustls configs               |
//! | `truststore` | File-backed peer certificate set                     |
//! | `raft`       | Embedded replicated store engine (openraft)          |
//! | `db`         | Store facade: ready gate, transactions, schema pair  |
//! | `members`    | The `cluster_members` table                          |
//! | `tokens`     | Join tokens                                          |
//! | `client`     | Outbound mTLS / unix-socket clients                  |
//! | `endpoints`  | Request plane: classes, trust, leader forwarding     |
//! | `api`        | Built-in endpoint handlers                           |
//! | `server`     | Listener plumbing                                    |
//! | `join`       | Bootstrap and the join protocol                      |
//! | `heartbeat`  | Leader rounds and the follower apply path            |
//! | `remove`     | Removal and offline quorum-loss recovery             |
//! | `hooks`      | Application lifecycle hooks                          |
//! | `daemon`     | Supervisor and shared state                          |

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod db;
pub mod endpoints;
pub mod errors;
pub mod heartbeat;
pub mod hooks;
pub mod join;
pub mod members;
pub mod raft;
pub mod remove;
pub mod server;
pub mod state_dir;
pub mod tls;
pub mod tokens;
pub mod truststore;

pub use daemon::{Daemon, State};
pub use errors::{Error, Result};
pub use hooks::{Hooks, NoopHooks};
