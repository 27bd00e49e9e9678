//! Built-in endpoint handlers for the control, public, and internal
//! surfaces, plus the registry wiring them to their URL classes.
//!
//! Handlers assume the request plane already resolved trust and leader
//! placement: a `proxy_target` handler only ever runs on the leader.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::daemon::State;
use crate::endpoints::{
    empty_response, force_param, json_response, query_param, read_json, Class, Endpoint,
    HandlerFuture, MethodSpec, Registry, RequestContext,
};
use crate::errors::{Error, Result};
use crate::heartbeat::{self, HeartbeatInfo};
use crate::join::{self, TrustAnnouncement};
use crate::members::MemberInfo;
use crate::raft::Command;
use crate::remove::{self, HookRequest};
use crate::tokens::{self, JoinRequest};

/// Assemble the full built-in endpoint set.
pub fn build_registry() -> Registry {
    let mut registry = Registry::new();

    // ── Control socket ────────────────────────────────────────────────────
    registry.register(Endpoint {
        class: Class::Control,
        path: "",
        methods: vec![
            MethodSpec::new(Method::POST, control_init),
            MethodSpec::new(Method::PUT, control_config_update),
        ],
    });
    registry.register(Endpoint {
        class: Class::Control,
        path: "shutdown",
        methods: vec![MethodSpec::new(Method::POST, control_shutdown)],
    });
    registry.register(Endpoint {
        class: Class::Control,
        path: "ready",
        methods: vec![MethodSpec::new(Method::GET, control_ready)],
    });
    registry.register(Endpoint {
        class: Class::Control,
        path: "sql",
        methods: vec![
            MethodSpec::new(Method::GET, control_sql),
            MethodSpec::new(Method::POST, control_sql),
        ],
    });
    registry.register(Endpoint {
        class: Class::Control,
        path: "cluster",
        methods: vec![MethodSpec::new(Method::GET, cluster_list)],
    });

    // ── Public ────────────────────────────────────────────────────────────
    registry.register(Endpoint {
        class: Class::Public,
        path: "",
        methods: vec![MethodSpec::new(Method::GET, server_info).allow_untrusted()],
    });
    registry.register(Endpoint {
        class: Class::Public,
        path: "ready",
        methods: vec![MethodSpec::new(Method::GET, public_ready)],
    });
    registry.register(Endpoint {
        class: Class::Public,
        path: "cluster",
        methods: vec![
            MethodSpec::new(Method::GET, cluster_list),
            MethodSpec::new(Method::POST, cluster_join).allow_untrusted().proxy_target(),
        ],
    });
    registry.register(Endpoint {
        class: Class::Public,
        path: "cluster/{name}",
        methods: vec![MethodSpec::new(Method::DELETE, cluster_remove).proxy_target()],
    });
    registry.register(Endpoint {
        class: Class::Public,
        path: "tokens",
        methods: vec![
            MethodSpec::new(Method::GET, tokens_list),
            MethodSpec::new(Method::POST, tokens_issue).proxy_target(),
        ],
    });
    registry.register(Endpoint {
        class: Class::Public,
        path: "tokens/{name}",
        methods: vec![MethodSpec::new(Method::DELETE, tokens_revoke).proxy_target()],
    });

    // ── Internal ──────────────────────────────────────────────────────────
    registry.register(Endpoint {
        class: Class::Internal,
        path: "cluster",
        methods: vec![MethodSpec::new(Method::POST, cluster_join)
            .allow_untrusted()
            .proxy_target()],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "cluster/{name}",
        methods: vec![MethodSpec::new(Method::DELETE, cluster_remove).proxy_target()],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "heartbeat",
        methods: vec![MethodSpec::new(Method::POST, internal_heartbeat)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "trust",
        methods: vec![MethodSpec::new(Method::POST, internal_trust)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "store",
        methods: vec![MethodSpec::new(Method::POST, internal_store)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "hooks/{name}",
        methods: vec![MethodSpec::new(Method::POST, internal_hooks)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "database",
        methods: vec![MethodSpec::new(Method::GET, internal_database)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "raft/append-entries",
        methods: vec![MethodSpec::new(Method::POST, raft_append_entries)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "raft/vote",
        methods: vec![MethodSpec::new(Method::POST, raft_vote)],
    });
    registry.register(Endpoint {
        class: Class::Internal,
        path: "raft/snapshot",
        methods: vec![MethodSpec::new(Method::POST, raft_snapshot)],
    });

    registry
}

// ── Control handlers ──────────────────────────────────────────────────────────

/// Body of `POST /core/control`: bootstrap or join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlInit {
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub join_token: Option<String>,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub init_config: BTreeMap<String, String>,
}

fn control_init(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let init: ControlInit = read_json(req).await?;
        match (init.bootstrap, &init.join_token) {
            (true, Some(_)) => Err(Error::Conflict(
                "bootstrap and join_token are mutually exclusive".into(),
            )),
            (true, None) => {
                join::bootstrap(&state, &init.name, &init.address, &init.init_config).await?;
                empty_response()
            }
            (false, Some(token)) => {
                join::join(&state, token, &init.name, &init.address).await?;
                empty_response()
            }
            (false, None) => Err(Error::Conflict(
                "either bootstrap or join_token is required".into(),
            )),
        }
    })
}

fn control_config_update(
    state: Arc<State>,
    _ctx: RequestContext,
    req: Request<Body>,
) -> HandlerFuture {
    Box::pin(async move {
        let update: crate::config::DaemonConfig = read_json(req).await?;
        if !state.is_initialized() {
            return Err(Error::NotReady);
        }
        if update.name != state.name() || update.address != state.address() {
            return Err(Error::Conflict(
                "name and address cannot change after initialization".into(),
            ));
        }
        state.set_config(update.clone())?;
        crate::hooks::run("on_daemon_config_update", state.shutdown_rx(), || {
            state.hooks.on_daemon_config_update(&state, &update)
        })
        .await?;
        empty_response()
    })
}

fn control_shutdown(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        info!("Shutdown requested");
        state.trigger_shutdown();
        empty_response()
    })
}

fn control_ready(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let timeout = query_param(&req, "timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(30);
        state.db.wait_ready(Duration::from_secs(timeout)).await?;
        empty_response()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SqlQuery {
    query: String,
}

fn control_sql(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let query = if req.method() == Method::GET {
            query_param(&req, "query").unwrap_or_default()
        } else {
            read_json::<SqlQuery>(req).await?.query
        };
        if query.is_empty() {
            return Err(Error::Conflict("empty query".into()));
        }
        json_response(&state.db.execute_sql(&query)?)
    })
}

// ── Public handlers ───────────────────────────────────────────────────────────

/// The `GET /core/1.0` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    pub version: String,
    pub ready: bool,
    pub api_extensions: Vec<String>,
    pub schema_internal: u64,
    pub schema_external: u64,
}

fn server_info(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let (schema_internal, schema_external) = crate::db::Db::schema_pair();
        json_response(&ServerInfo {
            name: state.name(),
            address: state.address(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ready: state.db.is_open(),
            api_extensions: state.extensions.clone(),
            schema_internal,
            schema_external,
        })
    })
}

fn public_ready(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        if !state.db.is_open() {
            return Err(Error::NotReady);
        }
        empty_response()
    })
}

fn cluster_list(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        if !state.db.is_open() {
            return Err(Error::NotReady);
        }
        let members: Vec<MemberInfo> = state.members_info();
        json_response(&members)
    })
}

fn cluster_join(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let request: JoinRequest = read_json(req).await?;
        let response = join::handle_join_request(&state, request).await?;
        json_response(&response)
    })
}

fn cluster_remove(state: Arc<State>, ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let name = ctx
            .param
            .ok_or_else(|| Error::Conflict("member name missing".into()))?;
        let force = force_param(&req);
        remove::handle_remove(&state, &name, force).await?;
        empty_response()
    })
}

/// Body of `POST /core/1.0/tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIssueRequest {
    pub name: String,
    /// Seconds until expiry; omitted = never expires.
    #[serde(default)]
    pub expiry_seconds: Option<u64>,
}

fn tokens_issue(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let request: TokenIssueRequest = read_json(req).await?;
        let fingerprint = state.fingerprint()?;
        let token = tokens::issue(
            &state.db,
            &request.name,
            request.expiry_seconds.map(Duration::from_secs),
            &fingerprint,
        )
        .await?;
        json_response(&serde_json::json!({ "token": token }))
    })
}

fn tokens_list(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        if !state.db.is_open() {
            return Err(Error::NotReady);
        }
        json_response(&tokens::list(&state.db, &state.fingerprint()?)?)
    })
}

fn tokens_revoke(state: Arc<State>, ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let name = ctx
            .param
            .ok_or_else(|| Error::Conflict("token name missing".into()))?;
        tokens::revoke(&state.db, &name).await?;
        empty_response()
    })
}

// ── Internal handlers ─────────────────────────────────────────────────────────

fn internal_heartbeat(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let info: HeartbeatInfo = read_json(req).await?;
        heartbeat::handle(&state, info).await?;
        empty_response()
    })
}

fn internal_trust(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let announcement: TrustAnnouncement = read_json(req).await?;
        join::handle_trust_announcement(&state, announcement).await?;
        empty_response()
    })
}

fn internal_store(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let commands: Vec<Command> = read_json(req).await?;
        state.db.apply_local(commands).await?;
        empty_response()
    })
}

fn internal_hooks(state: Arc<State>, ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let hook = ctx
            .param
            .ok_or_else(|| Error::Conflict("hook name missing".into()))?;
        let request: HookRequest = read_json(req).await?;
        match hook.as_str() {
            "pre-remove" => {
                crate::hooks::run("pre_remove", state.shutdown_rx(), || {
                    state.hooks.pre_remove(&state, request.force)
                })
                .await?
            }
            "post-remove" => {
                // The member table already lost the departed row; our
                // truststore follows before the application hook runs.
                state.truststore.replace_all(crate::join::trust_entries(
                    state.db.snapshot().members.values(),
                ))?;
                state.refresh_pool()?;
                crate::hooks::run("post_remove", state.shutdown_rx(), || {
                    state.hooks.post_remove(&state, request.force)
                })
                .await?
            }
            other => return Err(Error::Conflict(format!("unknown hook {:?}", other))),
        }
        empty_response()
    })
}

fn internal_database(state: Arc<State>, _ctx: RequestContext, _req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        if !state.db.is_open() {
            return Err(Error::NotReady);
        }
        empty_response()
    })
}

// Raft transport: each handler decodes the payload, hands it to the local
// raft instance, and returns the JSON-encoded response.

fn raft_append_entries(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let rpc: openraft::raft::AppendEntriesRequest<crate::raft::TypeConfig> =
            read_json(req).await?;
        let engine = state.db.raft_engine()?;
        let resp = engine
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Error::Fatal(format!("raft append-entries failed: {}", e)))?;
        json_response(&resp)
    })
}

fn raft_vote(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let rpc: openraft::raft::VoteRequest<crate::raft::NodeId> = read_json(req).await?;
        let engine = state.db.raft_engine()?;
        let resp = engine
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Error::Fatal(format!("raft vote failed: {}", e)))?;
        json_response(&resp)
    })
}

fn raft_snapshot(state: Arc<State>, _ctx: RequestContext, req: Request<Body>) -> HandlerFuture {
    Box::pin(async move {
        let rpc: openraft::raft::InstallSnapshotRequest<crate::raft::TypeConfig> =
            read_json(req).await?;
        let engine = state.db.raft_engine()?;
        let resp = engine
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Error::Fatal(format!("raft snapshot failed: {}", e)))?;
        json_response(&resp)
    })
}
