//! Error kinds shared across the daemon.
//!
//! Every failure is classified into one of six kinds with a stable HTTP
//! status, so handlers can wrap low-level errors once and the request plane
//! can render a uniform JSON body. The wire encoding is
//! `{"type":"error","error":"...","error_code":N}` where `error_code` is the
//! HTTP status.
//!
//! | Kind      | Status | Recovery                                   |
//! |-----------|--------|--------------------------------------------|
//! | NotLeader | 403    | Request plane forwards to the leader       |
//! | NotReady  | 503    | Surfaced; caller waits for the ready gate  |
//! | Untrusted | 403    | Never recovered                            |
//! | Conflict  | 409    | Surfaced; state precondition violated      |
//! | Transient | 502    | Caller retries with backoff               |
//! | Fatal     | 500    | Daemon aborts the enclosing operation      |

use hyper::{Body, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type used by every fallible operation in the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// A leader-only operation ran on a non-leader node.
    #[error("not leader")]
    NotLeader,

    /// The replicated store is not open yet.
    #[error("database not ready")]
    NotReady,

    /// Authentication or authorization failure.
    #[error("untrusted: {0}")]
    Untrusted(String),

    /// A state precondition was violated (duplicate name, consumed token,
    /// would-lose-quorum).
    #[error("{0}")]
    Conflict(String),

    /// Network failure or lock contention; safe to retry with backoff.
    #[error("{0}")]
    Transient(String),

    /// Corrupt on-disk state, broken crypto, or a bug.
    #[error("{0}")]
    Fatal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// The HTTP status carried on the wire for this error kind.
    pub fn status(&self) -> u16 {
        match self {
            Error::NotLeader => 403,
            Error::NotReady => 503,
            Error::Untrusted(_) => 403,
            Error::Conflict(_) => 409,
            Error::Transient(_) => 502,
            Error::Fatal(_) | Error::Io(_) | Error::Serde(_) => 500,
        }
    }

    /// True for failures the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Render the stable JSON error body as an HTTP response.
    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = ErrorBody {
            kind: "error".to_string(),
            error: self.to_string(),
            error_code: status,
        };
        let json = serde_json::to_string(&body)
            .unwrap_or_else(|_| r#"{"type":"error","error":"internal","error_code":500}"#.into());
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(json))
            .expect("static response parts")
    }
}

/// Wire form of an error: `{"type":"error","error":"...","error_code":N}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: String,
    pub error_code: u16,
}

impl From<reqwest::Error> for Error {
    /// Categorize an outbound HTTP failure.
    ///
    /// Timeouts, connection failures, and body/decode errors are transient
    /// (the peer may be restarting); anything else is fatal to the operation.
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
            Error::Transient(format!("request failed: {}", e))
        } else {
            Error::Fatal(format!("request failed: {}", e))
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Fatal(format!("yaml error: {}", e))
    }
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Map a status + wire body received from a peer back into an [`Error`].
///
/// Used by the client pool so a forwarded failure keeps its kind instead of
/// collapsing into Transient.
pub fn from_wire(status: u16, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    match status {
        403 if message.contains("not leader") => Error::NotLeader,
        403 => Error::Untrusted(message),
        409 => Error::Conflict(message),
        502 | 504 => Error::Transient(message),
        503 => Error::NotReady,
        _ => Error::Fatal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::NotLeader.status(), 403);
        assert_eq!(Error::NotReady.status(), 503);
        assert_eq!(Error::Untrusted("x".into()).status(), 403);
        assert_eq!(Error::Conflict("dup".into()).status(), 409);
        assert_eq!(Error::Transient("net".into()).status(), 502);
        assert_eq!(Error::Fatal("bug".into()).status(), 500);
    }

    #[test]
    fn wire_body_shape() {
        let body = ErrorBody {
            kind: "error".into(),
            error: "would lose quorum".into(),
            error_code: 409,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""error_code":409"#));
    }

    #[test]
    fn wire_roundtrip_preserves_kind() {
        let json = serde_json::to_vec(&ErrorBody {
            kind: "error".into(),
            error: "token already consumed".into(),
            error_code: 409,
        })
        .unwrap();
        assert!(matches!(from_wire(409, &json), Error::Conflict(_)));
        assert!(matches!(from_wire(503, b"busy"), Error::NotReady));
        assert!(matches!(from_wire(502, b"down"), Error::Transient(_)));
    }

    #[test]
    fn not_leader_roundtrip() {
        let json = serde_json::to_vec(&ErrorBody {
            kind: "error".into(),
            error: "not leader".into(),
            error_code: 403,
        })
        .unwrap();
        assert!(matches!(from_wire(403, &json), Error::NotLeader));
        assert!(matches!(
            from_wire(403, b"untrusted: no certificate"),
            Error::Untrusted(_)
        ));
    }

    #[test]
    fn response_rendering() {
        let resp = Error::Conflict("duplicate member name".into()).into_response();
        assert_eq!(resp.status(), 409);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
