//! Upgrade-time handshake validation.
//!
//! Runs inside the WebSocket upgrade callback, before any frame is read:
//! 1. Check the protocol version (header `x-rgate-version` or query `v`)
//! 2. Pick the session id: resume token (header `x-rgate-resume` or query
//!    `resume`) or the request path (`/<id>`)
//! 3. Ask the session manager to admit the connection
//!
//! A refusal is answered with a plain HTTP error and no session is touched.

use crate::session::{Admission, AdmitError, SessionManager};
use rgate_core::PROTOCOL_VERSION;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::debug;

pub const VERSION_HEADER: &str = "x-rgate-version";
pub const RESUME_HEADER: &str = "x-rgate-resume";

const MAX_SESSION_ID_LEN: usize = 128;

/// What the client asked for in its upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: Option<String>,
    pub resume: Option<String>,
    pub session_id: Option<String>,
}

impl HandshakeRequest {
    pub fn from_request(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let query = request.uri().query().unwrap_or("");
        let param = |key: &str| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .filter(|v| !v.is_empty())
        };
        let path = request.uri().path().trim_matches('/');

        Self {
            version: header(VERSION_HEADER).or_else(|| param("v")),
            resume: header(RESUME_HEADER).or_else(|| param("resume")),
            session_id: (!path.is_empty()).then(|| path.to_string()),
        }
    }
}

/// A refused upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.reason));
        *response.status_mut() = self.status;
        response
    }
}

impl From<AdmitError> for Rejection {
    fn from(err: AdmitError) -> Self {
        let status = match err {
            AdmitError::NotFound(_) => StatusCode::NOT_FOUND,
            AdmitError::Expired(_) => StatusCode::GONE,
            AdmitError::Duplicate(_) => StatusCode::CONFLICT,
            AdmitError::Full(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Rejection::new(status, err.to_string())
    }
}

/// Validate a handshake and admit it.
pub fn negotiate(
    sessions: &SessionManager,
    handshake: &HandshakeRequest,
) -> Result<Admission, Rejection> {
    if let Some(version) = &handshake.version {
        if version != PROTOCOL_VERSION {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                format!("unsupported protocol version: {version} (expected {PROTOCOL_VERSION})"),
            ));
        }
    }

    for id in [&handshake.resume, &handshake.session_id].into_iter().flatten() {
        if !valid_session_id(id) {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                format!("invalid session id: {id}"),
            ));
        }
    }

    debug!(?handshake, "negotiating handshake");
    match (&handshake.resume, &handshake.session_id) {
        (Some(resume), Some(path)) if resume != path => Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "resume token does not match the session path",
        )),
        (Some(resume), _) => sessions.admit(Some(resume), true).map_err(Rejection::from),
        (None, path) => sessions.admit(path.as_deref(), false).map_err(Rejection::from),
    }
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Timeouts, TunnelSettings};
    use crate::dispatch::RequestDispatcher;
    use crate::tunnel::pool::tests::{pool_with, FakeConnector};
    use std::sync::Arc;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(
            pool_with(Arc::new(FakeConnector::default())),
            RequestDispatcher::new(&TunnelSettings::default()),
            Timeouts::default(),
            8,
        )
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn parses_query_parameters() {
        let hs = HandshakeRequest::from_request(&request("/bot-1?v=rgate-v1&resume=bot-1", &[]));
        assert_eq!(
            hs,
            HandshakeRequest {
                version: Some("rgate-v1".into()),
                resume: Some("bot-1".into()),
                session_id: Some("bot-1".into()),
            }
        );
    }

    #[test]
    fn headers_win_over_query() {
        let hs = HandshakeRequest::from_request(&request(
            "/?v=old",
            &[(VERSION_HEADER, "rgate-v1"), (RESUME_HEADER, "abc")],
        ));
        assert_eq!(hs.version.as_deref(), Some("rgate-v1"));
        assert_eq!(hs.resume.as_deref(), Some("abc"));
        assert_eq!(hs.session_id, None);
    }

    #[tokio::test]
    async fn wrong_version_is_bad_request() {
        let sessions = manager();
        let hs = HandshakeRequest {
            version: Some("rgate-v0".into()),
            ..Default::default()
        };
        let rejection = negotiate(&sessions, &hs).unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn missing_version_is_accepted() {
        let sessions = manager();
        let admission = negotiate(&sessions, &HandshakeRequest::default()).unwrap();
        assert!(!admission.is_resume());
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn resume_of_unknown_session_is_not_found() {
        let sessions = manager();
        let hs = HandshakeRequest {
            resume: Some("ghost".into()),
            ..Default::default()
        };
        assert_eq!(
            negotiate(&sessions, &hs).unwrap_err().status,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn second_connection_for_live_id_conflicts() {
        let sessions = manager();
        let hs = HandshakeRequest {
            session_id: Some("bot-1".into()),
            ..Default::default()
        };
        negotiate(&sessions, &hs).unwrap();
        assert_eq!(
            negotiate(&sessions, &hs).unwrap_err().status,
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn rejects_odd_ids_and_mismatches() {
        let sessions = manager();
        let bad_id = HandshakeRequest {
            session_id: Some("a/b c".into()),
            ..Default::default()
        };
        assert_eq!(
            negotiate(&sessions, &bad_id).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        let mismatch = HandshakeRequest {
            resume: Some("one".into()),
            session_id: Some("two".into()),
            ..Default::default()
        };
        assert_eq!(
            negotiate(&sessions, &mismatch).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn rejection_becomes_http_response() {
        let response = Rejection::from(AdmitError::Expired("s1".into())).into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(response.body().as_deref(), Some("session s1 expired"));
    }
}
