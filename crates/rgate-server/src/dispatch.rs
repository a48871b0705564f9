//! Built-in request operations and the hook for custom ones.

use crate::config::TunnelSettings;
use crate::session::SessionManager;
use crate::tunnel::connector::BoxFuture;
use crate::tunnel::TunnelKey;
use rgate_core::messages::RequestPayload;
use rgate_core::{GatewayError, GatewayResult};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const OP_PING_REMOTE: &str = "ping-remote";
pub const OP_EXEC: &str = "exec";
pub const OP_SESSION_INFO: &str = "session.info";
pub const OP_SESSION_CLOSE: &str = "session.close";

/// Handles request ops the gateway does not implement itself.
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        session_id: &'a str,
        request: &'a RequestPayload,
    ) -> BoxFuture<'a, GatewayResult<Value>>;
}

/// Routes one inbound request to its operation.
pub struct RequestDispatcher {
    default_credential: Option<String>,
    default_port: u16,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl RequestDispatcher {
    pub fn new(tunnels: &TunnelSettings) -> Self {
        Self {
            default_credential: tunnels.default_credential.clone(),
            default_port: tunnels.default_port,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub async fn dispatch(
        &self,
        sessions: &SessionManager,
        session_id: &str,
        request: &RequestPayload,
    ) -> GatewayResult<Value> {
        match request.op.as_str() {
            OP_PING_REMOTE => self.ping_remote(sessions, session_id, &request.args).await,
            OP_EXEC => self.exec(sessions, session_id, &request.args).await,
            OP_SESSION_INFO => Ok(serde_json::to_value(sessions.info(session_id)?)?),
            // The worker closes the session once this reply is on the wire.
            OP_SESSION_CLOSE => Ok(json!({ "closing": true })),
            _ => match &self.handler {
                Some(handler) => handler.handle(session_id, request).await,
                None => Err(GatewayError::UnsupportedOperation(request.op.clone())),
            },
        }
    }

    /// Resolve `{host, port?, credential?}` into a pool key.
    fn target(&self, args: &Map<String, Value>) -> GatewayResult<TunnelKey> {
        let host = args
            .get("host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::MalformedMessage("`host` is required".into()))?;

        let port = match args.get("port") {
            None | Some(Value::Null) => self.default_port,
            Some(v) => v
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0)
                .ok_or_else(|| GatewayError::MalformedMessage(format!("invalid port {v}")))?,
        };

        let credential = match args.get("credential") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            None | Some(Value::Null) => self.default_credential.clone().ok_or_else(|| {
                GatewayError::TunnelEstablish(format!("no credential configured for {host}"))
            })?,
            Some(other) => {
                return Err(GatewayError::MalformedMessage(format!(
                    "invalid credential {other}"
                )))
            }
        };

        Ok(TunnelKey::new(host, port, credential))
    }

    async fn ping_remote(
        &self,
        sessions: &SessionManager,
        session_id: &str,
        args: &Map<String, Value>,
    ) -> GatewayResult<Value> {
        let key = self.target(args)?;
        let started = Instant::now();
        let handle = sessions.borrow_tunnel(session_id, key.clone()).await?;
        let reachable = match sessions.pool().probe(&handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id, tunnel = %key, error = %e, "remote probe failed");
                sessions.release_tunnel(session_id).await;
                false
            }
        };
        Ok(json!({
            "host": key.host,
            "port": key.port,
            "reachable": reachable,
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
    }

    async fn exec(
        &self,
        sessions: &SessionManager,
        session_id: &str,
        args: &Map<String, Value>,
    ) -> GatewayResult<Value> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::MalformedMessage("`command` is required".into()))?;
        let key = self.target(args)?;

        // A tunnel invalidated by another borrower is retried once on a
        // fresh acquire.
        let mut retried = false;
        loop {
            let handle = sessions.borrow_tunnel(session_id, key.clone()).await?;
            match sessions.pool().exec(&handle, command).await {
                Ok(output) => {
                    debug!(session_id, tunnel = %key, exit_code = ?output.exit_code, "exec finished");
                    return Ok(serde_json::to_value(output)?);
                }
                Err(GatewayError::TunnelInvalidated(_)) if !retried => {
                    sessions.release_tunnel(session_id).await;
                    retried = true;
                }
                Err(e) => {
                    sessions.release_tunnel(session_id).await;
                    return Err(e);
                }
            }
        }
    }
}
