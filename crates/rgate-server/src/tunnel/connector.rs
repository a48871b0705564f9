//! Abstract SSH connection seam used by the tunnel pool.
//!
//! The production implementation lives in [`super::ssh`]; tests plug in
//! in-memory fakes.

use super::credential::Credential;
use rgate_core::GatewayResult;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Pool key: one tunnel per (host, port, credential id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelKey {
    pub host: String,
    pub port: u16,
    pub credential_id: String,
}

impl TunnelKey {
    pub fn new(host: impl Into<String>, port: u16, credential_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            credential_id: credential_id.into(),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.credential_id, self.host, self.port)
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// An established SSH connection.
pub trait SshLink: Send + Sync {
    /// Run `command` on the remote host and collect its output.
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, GatewayResult<ExecOutput>>;

    /// Cheap liveness check.
    fn probe(&self) -> BoxFuture<'_, GatewayResult<()>>;

    /// Disconnect. Errors are swallowed; the link is unusable afterwards.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Establishes SSH connections.
pub trait SshConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        key: &'a TunnelKey,
        credential: &'a Credential,
    ) -> BoxFuture<'a, GatewayResult<Arc<dyn SshLink>>>;
}
