//! russh-backed connector.

use super::connector::{BoxFuture, ExecOutput, SshConnector, SshLink, TunnelKey};
use super::credential::{Credential, CredentialSecret};
use async_trait::async_trait;
use rgate_core::{GatewayError, GatewayResult};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client handler that accepts any host key.
///
/// Host keys are not pinned; every accepted key is logged with its fingerprint.
struct HostKeyLogger {
    host: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting unverified SSH host key"
        );
        Ok(true)
    }
}

/// Opens real SSH connections with russh.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConnector for RusshConnector {
    fn connect<'a>(
        &'a self,
        key: &'a TunnelKey,
        credential: &'a Credential,
    ) -> BoxFuture<'a, GatewayResult<Arc<dyn SshLink>>> {
        Box::pin(async move {
            let handler = HostKeyLogger {
                host: key.host.clone(),
            };
            let mut handle = client::connect(self.config.clone(), (key.host.as_str(), key.port), handler)
                .await
                .map_err(|e| GatewayError::TunnelEstablish(format!("connect {key}: {e}")))?;

            let authenticated = match &credential.secret {
                CredentialSecret::Password(password) => handle
                    .authenticate_password(credential.username.as_str(), password.as_str())
                    .await,
                CredentialSecret::KeyFile { path, passphrase } => {
                    let pair = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                        GatewayError::TunnelEstablish(format!(
                            "cannot load key {}: {e}",
                            path.display()
                        ))
                    })?;
                    handle
                        .authenticate_publickey(credential.username.as_str(), Arc::new(pair))
                        .await
                }
            }
            .map_err(|e| GatewayError::TunnelEstablish(format!("auth {key}: {e}")))?;

            if !authenticated {
                return Err(GatewayError::TunnelEstablish(format!(
                    "authentication rejected for {}",
                    credential.username
                )));
            }

            info!(tunnel = %key, "SSH connection established");
            Ok(Arc::new(RusshLink { handle }) as Arc<dyn SshLink>)
        })
    }
}

struct RusshLink {
    handle: Handle<HostKeyLogger>,
}

impl SshLink for RusshLink {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, GatewayResult<ExecOutput>> {
        Box::pin(async move {
            let mut channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| GatewayError::Transport(format!("open session channel: {e}")))?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| GatewayError::Transport(format!("exec request: {e}")))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    _ => {}
                }
            }
            debug!(command, ?exit_code, "remote command finished");

            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            })
        })
    }

    fn probe(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            if self.handle.is_closed() {
                return Err(GatewayError::Transport("SSH connection closed".into()));
            }
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| GatewayError::Transport(format!("probe channel: {e}")))?;
            channel
                .close()
                .await
                .map_err(|e| GatewayError::Transport(format!("probe close: {e}")))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self
                .handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(error = %e, "SSH disconnect failed");
            }
        })
    }
}
