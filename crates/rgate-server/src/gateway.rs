//! Gateway façade: accepts WebSocket upgrades, runs the handshake and binds
//! each new control channel to its session.
//!
//! Owns the session manager and the tunnel pool, and coordinates their
//! background maintenance and shutdown.

use crate::channel;
use crate::config::GatewayConfig;
use crate::dispatch::{RequestDispatcher, RequestHandler};
use crate::handshake::{self, HandshakeRequest};
use crate::session::{Admission, SessionManager, HANDSHAKE_TIMEOUT};
use crate::tunnel::{RusshConnector, SshConnector, TunnelPool};
use rgate_core::GatewayResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The gateway instance.
pub struct Gateway {
    config: GatewayConfig,
    sessions: Arc<SessionManager>,
    pool: Arc<TunnelPool>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway that reaches remote hosts over russh.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_parts(config, Arc::new(RusshConnector::new()), None)
    }

    /// Create a gateway with a custom SSH connector and an optional handler
    /// for request ops the dispatcher does not know.
    pub fn with_parts(
        config: GatewayConfig,
        connector: Arc<dyn SshConnector>,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Self {
        let pool = Arc::new(TunnelPool::new(
            connector,
            Arc::new(config.credentials.clone()),
            config.timeouts.tunnel_idle_grace,
            config.timeouts.tunnel_connect_timeout,
        ));
        let mut dispatcher = RequestDispatcher::new(&config.tunnels);
        if let Some(handler) = handler {
            dispatcher = dispatcher.with_handler(handler);
        }
        let sessions = SessionManager::new(
            pool.clone(),
            dispatcher,
            config.timeouts,
            config.max_sessions,
        );
        Self {
            config,
            sessions,
            pool,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    /// Token that stops [`Gateway::serve`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then close every
    /// session and every tunnel.
    pub async fn serve(&self, listener: TcpListener) -> GatewayResult<()> {
        info!(addr = %listener.local_addr()?, "gateway listening");

        let session_maintenance = self.sessions.spawn_maintenance(self.shutdown.child_token());
        let pool_maintenance = self.pool.spawn_maintenance(
            self.config.tunnels.reaper_interval,
            self.config.tunnels.health_check_interval,
            self.shutdown.child_token(),
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(remote = %addr, "TCP connection accepted");
                        let sessions = self.sessions.clone();
                        tokio::spawn(handle_connection(sessions, stream, addr));
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
            }
        }

        info!("gateway shutting down");
        drop(listener);
        self.sessions.shutdown().await;
        self.pool.close_all().await;
        let _ = session_maintenance.await;
        let _ = pool_maintenance.await;
        info!("gateway stopped");
        Ok(())
    }
}

/// Upgrade one TCP connection. The handshake runs inside the upgrade
/// callback so a refused client gets a plain HTTP error.
async fn handle_connection(sessions: Arc<SessionManager>, stream: TcpStream, addr: SocketAddr) {
    let mut admission: Option<Admission> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let handshake = HandshakeRequest::from_request(request);
        match handshake::negotiate(&sessions, &handshake) {
            Ok(admitted) => {
                admission = Some(admitted);
                Ok(response)
            }
            Err(rejection) => {
                warn!(
                    remote = %addr,
                    status = %rejection.status,
                    reason = %rejection.reason,
                    "handshake rejected"
                );
                Err(rejection.into_response())
            }
        }
    };

    let accept = tokio_tungstenite::accept_hdr_async(stream, callback);
    let upgraded = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("upgrade timed out after {}s", HANDSHAKE_TIMEOUT.as_secs())),
    };
    match (upgraded, admission) {
        (Ok(ws), Some(admission)) => {
            let (handle, events) = channel::spawn(ws);
            if let Err(e) = sessions.bind(&admission, handle, events) {
                warn!(remote = %addr, session_id = admission.session_id(), error = %e, "cannot bind control channel");
                sessions.abandon(&admission);
            }
        }
        (Ok(_), None) => warn!(remote = %addr, "upgrade completed without admission"),
        (Err(e), Some(admission)) => {
            warn!(remote = %addr, session_id = admission.session_id(), error = %e, "WebSocket upgrade failed");
            sessions.abandon(&admission);
        }
        (Err(e), None) => debug!(remote = %addr, error = %e, "WebSocket upgrade refused"),
    }
}
