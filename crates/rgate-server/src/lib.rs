//! rgate-server: remote session gateway.
//!
//! Clients hold a WebSocket control channel to the gateway; requests that
//! reach remote hosts run over pooled SSH tunnels.
//!
//! - `config`: TOML config file plus CLI overrides
//! - `channel`: WebSocket control channel (ordered writer, decoding reader)
//! - `heartbeat`: ping/pong liveness per channel
//! - `tunnel`: SSH tunnel pool, connector seam and credentials
//! - `session`: session lifecycle, correlation and reconnect buffering
//! - `dispatch`: built-in request operations
//! - `handshake`: upgrade-time validation and admission
//! - `gateway`: accept loop and shutdown

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod handshake;
pub mod heartbeat;
pub mod session;
pub mod tunnel;

pub use config::{ConfigOverrides, GatewayConfig, Timeouts};
pub use dispatch::{RequestDispatcher, RequestHandler};
pub use gateway::Gateway;
pub use session::{SessionEvent, SessionManager, SessionState};
pub use tunnel::{SshConnector, TunnelPool};
