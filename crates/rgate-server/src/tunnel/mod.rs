//! SSH tunnel subsystem.
//!
//! - **[`pool`]**: the [`TunnelPool`]: per-key serialized acquire/release,
//!   invalidation, idle reaping and health checks.
//! - **[`connector`]**: the [`SshConnector`]/[`SshLink`] seam the pool talks to.
//! - **[`ssh`]**: the russh implementation of that seam.
//! - **[`credential`]**: credential ids and the store that resolves them.

pub mod connector;
pub mod credential;
pub mod pool;
pub mod ssh;

pub use connector::{ExecOutput, SshConnector, SshLink, TunnelKey};
pub use credential::{Credential, CredentialSecret, CredentialStore};
pub use pool::{TunnelHandle, TunnelHealth, TunnelPool, TunnelStats};
pub use ssh::RusshConnector;
