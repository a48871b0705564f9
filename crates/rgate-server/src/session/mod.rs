//! Session management: lifecycle state machine, correlation, reconnect buffering.

pub mod manager;
pub mod pending;
pub mod state;

pub use manager::{
    Admission, AdmitError, CloseReason, SessionEvent, SessionInfo, SessionManager, CLOSED_EVENT,
    HANDSHAKE_TIMEOUT, READY_EVENT,
};
pub use state::SessionState;
