use rgate_core::{GatewayError, GatewayResult};
use serde::Serialize;
use std::fmt;

/// Lifecycle state of a session.
///
/// ```text
/// Connecting ──► Active ◄──► Suspended
///     │            │             │
///     │            ▼             ▼
///     │         Draining ◄───────┘
///     ▼            │
///   Closed ◄───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Suspended,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Suspended)
                | (Active, Draining)
                | (Suspended, Active)
                | (Suspended, Draining)
                | (Draining, Closed)
        )
    }

    /// Whether envelopes for this session are still deliverable, either
    /// directly or through the reconnect buffer.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Active | SessionState::Suspended
        )
    }

    /// Move to `next`, refusing edges the lifecycle does not have.
    pub fn advance(&mut self, next: SessionState) -> GatewayResult<()> {
        if !self.can_transition_to(next) {
            return Err(GatewayError::Other(format!(
                "invalid session transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = SessionState::Connecting;
        s.advance(SessionState::Active).unwrap();
        s.advance(SessionState::Suspended).unwrap();
        s.advance(SessionState::Active).unwrap();
        s.advance(SessionState::Draining).unwrap();
        s.advance(SessionState::Closed).unwrap();
        assert_eq!(s, SessionState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        for next in [
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Suspended,
            SessionState::Draining,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn draining_cannot_resume() {
        let mut s = SessionState::Draining;
        assert!(s.advance(SessionState::Active).is_err());
        assert_eq!(s, SessionState::Draining);
    }

    #[test]
    fn handshake_failure_closes_directly() {
        assert!(SessionState::Connecting.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Suspended));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionState::Suspended).unwrap(),
            "\"suspended\""
        );
    }
}
