//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a reservation saga.
///
/// State transitions:
/// ```text
/// Init ──► LocalReserved ──► PeerChecking ──► Committed
///  │ │           │                 │
///  │ └───────────┴─────────────────┴──► Compensating ──► Compensated
///  └──► FailedUpfront
/// ```
/// `LocalReserved` commits directly when the request has no peer legs.
/// `FailedUpfront` means no leg was ever reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Validated; local legs are being reserved.
    #[default]
    Init,

    /// Every local leg is reserved.
    LocalReserved,

    /// Peer legs are being reserved.
    PeerChecking,

    /// Every leg was reserved and recorded (terminal state).
    Committed,

    /// A leg failed and reserved legs are being released.
    Compensating,

    /// Compensation finished after a failure (terminal state).
    Compensated,

    /// The first local leg failed; nothing was reserved (terminal state).
    FailedUpfront,
}

impl SagaState {
    /// Returns true if the local phase can finish.
    pub fn can_finish_local(&self) -> bool {
        matches!(self, SagaState::Init)
    }

    /// Returns true if peer legs can be requested.
    pub fn can_check_peers(&self) -> bool {
        matches!(self, SagaState::LocalReserved)
    }

    /// Returns true if the saga can commit.
    pub fn can_commit(&self) -> bool {
        matches!(self, SagaState::LocalReserved | SagaState::PeerChecking)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(
            self,
            SagaState::Init | SagaState::LocalReserved | SagaState::PeerChecking
        )
    }

    /// Returns true if the saga can end without having reserved anything.
    pub fn can_fail_upfront(&self) -> bool {
        matches!(self, SagaState::Init)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Committed | SagaState::Compensated | SagaState::FailedUpfront
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Init => "Init",
            SagaState::LocalReserved => "LocalReserved",
            SagaState::PeerChecking => "PeerChecking",
            SagaState::Committed => "Committed",
            SagaState::Compensating => "Compensating",
            SagaState::Compensated => "Compensated",
            SagaState::FailedUpfront => "FailedUpfront",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaState; 7] = [
        SagaState::Init,
        SagaState::LocalReserved,
        SagaState::PeerChecking,
        SagaState::Committed,
        SagaState::Compensating,
        SagaState::Compensated,
        SagaState::FailedUpfront,
    ];

    #[test]
    fn test_default_state_is_init() {
        assert_eq!(SagaState::default(), SagaState::Init);
    }

    #[test]
    fn test_can_commit() {
        assert!(!SagaState::Init.can_commit());
        assert!(SagaState::LocalReserved.can_commit());
        assert!(SagaState::PeerChecking.can_commit());
        assert!(!SagaState::Compensating.can_commit());
        assert!(!SagaState::Committed.can_commit());
    }

    #[test]
    fn test_can_compensate() {
        assert!(SagaState::Init.can_compensate());
        assert!(SagaState::LocalReserved.can_compensate());
        assert!(SagaState::PeerChecking.can_compensate());
        assert!(!SagaState::Compensating.can_compensate());
        assert!(!SagaState::Committed.can_compensate());
        assert!(!SagaState::Compensated.can_compensate());
        assert!(!SagaState::FailedUpfront.can_compensate());
    }

    #[test]
    fn test_only_init_fails_upfront() {
        for state in ALL {
            assert_eq!(state.can_fail_upfront(), state == SagaState::Init);
        }
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                SagaState::Committed,
                SagaState::Compensated,
                SagaState::FailedUpfront
            ]
        );
    }

    #[test]
    fn test_terminal_states_allow_no_transition() {
        for state in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(!state.can_finish_local());
            assert!(!state.can_check_peers());
            assert!(!state.can_commit());
            assert!(!state.can_compensate());
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaState::Init.to_string(), "Init");
        assert_eq!(SagaState::PeerChecking.to_string(), "PeerChecking");
        assert_eq!(SagaState::FailedUpfront.to_string(), "FailedUpfront");
    }

    #[test]
    fn test_serialization() {
        let state = SagaState::Compensating;
        let json = serde_json::to_string(&state).unwrap();
        let deserialized: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
