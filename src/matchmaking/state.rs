//! Session state machine of one coordinator

/// Where the local client is in its queueing session.
///
/// `Idle -> Joining -> Searching <-> CreatingMatch -> Matched`; any state
/// returns to `Idle` on leave or halt, and a finished (`Matched`) session may
/// start a new join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Searching,
    CreatingMatch,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, to),
            (_, Idle)
                | (Idle | Matched, Joining)
                | (Joining | CreatingMatch, Searching)
                | (Searching, CreatingMatch)
                // A match addressed to us can land before our own write settles
                | (Joining | Searching | CreatingMatch, Matched)
        )
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    /// Holding a queue entry and looking for an opponent
    pub fn is_searching(self) -> bool {
        matches!(self, SessionState::Searching | SessionState::CreatingMatch)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let mut state = Idle;
        for next in [Joining, Searching, CreatingMatch, Matched, Idle] {
            state.transition(next).unwrap();
        }
    }

    #[test]
    fn only_one_creation_in_flight() {
        let mut state = CreatingMatch;
        assert!(state.transition(CreatingMatch).is_err());
    }

    #[test]
    fn rejoin_requires_leaving_an_active_session() {
        assert!(!Searching.can_transition(Joining));
        assert!(!Joining.can_transition(Joining));
        assert!(Matched.can_transition(Joining));
    }

    #[test]
    fn creation_requires_searching() {
        assert!(!Idle.can_transition(CreatingMatch));
        assert!(!Joining.can_transition(CreatingMatch));
        assert!(!Matched.can_transition(Searching));
    }
}
