use thiserror::Error;

use super::{LinkingState, SessionState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid session transition: {0} -> {1}")]
    InvalidTransition(SessionState, SessionState),
}

pub struct SessionMachine {
    state: SessionState,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            state: SessionState::default(),
        }
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn can_transition(&self, to: &SessionState) -> bool {
        use LinkingState::*;
        use SessionState::*;

        matches!(
            (&self.state, to),
            (Disconnected { .. }, Disconnected { .. })
                | (Disconnected { .. }, Linking(AwaitingScan))
                | (Disconnected { .. }, Linked { .. })
                | (Linking(AwaitingScan), Linking(AwaitingScan | Confirmed | Expired | Failed))
                | (Linking(Confirmed), Linked { .. })
                | (Linking(_), Disconnected { .. })
                | (Linked { .. }, Disconnected { .. })
                | (Linked { .. }, Linking(AwaitingScan))
        )
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, TransitionError> {
        if self.can_transition(&to) {
            tracing::info!("Session transition: {} -> {}", self.state, to);
            Ok(std::mem::replace(&mut self.state, to))
        } else {
            Err(TransitionError::InvalidTransition(self.state.clone(), to))
        }
    }
}
