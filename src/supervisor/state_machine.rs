use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Crashed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(DaemonState, DaemonState),
}

/// Daemon lifecycle state, shared between the supervisor and the task that
/// waits on the child process. Observers follow it through [`Self::subscribe`].
#[derive(Clone)]
pub struct StateMachine {
    tx: Arc<watch::Sender<DaemonState>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        let (tx, _) = watch::channel(DaemonState::Stopped);
        Self { tx: Arc::new(tx) }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DaemonState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.tx.subscribe()
    }

    pub fn can_transition(from: DaemonState, to: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (from, to),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Crashed)
                | (Starting, Stopping)
                | (Starting, Stopped)
                | (Ready, Stopping)
                | (Ready, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Crashed, Starting)
                | (Crashed, Stopped)
        )
    }

    pub fn transition(&self, to: DaemonState) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if Self::can_transition(*state, to) {
                tracing::info!("Daemon state: {:?} -> {:?}", state, to);
                *state = to;
                true
            } else {
                result = Err(TransitionError::InvalidTransition(*state, to));
                false
            }
        });
        result
    }
}
