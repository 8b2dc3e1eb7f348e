//! Finite state machine for sidecar-ordered service deployment

use serde::{Deserialize, Serialize};

/// Orchestration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    /// Nothing done yet
    Idle,

    /// Stopping and removing stale containers of the service
    Cleaning,

    /// Rendering the sidecar config and starting the sidecar
    StartingSidecar,

    /// Polling the sidecar admin endpoint
    WaitingReady,

    /// Starting the application container
    StartingApp,

    /// Both containers running
    Done,

    /// Undoing the sidecar after a failure
    RollingBack,

    /// Deploy failed
    Failed,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationState::Done | OrchestrationState::Failed)
    }
}

/// Orchestration event
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// Begin a deploy
    Begin,

    /// Stale containers are gone
    Cleaned,

    /// Sidecar container is up
    SidecarStarted,

    /// Sidecar could not be started. No rollback is needed.
    SidecarStartFailed(String),

    /// Sidecar answered its readiness check
    SidecarReady,

    /// Sidecar did not become ready in time
    SidecarNotReady(String),

    /// Application container is up
    AppStarted,

    /// Application container could not be started
    AppStartFailed(String),

    /// Rollback actions finished
    RolledBack,
}

/// Orchestration FSM
#[derive(Debug, Clone)]
pub struct OrchestrationFsm {
    state: OrchestrationState,
    error: Option<String>,
    history: Vec<OrchestrationState>,
}

impl OrchestrationFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: OrchestrationState::Idle,
            error: None,
            history: vec![OrchestrationState::Idle],
        }
    }

    /// Get current state
    pub fn state(&self) -> OrchestrationState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state entered so far, starting with `Idle`
    pub fn history(&self) -> &[OrchestrationState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: OrchestrationEvent) -> Result<OrchestrationState, String> {
        use OrchestrationEvent as E;
        use OrchestrationState as S;

        let new_state = match (self.state, &event) {
            (S::Idle, E::Begin) => S::Cleaning,
            (S::Cleaning, E::Cleaned) => S::StartingSidecar,

            (S::StartingSidecar, E::SidecarStarted) => S::WaitingReady,
            // No container exists yet, so there is nothing to roll back.
            (S::StartingSidecar, E::SidecarStartFailed(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::WaitingReady, E::SidecarReady) => S::StartingApp,
            (S::WaitingReady, E::SidecarNotReady(err)) => {
                self.error = Some(err.clone());
                S::RollingBack
            }

            (S::StartingApp, E::AppStarted) => S::Done,
            (S::StartingApp, E::AppStartFailed(err)) => {
                self.error = Some(err.clone());
                S::RollingBack
            }

            (S::RollingBack, E::RolledBack) => S::Failed,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }
}

impl Default for OrchestrationFsm {
    fn default() -> Self {
        Self::new()
    }
}
