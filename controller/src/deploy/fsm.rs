//! Finite state machine for a stack deployed on a host

use serde::{Deserialize, Serialize};

use crate::models::deployment::DeploymentStatus;

/// Lifecycle state of a (stack, host) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Never deployed on this host
    Undeployed,

    /// `up` in progress
    Deploying,

    Active,

    /// `down` in progress
    Stopping,

    Stopped,

    Failed,
}

impl From<DeploymentStatus> for DeploymentState {
    fn from(status: DeploymentStatus) -> Self {
        match status {
            DeploymentStatus::Active => DeploymentState::Active,
            DeploymentStatus::Stopped => DeploymentState::Stopped,
            DeploymentStatus::Failed => DeploymentState::Failed,
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start deployment
    Deploy,

    /// Checkout and `up` completed
    DeploySucceeded,

    /// Checkout or `up` failed
    DeployFailed(String),

    /// Start take-down
    TakeDown,

    /// `down` completed
    TakeDownSucceeded,

    /// `down` failed; the stack is still running
    TakeDownFailed(String),

    /// The stack was left in an unknown state while stopping
    Fault(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM for a pair that was never deployed
    pub fn new() -> Self {
        Self::resume(DeploymentState::Undeployed)
    }

    /// Resume from a persisted state
    pub fn resume(state: DeploymentState) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Persisted status for the current state, `None` while in transition
    pub fn status(&self) -> Option<DeploymentStatus> {
        match self.state {
            DeploymentState::Active => Some(DeploymentStatus::Active),
            DeploymentState::Stopped => Some(DeploymentStatus::Stopped),
            DeploymentState::Failed => Some(DeploymentStatus::Failed),
            DeploymentState::Undeployed
            | DeploymentState::Deploying
            | DeploymentState::Stopping => None,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // Deploy
            (
                DeploymentState::Undeployed | DeploymentState::Stopped | DeploymentState::Failed,
                DeploymentEvent::Deploy,
            ) => {
                self.error = None;
                DeploymentState::Deploying
            }
            (DeploymentState::Deploying, DeploymentEvent::DeploySucceeded) => DeploymentState::Active,
            (DeploymentState::Deploying, DeploymentEvent::DeployFailed(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }

            // Take down
            (DeploymentState::Active, DeploymentEvent::TakeDown) => DeploymentState::Stopping,
            (DeploymentState::Stopping, DeploymentEvent::TakeDownSucceeded) => DeploymentState::Stopped,
            (DeploymentState::Stopping, DeploymentEvent::TakeDownFailed(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Active
            }
            (DeploymentState::Stopping, DeploymentEvent::Fault(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
