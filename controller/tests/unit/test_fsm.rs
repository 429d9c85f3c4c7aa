//! FSM unit tests

use dockyard::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use dockyard::models::deployment::DeploymentStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Undeployed);
    assert!(fsm.error().is_none());
    assert!(fsm.status().is_none());
}

#[test]
fn test_fsm_take_down_failure_keeps_stack_active() {
    let mut fsm = DeploymentFsm::resume(DeploymentStatus::Active.into());

    fsm.process(DeploymentEvent::TakeDown).unwrap();
    fsm.process(DeploymentEvent::TakeDownFailed("daemon refused".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentState::Active);
    assert_eq!(fsm.error(), Some("daemon refused"));
    assert_eq!(fsm.status(), Some(DeploymentStatus::Active));
}

#[test]
fn test_fsm_redeploy_after_failure() {
    let mut fsm = DeploymentFsm::resume(DeploymentStatus::Failed.into());

    fsm.process(DeploymentEvent::Deploy).unwrap();
    assert!(fsm.error().is_none());
    fsm.process(DeploymentEvent::DeploySucceeded).unwrap();
    assert_eq!(fsm.status(), Some(DeploymentStatus::Active));
}

#[test]
fn test_fsm_fault_while_stopping() {
    let mut fsm = DeploymentFsm::resume(DeploymentState::Active);

    fsm.process(DeploymentEvent::TakeDown).unwrap();
    fsm.process(DeploymentEvent::Fault("session lost mid-down".to_string()))
        .unwrap();
    assert_eq!(fsm.status(), Some(DeploymentStatus::Failed));
}

#[test]
fn test_fsm_invalid_transition() {
    // Active stacks cannot be deployed again
    let mut fsm = DeploymentFsm::resume(DeploymentState::Active);
    assert!(fsm.process(DeploymentEvent::Deploy).is_err());
    assert_eq!(fsm.state(), DeploymentState::Active);

    // Nothing to take down
    let mut fsm = DeploymentFsm::new();
    assert!(fsm.process(DeploymentEvent::TakeDown).is_err());
    assert!(fsm.process(DeploymentEvent::DeploySucceeded).is_err());
}
