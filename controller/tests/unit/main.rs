//! Unit tests for the Dockyard controller

mod support;

mod test_actions;
mod test_deploy;
mod test_directory;
mod test_fsm;
mod test_store;
