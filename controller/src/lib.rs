//! Dockyard controller library
//!
//! Core modules for managing Docker hosts and Compose stacks under
//! role-based access control with a tamper-evident audit trail.

pub mod actions;
pub mod app;
pub mod audit;
pub mod authz;
pub mod deploy;
pub mod directory;
pub mod docker;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod vault;
pub mod workers;
