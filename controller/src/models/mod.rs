//! Domain models

pub mod audit;
pub mod context;
pub mod deployment;
pub mod grant;
pub mod host;
pub mod repository;
pub mod user;
