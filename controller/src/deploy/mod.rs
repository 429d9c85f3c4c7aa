//! Stack deployment

pub mod controller;
pub mod fsm;
pub mod git;
pub mod locks;
