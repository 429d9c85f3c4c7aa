//! Background workers

pub mod session_probe;
