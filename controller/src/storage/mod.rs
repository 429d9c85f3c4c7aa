//! On-disk configuration and layout

pub mod hosts;
pub mod layout;
pub mod settings;
