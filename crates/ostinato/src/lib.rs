//! Host-side wrapper around the motion core: configuration loading and a
//! whole-move simulation harness.

pub mod config;
pub mod sim;
