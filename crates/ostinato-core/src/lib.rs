//! Per-drive step-pulse scheduling for motion controllers.
//!
//! Given a planned move described as a chain of kinematic segments, this
//! crate computes the exact clock tick at which every individual motor step
//! is due, for Cartesian axes, extruders (with pressure advance) and
//! linear-delta towers (with mid-move carriage reversal). It intentionally
//! avoids any transport- or MCU-specific dependencies; the step interrupt
//! and the planner live elsewhere.

pub mod dda;
pub mod delta;
pub mod drive;
pub mod pool;
pub mod segment;
