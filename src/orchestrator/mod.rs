//! Capability orchestrator: derives the stage sequence from a
//! [`CapabilityConfig`](appforge_common::CapabilityConfig), runs it for one
//! session, loops error fixing against validation, and reports metrics.

pub mod runner;
pub mod sequence;

pub use runner::{Capabilities, Orchestrator, RunOutcome, RunStatus};
pub use sequence::{Stage, stage_sequence};
