//! Session and concurrency management.
//!
//! [`SessionManager`] owns the in-process registry of running orchestrators,
//! the per-session broadcast rooms, stuck-session recovery and shutdown.
//! [`SessionEmitter`] is the event sink each run reports through.

pub mod emitter;
pub mod manager;
pub mod protocol;
pub mod rate_limit;
pub mod recovery;
pub mod registry;
pub mod rooms;

pub use emitter::SessionEmitter;
pub use manager::{CapabilityFactory, GenerationRequest, ManagerSettings, SessionManager, StopOutcome};
pub use protocol::{ClientEvent, ServerEvent, broadcast_event};
pub use rate_limit::BurstLimiter;
pub use recovery::{RecoveredSession, recover_stuck_sessions};
pub use registry::ActiveSessions;
pub use rooms::Rooms;
