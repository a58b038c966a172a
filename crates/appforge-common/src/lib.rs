//! Shared domain types for appforge.
//!
//! These types cross the boundary between the generation engine, the record
//! store, and the real-time protocol, so they carry their own serde shapes
//! (camelCase on the wire) and nothing else.

pub mod app;
pub mod config;
pub mod metrics;
pub mod session;
pub mod timeline;
pub mod validation;

pub use app::{AppStatus, ContainerPhase};
pub use config::{CapabilityConfig, ConfigValidationError, InputMode};
pub use metrics::{CompilerCheckMetrics, GenerationMetrics, TokenUsage};
pub use session::{Session, SessionStatus};
pub use timeline::{TimelineItem, TimelineKind};
pub use validation::{ValidationError, ValidationErrorKind};

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
