//! Per-session sandbox: the directory generated code lives in, the command
//! executor that runs inside it, and container resource settings.

pub mod config;
pub mod executor;
pub mod fs;

pub use config::SandboxConfig;
pub use executor::{CommandKind, CommandRunner, ExecOutcome, LocalExecutor, ParsedCommand, parse_command};
pub use fs::SandboxFs;
