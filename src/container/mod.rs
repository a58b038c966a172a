//! Per-session app containers.
//!
//! - `machine`: the lifecycle transition table and context
//! - `actor`: one task per container that runs entry/exit actions
//! - `runtime`: the container engine seam and its Docker implementation
//! - `exec`: `CommandRunner` that executes inside a container
//! - `ports`: host port pair allocation
//! - `registry`: at most one machine per session, under a global cap
//! - `mock`: recording runtime for tests

pub mod actor;
pub mod exec;
pub mod machine;
pub mod mock;
pub mod ports;
pub mod registry;
pub mod runtime;

pub use actor::{LifecycleDeps, LifecycleHandle};
pub use exec::ContainerExecutor;
pub use machine::{ContainerContext, ContainerEvent, PortPair, transition};
pub use ports::PortAllocator;
pub use registry::ContainerRegistry;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
