pub mod capability;
pub mod config;
pub mod container;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod parsers;
pub mod prompts;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod store;
pub mod util;
