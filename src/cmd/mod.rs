//! CLI command implementations.
//!
//! | Module          | Commands handled |
//! |-----------------|------------------|
//! | `serve`         | `Serve`          |
//! | `check_config`  | `CheckConfig`    |
//! | `recover_stuck` | `RecoverStuck`   |

pub mod check_config;
pub mod recover_stuck;
pub mod serve;

pub use check_config::cmd_check_config;
pub use recover_stuck::cmd_recover_stuck;
pub use serve::cmd_serve;
