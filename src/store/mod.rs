mod db;
pub mod replay;

pub use db::{DbHandle, SessionDb, SessionDetail, StoredFile};
pub use replay::{ReplayEntry, replay_entries};
