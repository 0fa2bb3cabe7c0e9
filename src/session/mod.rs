//! Per-request working directories.
//!
//! Each segmentation request gets its own directory under a process-wide
//! root. Directory existence decides whether a result can be downloaded; the
//! in-memory registry only tracks lifecycle for the reaper.

mod models;
mod reaper;
mod store;

pub use models::{Session, SessionId, SessionRecord, SessionState};
pub use reaper::spawn_reaper;
pub use store::{INPUT_FILE, OUTPUT_FILE, SessionError, SessionResult, SessionStore};
