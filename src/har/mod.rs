//! HAR record/replay
//!
//! Archives are registered through the dispatcher like any other route, so
//! only exchanges matching the archive's URL filter touch it.

pub mod format;
pub mod key;
mod router;
mod store;

pub use format::{HarDocument, HarEntry};
pub use key::RequestKey;
pub use router::{HarHandle, HarRouter};
pub use store::{read_document, summarize, HarArchive, HarMode, HarOptions, HarStats, NotFound};
