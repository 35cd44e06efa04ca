//! Building blocks shared by every coview client: the playback engine contract,
//! the self-echo sync lock, source detection and timing configuration.

mod config;
mod engine;
mod source;
mod sync_lock;
mod util;

pub use config::*;
pub use engine::*;
pub use source::*;
pub use sync_lock::*;
pub use util::*;
