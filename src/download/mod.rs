//! Download engine: errors, gates, and the streaming state machine.

mod error;
mod stream;

pub use error::DownloadError;
pub use stream::{DownloadGates, RunState, StreamDownloader};
