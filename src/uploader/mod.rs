// Upload pipeline: retry policy, quota, session state, chunked transport and
// the batch loop that ties them together.

pub mod progress_tracker;
pub mod quota;
pub mod retry;
pub mod session;
pub mod transport;
pub mod upload_queue;
pub mod youtube_client;

pub use transport::{ChunkResponse, ChunkedTransport, ResumableEndpoint};
pub use upload_queue::{BatchOrchestrator, BatchResult, ItemOutcome};
