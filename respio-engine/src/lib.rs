//! # respio-engine
//!
//! Purpose: The hot-path machinery of the RESP client: pooled read and write
//! buffers, the frame boundary scanner, and the recyclable message
//! completion primitive.
//!
//! ## Data Flow
//!
//! ```text
//! socket -> SegmentedReadBuffer -> FrameScanner -> PendingOperation -> parser -> caller
//! caller -> RequestFormatter -> BlockBuffer -> BlockChunk -> connection -> socket
//! ```

pub mod block;
pub mod context;
pub mod message;
pub mod page;
pub mod read_buffer;
pub mod scanner;
pub mod workers;

pub use block::{BlockBuffer, BlockBufferPool, BlockChunk, BlockPoolStats, BlockWriter, RequestFormatter};
pub use context::EngineContext;
pub use message::{MessageCore, MessagePool, PendingOperation, PendingReply, ResponseParser};
pub use page::{PagePool, PagePoolStats};
pub use read_buffer::{CommittedView, SegmentedReadBuffer, SegmentsView};
pub use scanner::{measure, FrameScanner, FrameSource, MessageKind, ScanProgress};
pub use workers::ParseWorkers;
