//! Relay module: pipes transcoder output to HTTP clients.
//!
//! Connects:
//! - `Resolver` (request → concrete transcoder argv)
//! - `ProcessRunner` (spawn, stdout stream, termination)
//! - `SessionRegistry` (capacity, listing, stop signals)
//!
//! ```text
//! transcoder stdout → ReaderStream chunks → RelaySink → client body
//! ```

mod pipeline;
mod sink;
mod types;

pub use pipeline::{RelaySession, StreamRelay};
pub use sink::{RelaySink, SinkClosed};
pub use types::{RelayError, RelayOutcome, SessionEnd};
