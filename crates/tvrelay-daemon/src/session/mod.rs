//! Live relay session tracking.
//!
//! Every streaming request registers here for the lifetime of its transcoder
//! so sessions can be listed, stopped individually, and drained on shutdown.

mod registry;
mod types;

pub use registry::{SessionRegistry, SessionTicket};
pub use types::{SessionError, SessionInfo, SessionState};
