//! Per-stream state: reorder buffer, session, registry and the playout
//! worker that turns buffered packets into segment files.

pub mod diagnostics;
pub mod jitter;
mod playout;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use diagnostics::run_diagnostics;
pub use jitter::{BufferedPacket, Drained, GapEvent, InsertOutcome, JitterBuffer};
pub use registry::SessionRegistry;
pub use session::{Session, SessionError, SessionPhase, SessionSnapshot, SessionStats};
