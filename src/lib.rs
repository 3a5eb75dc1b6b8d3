//! Single-threaded, callback-driven non-blocking I/O reactor.
//!
//! Three layers, bottom to top:
//!
//! - [`reactor`]: the event loop itself — an epoll selector plus
//!   `Signal`/`Child`/`Io` event arming, built on [`registry::Registry`] for
//!   dispatch.
//! - [`aiofd`]: a buffered, non-blocking fd wrapper (read/write queueing,
//!   partial-write continuation) that any readable/writable fd can sit
//!   under.
//! - [`socket`]: TCP/UDP/Unix-domain sockets, layered on an `Aiofd` plus a
//!   connect/bind/listen/accept state machine.
//!
//! See `DESIGN.md` for what in this crate is grounded on which upstream
//! file, and `SPEC_FULL.md` for the full behavioral contract.

pub mod aiofd;
pub mod error;
pub mod event;
pub mod reactor;
pub mod registry;
pub mod socket;

pub use error::{ReactorError, Result};
pub use event::{Args, Direction, LoopPayload, Tag, WriteOutcome};
pub use reactor::{Event, EventSpec, Loop, LoopBuilder, LoopHandle};
pub use registry::{Callback, ContextId, Registry};
