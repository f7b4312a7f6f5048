//! fibercore: a user-space, cooperative concurrency runtime built from a small set of
//! independently testable components — a bounded MPMC ring, a per-context memory cache, an
//! async call transport, a chunked task list, a stackful fiber scheduler, an event
//! listener/dispatcher, and epoch-based reclamation — wired together by [`context::Context`] and
//! started through [`bootstrap::Runtime`].
//!
//! Nothing in this crate installs a global `tracing` subscriber or otherwise reaches outside the
//! process it's linked into; that's left to the binary that calls [`bootstrap::Runtime::start`].

pub mod bootstrap;
pub mod clock;
pub mod context;
pub mod epoch;
pub mod error;
pub mod listener;
pub mod queue;
pub mod sink;
pub mod status;
pub mod strand;
pub mod tasks;

pub use bootstrap::{Runtime, RuntimeConfig};
pub use context::Context;
pub use error::{Error, Result};
