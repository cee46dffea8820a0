//! Managed-thread lifecycle controller.
//!
//! Maps logical thread records onto native threads and drives them through
//! their lifecycle:
//!
//! - [`Tcb`]: per-thread record (state, interrupt flag, priority, name, native handle)
//! - [`Runtime`]: the controller, exposed through [`ThreadController`]
//! - [`Registry`]: every live thread, enumerable at a single instant
//! - [`snapshot`]: point-in-time copies of thread state for dumping
//! - [`Monitor`]: the mutual-exclusion resource behind `holds_lock` and monitor waits
//!
//! Stop, suspend and resume are known to be unsafe. They are only reachable
//! through [`Runtime::legacy`], which requires
//! [`RuntimeConfig::allow_legacy_control`].
//!
//! ```rust,no_run
//! use threadctl::{Runtime, RuntimeConfig, ThreadController, Error};
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let sleeper = rt.spawn("sleeper", {
//!     let rt = rt.clone();
//!     move || match rt.sleep_current(5_000) {
//!         Err(Error::Interrupted) => Ok(()),
//!         other => other,
//!     }
//! })?;
//! rt.interrupt(&sleeper);
//! rt.join(&sleeper)?;
//! assert!(!rt.is_alive(&sleeper));
//! # Ok::<(), threadctl::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod os;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod thread;

pub use config::{PriorityRange, RuntimeConfig};
pub use error::{Error, Result};
pub use monitor::{Monitor, MonitorGuard};
pub use os::OsThread;
pub use registry::Registry;
pub use runtime::{Legacy, LegacyThreadControl, Runtime, ThreadController};
pub use snapshot::Snapshot;
pub use thread::{ExitStatus, Frame, FrameGuard, Id, Priority, State, Tcb};

/// Identity of the first thread attached to a fresh registry.
pub const BASE_THREAD_ID: Id = Id(0);

/// Native stack size requested by the default configuration.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
