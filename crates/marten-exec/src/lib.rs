//! # Marten Exec
//!
//! Execution and recovery layer of the Marten tracing JIT:
//!
//! - **Trampoline**: marshal interpreter values into a frame, call a
//!   compiled entry point, classify why it stopped
//! - **Guard recovery**: stop descriptors, fail-value decode, bridge
//!   attachment, forcing
//! - **Execution right**: the process-wide token one thread holds while
//!   running interpreter or compiled code, with the external-call guard
//!   and the saved-roots registry the collector walks
//!
//! Compiled code is anything with the entry-point shape
//! `(frame, context) -> frame`; this crate never emits or inspects
//! machine instructions.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod descr;
pub mod error;
pub mod right;
pub mod runtime;
pub mod stats;
pub mod trampoline;

pub use descr::{Descr, DescrTable, DescrToken, FinishDescr, GuardDescr, Stop, force};
pub use error::{ExecError, Result};
pub use right::{ExecutionRight, SavedRoots};
pub use runtime::{ExecContext, JitRuntime, RuntimeCore};
pub use stats::RuntimeStats;
pub use trampoline::{
    CompiledUnit, DEFAULT_MAX_ENTER_DEPTH, EntryFn, ExitStatus, UnitDescrs, max_enter_depth,
};
