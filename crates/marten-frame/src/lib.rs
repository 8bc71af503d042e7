//! # Marten Frame
//!
//! The execution-frame format of the Marten tracing JIT and its contract
//! with the garbage collector:
//!
//! - **Frame arena**: heap records holding a compiled trace's live values,
//!   addressed through generation-checked handles
//! - **Frame info**: shared, grow-only sizing for all frames of one
//!   compiled unit
//! - **GC maps**: immutable, interned liveness bitmaps rebuilt at every
//!   suspension point
//! - **Tracer**: resumable enumeration of every collector-owned reference
//!   inside a frame
//!
//! A frame's shape (which of its slots hold references) changes every time
//! execution crosses a different guard, so it cannot be described by a
//! static field layout. The collector instead pulls addresses from a
//! cursor that pairs the frame with the gc map installed at the most
//! recent suspension point.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod error;
pub mod frame;
pub mod frame_info;
pub mod gcmap;
pub mod slot;
pub mod tracer;

pub use barrier::{Barrier, NullBarrier};
pub use error::{FrameError, Result};
pub use frame::{Frame, FrameArena, FrameHandle};
pub use frame_info::{FRAME_BASE_OFFSET, FrameInfo, WORD};
pub use gcmap::{FailLocation, GcMap, GcMapInterner, Storage};
pub use slot::{GcRef, Slot, ValueKind};
pub use tracer::{FrameTracer, TraceCursor};
