//! The process-wide execution right.
//!
//! Several OS threads cooperatively share one logical right to run
//! interpreter or compiled code and to touch frames. A thread calling
//! out of compiled code into an external function releases the right
//! and leaves its saved frame chain in a registry, so a collection
//! triggered by whichever thread runs next can still discover every
//! suspended thread's frames. Reacquisition blocks on a condition
//! variable until the current holder lets go; there are no timeouts.

use std::thread::ThreadId;

use marten_frame::FrameHandle;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// A suspended thread's frame chain, published for root discovery while
/// the thread is inside an external call.
#[derive(Debug, Clone, Default)]
pub struct SavedRoots {
    /// Frames the suspended thread still owns, outermost first.
    pub frames: SmallVec<[FrameHandle; 4]>,
}

#[derive(Default)]
struct RightState {
    held: bool,
    saved: FxHashMap<ThreadId, SavedRoots>,
}

/// The execution right: a mutex/condvar token plus the saved-roots
/// registry of threads currently suspended in external calls.
#[derive(Default)]
pub struct ExecutionRight {
    state: Mutex<RightState>,
    available: Condvar,
}

impl ExecutionRight {
    /// A fresh, unheld right.
    pub fn new() -> Self {
        ExecutionRight::default()
    }

    /// Block until the right is free, then take it.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        while state.held {
            self.available.wait(&mut state);
        }
        state.held = true;
    }

    /// Give the right up. Wakes one waiter.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        self.available.notify_one();
    }

    /// Give the right up for the duration of an external call, leaving
    /// `roots` behind so collections run by other threads can trace this
    /// thread's frames.
    pub fn release_for_call(&self, thread: ThreadId, roots: SavedRoots) {
        let mut state = self.state.lock();
        state.saved.insert(thread, roots);
        state.held = false;
        self.available.notify_one();
    }

    /// Take the right back after an external call and retire this
    /// thread's registry entry. Blocks while any peer holds the right,
    /// whether it never let go or took it while this thread was away.
    pub fn reacquire_after_call(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        while state.held {
            self.available.wait(&mut state);
        }
        state.held = true;
        state.saved.remove(&thread);
    }

    /// Drop a suspended thread's registry entry without reacquiring.
    /// Used when an external call unwinds instead of returning.
    pub fn retire(&self, thread: ThreadId) {
        self.state.lock().saved.remove(&thread);
    }

    /// Every suspended thread's saved frames. Only meaningful to the
    /// current holder; the registry cannot shrink while it holds the
    /// right, since suspended peers block in `reacquire_after_call`.
    pub fn saved_frames(&self) -> Vec<FrameHandle> {
        let state = self.state.lock();
        state
            .saved
            .values()
            .flat_map(|roots| roots.frames.iter().copied())
            .collect()
    }

    /// Number of threads currently suspended in external calls.
    pub fn suspended_count(&self) -> usize {
        self.state.lock().saved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn acquire_excludes_until_release() {
        let right = Arc::new(ExecutionRight::new());
        let holders = Arc::new(AtomicUsize::new(0));

        right.acquire();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let right = Arc::clone(&right);
                let holders = Arc::clone(&holders);
                std::thread::spawn(move || {
                    right.acquire();
                    let seen = holders.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, 0, "two holders at once");
                    std::thread::yield_now();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    right.release();
                })
            })
            .collect();

        right.release();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn registry_tracks_suspended_threads() {
        let right = ExecutionRight::new();
        let thread = std::thread::current().id();
        right.acquire();

        right.release_for_call(thread, SavedRoots::default());
        assert_eq!(right.suspended_count(), 1);

        right.reacquire_after_call(thread);
        assert_eq!(right.suspended_count(), 0);
        right.release();
    }
}
