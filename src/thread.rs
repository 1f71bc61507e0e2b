//! Green thread control blocks.

use std::fmt;

use crate::context::{Context, Stack};
use crate::fault::FaultSignal;

/// Handle of a green thread: its index in the scheduler table.
///
/// Stable for the lifetime of one run; ids restart at 0 once `run()` has
/// reclaimed the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) usize);

impl ThreadId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a green thread stopped without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A fault signal was raised while the thread was running.
    Signal(FaultSignal),
    /// The entry function panicked.
    Panic,
}

/// Lifecycle of a green thread.
///
/// `Ready -> Running` on dispatch, `Running -> Ready` on preemption,
/// `Running -> Finished` when the entry function returns and
/// `Running -> Faulted` when it crashes. Nothing leaves `Finished` or `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Finished,
    Faulted(Fault),
}

impl ThreadState {
    /// The thread will never be dispatched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadState::Finished | ThreadState::Faulted(_))
    }
}

/// A green thread control block
pub(crate) struct GreenThread {
    pub id: ThreadId,
    pub state: ThreadState,
    pub context: Context,
    /// Number of times the dispatcher resumed this thread
    pub activations: u64,
    /// Runs the user function on its first call and does nothing after.
    /// Freed with the control block, outside any green thread.
    pub entry: Box<dyn FnMut()>,
    // Referenced by `context` until the control block is dropped
    _stack: Stack,
}

impl GreenThread {
    pub fn new(id: ThreadId, stack: Stack, context: Context, entry: Box<dyn FnMut()>) -> Self {
        GreenThread {
            id,
            state: ThreadState::Ready,
            context,
            activations: 0,
            entry,
            _stack: stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ThreadState::Ready.is_terminal());
        assert!(!ThreadState::Running.is_terminal());
        assert!(ThreadState::Finished.is_terminal());
        assert!(ThreadState::Faulted(Fault::Panic).is_terminal());
        assert!(
            ThreadState::Faulted(Fault::Signal(FaultSignal::SegmentationViolation)).is_terminal()
        );
    }

    #[test]
    fn id_displays_as_index() {
        assert_eq!(ThreadId(7).to_string(), "7");
        assert_eq!(ThreadId(7).as_usize(), 7);
    }
}
