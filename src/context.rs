//! Execution contexts bound to privately owned stacks.
//!
//! This is the only module that touches raw stack memory or register state.
//! Everything above it goes through three operations:
//! - [`Context::new`]: bind a fresh context to a [`Stack`] and an entry function
//! - [`swap`]: save the caller into one context and resume another
//! - [`activate`]: resume a context, abandoning the caller

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use thiserror::Error;

use crate::arch;
use crate::error::AllocError;

/// Stack size for each green thread (1MB)
pub const STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack a context can be bound to.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const STACK_ALIGN: usize = 16;

/// A context could not be bound to the given stack.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stack of {size} bytes cannot host an execution context (minimum {})", MIN_STACK_SIZE)]
pub struct ContextError {
    pub size: usize,
}

/// Dedicated stack memory for one green thread.
///
/// Pages come zeroed from the allocator and are only committed once the
/// thread touches them.
pub struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    /// Allocate a zeroed stack of `size` bytes.
    ///
    /// Allocation failure is reported instead of aborting the process.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(size, STACK_ALIGN).map_err(|_| AllocError { size })?;
        if size == 0 {
            return Ok(Stack {
                base: NonNull::dangling(),
                layout,
            });
        }
        // SAFETY: the layout has a non-zero size
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(AllocError { size })?;
        Ok(Stack { base, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Highest usable address, aligned to 16 bytes (required by ABI).
    fn top(&mut self) -> usize {
        // Stack grows downward, so we start at the top
        let top = self.base.as_ptr() as usize + self.len();
        top & !0xF
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: allocated in `new` with this layout
            unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
        }
    }
}

/// Saved machine state of a suspended logical thread.
#[derive(Debug, Default)]
pub struct Context {
    regs: arch::Context,
}

impl Context {
    /// Placeholder to be filled by the save half of [`swap`].
    pub const fn empty() -> Self {
        Context {
            regs: arch::Context::empty(),
        }
    }

    /// Bind a new context to `stack`; its first activation calls `entry`.
    ///
    /// The returned context points into `stack`, so the stack must outlive
    /// every activation of it. `entry` must never return.
    pub fn new(stack: &mut Stack, entry: extern "C" fn() -> !) -> Result<Self, ContextError> {
        if stack.len() < MIN_STACK_SIZE {
            return Err(ContextError { size: stack.len() });
        }
        let top = stack.top();
        // SAFETY: the top 16 bytes lie inside `stack`, which is at least
        // MIN_STACK_SIZE long.
        let regs = unsafe { arch::Context::new(top, entry as usize) };
        Ok(Context { regs })
    }
}

/// Save the caller into `out` and resume `target`.
///
/// Returns when some other context swaps back into `out`.
///
/// # Safety
/// `target` must have been produced by [`Context::new`] or filled by an
/// earlier `swap`, and the stack it points into must still be alive.
/// `out` and `target` may not overlap.
#[inline(never)]
pub unsafe fn swap(out: *mut Context, target: *const Context) {
    unsafe {
        arch::context_switch(
            &raw mut (*out).regs,
            &raw const (*target).regs,
        );
    }
}

/// Resume `target`, discarding the caller's continuation.
///
/// # Safety
/// Same requirements as [`swap`] for `target`.
pub unsafe fn activate(target: *const Context) -> ! {
    unsafe { arch::context_restore(&raw const (*target).regs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never_entered() -> ! {
        std::process::abort()
    }

    #[test]
    fn stack_top_is_aligned_and_in_bounds() {
        let mut stack = Stack::new(MIN_STACK_SIZE + 7).unwrap();
        let base = stack.base.as_ptr() as usize;
        let top = stack.top();
        assert_eq!(top % 16, 0);
        assert!(top <= base + stack.len());
        assert!(top > base + stack.len() - 16);
    }

    #[test]
    fn rejects_undersized_stack() {
        let mut stack = Stack::new(512).unwrap();
        let err = Context::new(&mut stack, never_entered).unwrap_err();
        assert_eq!(err, ContextError { size: 512 });
    }

    #[test]
    fn reports_unsatisfiable_allocation() {
        // Not a valid layout
        assert_eq!(Stack::new(usize::MAX).err(), Some(AllocError { size: usize::MAX }));
        // Valid layout, but no allocator can satisfy it
        let huge = isize::MAX as usize / 2;
        assert_eq!(Stack::new(huge).err(), Some(AllocError { size: huge }));
    }

    #[test]
    fn fresh_stack_is_zeroed() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(stack.base.as_ptr(), stack.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_stack_cannot_be_bound() {
        let mut stack = Stack::new(0).unwrap();
        assert_eq!(stack.len(), 0);
        let err = Context::new(&mut stack, never_entered).unwrap_err();
        assert_eq!(err, ContextError { size: 0 });
    }

    #[test]
    fn binds_minimum_sized_stack() {
        let mut stack = Stack::new(MIN_STACK_SIZE).unwrap();
        assert!(Context::new(&mut stack, never_entered).is_ok());
    }
}
