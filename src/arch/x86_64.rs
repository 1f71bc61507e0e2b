//! x86_64 implementation of context switching

use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On x86_64 System V ABI, these are the callee-saved registers
/// that must be preserved across function calls.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    /// A context with every register zeroed. Only meaningful as the `out`
    /// side of a switch.
    pub const fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Create a context that enters `entry` on its first activation.
    ///
    /// - `stack_top`: The top of the stack (highest address), 16-byte aligned
    /// - `entry`: The entry point function address
    ///
    /// # Safety
    /// `stack_top - 16 .. stack_top` must be writable memory owned by the
    /// caller for as long as the context may be activated.
    pub unsafe fn new(stack_top: usize, entry: usize) -> Self {
        // System V ABI requires RSP to be 16-byte aligned BEFORE `call` instruction.
        // After `call`, RSP becomes 16n+8 (due to pushed return address).
        // Since we use `ret` instead of `call`, we need to simulate this:
        //
        // Stack layout (growing downward):
        //   stack_top - 8:  zero, read by unwinders as the end of the frame chain
        //   stack_top - 16: return address (entry)
        //
        // After `ret`: RSP = stack_top - 8, which is 16n+8 as required.
        let initial_rsp = stack_top - 16;

        unsafe {
            std::ptr::write((stack_top - 8) as *mut u64, 0);
            std::ptr::write(initial_rsp as *mut u64, entry as u64);
        }

        Context {
            rsp: initial_rsp as u64,
            ..Self::empty()
        }
    }
}

/// Switch from one context to another
///
/// Saves the current CPU state into `old` and restores state from `new`.
/// This function returns when another context switches back to `old`.
///
/// # Safety
/// Both pointers must be valid. The `new` context must have been properly
/// initialized (either by a previous `context_switch` or by `Context::new`).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old context (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Load callee-saved registers from new context (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // For a fresh thread: pops the entry address and jumps there
        // For a suspended thread: returns to where it called context_switch
        "ret",
    );
}

/// Load `new` without saving anything. The caller's continuation is dropped.
///
/// # Safety
/// Same as [`context_switch`]; additionally nothing may rely on the calling
/// frame ever running again.
#[unsafe(naked)]
pub unsafe extern "C" fn context_restore(_new: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ret",
    );
}
