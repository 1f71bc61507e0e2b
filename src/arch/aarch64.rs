//! aarch64 implementation of context switching

use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On aarch64 (AAPCS64), these are the callee-saved registers
/// that must be preserved across function calls:
/// - x19-x28: general purpose callee-saved registers
/// - d8-d15: floating-point/SIMD callee-saved registers (lower 64 bits of v8-v15)
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    sp: u64,
    /// Link register (return address)
    lr: u64,
    /// Frame pointer
    fp: u64,
    /// General purpose (callee-saved)
    x: [u64; 10],
    /// Floating-point/SIMD (callee-saved, lower 64 bits)
    d: [u64; 8],
}

impl Context {
    /// A context with every register zeroed. Only meaningful as the `out`
    /// side of a switch.
    pub const fn empty() -> Self {
        Context {
            sp: 0,
            lr: 0,
            fp: 0,
            x: [0; 10],
            d: [0; 8],
        }
    }

    /// Create a context that enters `entry` on its first activation.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned end of a stack owned by the
    /// caller for as long as the context may be activated.
    pub unsafe fn new(stack_top: usize, entry: usize) -> Self {
        // On aarch64, `ret` jumps to the address in lr (link register).
        // A zero frame pointer terminates the frame chain for unwinders.
        Context {
            sp: stack_top as u64,
            lr: entry as u64,
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
    // Arguments: x0 = old, x1 = new
    naked_asm!(
        "mov x9, sp",
        "str x9,  [x0, #0x00]",
        "str lr,  [x0, #0x08]",
        "str fp,  [x0, #0x10]",
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "mov x0, x1",
        "b {restore}",
        restore = sym context_restore,
    );
}

/// Load `new` without saving anything. The caller's continuation is dropped.
///
/// # Safety
/// Same as [`context_switch`]; additionally nothing may rely on the calling
/// frame ever running again.
#[unsafe(naked)]
pub unsafe extern "C" fn context_restore(_new: *const Context) -> ! {
    // Argument: x0 = new
    naked_asm!(
        "ldr x9,  [x0, #0x00]",
        "mov sp, x9",
        "ldr lr,  [x0, #0x08]",
        "ldr fp,  [x0, #0x10]",
        "ldp x19, x20, [x0, #0x18]",
        "ldp x21, x22, [x0, #0x28]",
        "ldp x23, x24, [x0, #0x38]",
        "ldp x25, x26, [x0, #0x48]",
        "ldp x27, x28, [x0, #0x58]",
        "ldp d8,  d9,  [x0, #0x68]",
        "ldp d10, d11, [x0, #0x78]",
        "ldp d12, d13, [x0, #0x88]",
        "ldp d14, d15, [x0, #0x98]",
        "ret",
    );
}
