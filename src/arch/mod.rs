//! Per-architecture register save/restore.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::{Context, context_restore, context_switch};
#[cfg(target_arch = "x86_64")]
pub use x86_64::{Context, context_restore, context_switch};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("greenrt supports only x86_64 and aarch64");
