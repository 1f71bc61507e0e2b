use std::io;

use thiserror::Error;

use crate::context::ContextError;
use crate::scheduler::MAX_THREADS;

/// Memory for a green thread could not be allocated.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("failed to allocate {size} bytes of green thread memory")]
pub struct AllocError {
    pub size: usize,
}

/// Failure to register a new green thread. The table is left unchanged.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("thread table is full ({} threads)", MAX_THREADS)]
    TableFull,
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
    #[error(transparent)]
    ContextError(#[from] ContextError),
}

/// Failure to start a run. Registered threads stay in the table.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a green thread run is already active in this process")]
    AlreadyRunning,
    #[error("failed to set up the preemption timer: {0}")]
    Preemption(#[source] io::Error),
}
