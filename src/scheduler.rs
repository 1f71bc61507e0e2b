//! Preemptive round-robin scheduler
//!
//! Every green thread of a run lives on the OS thread that calls [`run`].
//! The table holds at most [`MAX_THREADS`] control blocks; a `SIGALRM`
//! tick every [`TIME_SLICE`] moves the running thread back to `Ready`
//! and hands the CPU to the next ready thread in index order.
//!
//! # Example
//!
//! ```no_run
//! use greenrt::{create_thread, run};
//!
//! fn count(limit: u64) {
//!     let mut n = 0;
//!     while n < limit {
//!         n += 1;
//!     }
//! }
//!
//! create_thread(count, 1_000_000).unwrap();
//! create_thread(count, 2_000_000).unwrap();
//!
//! let report = run().unwrap();
//! assert_eq!(report.finished().count(), 2);
//! ```

use std::cell::UnsafeCell;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};

use crate::context::{self, Context, STACK_SIZE, Stack};
use crate::error::{AllocError, CreationError, RunError};
use crate::preempt::{self, Preemption, SignalGuard, TIME_SLICE};
use crate::thread::{Fault, GreenThread, ThreadId, ThreadState};

/// Capacity of the thread table
pub const MAX_THREADS: usize = 64;

thread_local! {
    static SCHEDULER: UnsafeCell<Scheduler> = const { UnsafeCell::new(Scheduler::new()) };
}

/// Get a raw pointer to the scheduler (unsafe, but avoids RefCell borrow issues during context switch)
fn scheduler() -> *mut Scheduler {
    SCHEDULER.with(|s| s.get())
}

struct Scheduler {
    /// Control blocks, indexed by `ThreadId`
    threads: Vec<GreenThread>,
    /// Index of the `Running` thread
    current: Option<usize>,
    /// Where the host resumes once no thread is ready
    host: Context,
    /// Set while `run()` is dispatching
    running: bool,
    /// Signal mask fresh threads start with
    task_mask: Option<libc::sigset_t>,
}

impl Scheduler {
    const fn new() -> Self {
        Scheduler {
            threads: Vec::new(),
            current: None,
            host: Context::empty(),
            running: false,
            task_mask: None,
        }
    }

    fn insert(
        &mut self,
        stack_size: usize,
        entry: Box<dyn FnMut()>,
    ) -> Result<ThreadId, CreationError> {
        if self.threads.len() >= MAX_THREADS {
            return Err(CreationError::TableFull);
        }
        // Pushes never reallocate once the full table is reserved
        let missing = MAX_THREADS - self.threads.len();
        self.threads
            .try_reserve_exact(missing)
            .map_err(|_| AllocError {
                size: missing * mem::size_of::<GreenThread>(),
            })?;

        let mut stack = Stack::new(stack_size)?;
        let context = Context::new(&mut stack, thread_entry)?;

        let id = ThreadId(self.threads.len());
        self.threads.push(GreenThread::new(id, stack, context, entry));
        debug!("green thread {id} created, {stack_size} byte stack");
        Ok(id)
    }

    /// Free every control block and describe how each one ended.
    fn reclaim(&mut self) -> RunReport {
        let threads = mem::take(&mut self.threads);
        self.host = Context::empty();

        let threads = threads
            .into_iter()
            .map(|thread| {
                match thread.state {
                    ThreadState::Faulted(Fault::Signal(signal)) => {
                        warn!("green thread {} crashed: {signal}", thread.id)
                    }
                    ThreadState::Faulted(Fault::Panic) => {
                        warn!("green thread {} panicked", thread.id)
                    }
                    _ => {}
                }
                ThreadReport {
                    id: thread.id,
                    state: thread.state,
                    activations: thread.activations,
                }
            })
            .collect();
        RunReport { threads }
    }
}

/// Index of the first ready thread after `current`, wrapping around.
///
/// Without a current thread the scan starts at index 0. The current thread
/// itself is considered last.
fn round_robin(
    count: usize,
    current: Option<usize>,
    is_ready: impl Fn(usize) -> bool,
) -> Option<usize> {
    let start = current.map_or(0, |c| c + 1);
    (0..count).map(|i| (start + i) % count).find(|&idx| is_ready(idx))
}

/// Hand the CPU to the next ready thread.
///
/// Returns to the caller only when the caller is resumed later, or when
/// nothing was ever dispatched and nothing is ready. With no ready thread
/// left the host context is activated instead.
///
/// # Safety
/// Runtime thread only, with `SIGALRM` blocked.
unsafe fn dispatch() {
    let s = scheduler();
    // Borrows of the table end before the switch; whoever runs next takes
    // its own.
    let (out, target): (*mut Context, *const Context) = unsafe {
        let sched = &mut *s;
        let prev = sched.current;
        let threads = &sched.threads;
        let next = round_robin(threads.len(), prev, |idx| {
            threads[idx].state == ThreadState::Ready
        });

        let Some(next) = next else {
            if prev.is_none() {
                return;
            }
            sched.current = None;
            context::activate(&sched.host);
        };

        sched.current = Some(next);
        let thread = &mut sched.threads[next];
        thread.state = ThreadState::Running;
        thread.activations += 1;

        let target: *const Context = &sched.threads[next].context;
        match prev {
            // First dispatch of the run: this saves the host's continuation
            None => (&raw mut sched.host, target),
            Some(prev) if prev == next => return,
            Some(prev) => (&raw mut sched.threads[prev].context, target),
        }
    };
    unsafe { context::swap(out, target) };
}

/// First code run by every green thread
extern "C" fn thread_entry() -> ! {
    let entry: *mut dyn FnMut() = unsafe {
        let sched = &mut *scheduler();
        let idx = sched
            .current
            .expect("green thread entered without being dispatched");
        // Dispatch ran with ticks blocked; open them up for the user function
        if let Some(mask) = &sched.task_mask {
            preempt::set_mask(mask);
        }
        let thread = &mut sched.threads[idx];
        thread.state = ThreadState::Running;
        &mut *thread.entry
    };

    // SAFETY: the boxed closure lives in the control block until reclaim
    let panicked = panic::catch_unwind(AssertUnwindSafe(|| unsafe { (*entry)() })).is_err();

    preempt::block_ticks();
    unsafe {
        let sched = &mut *scheduler();
        let idx = sched
            .current
            .expect("green thread finished without being current");
        sched.threads[idx].state = if panicked {
            ThreadState::Faulted(Fault::Panic)
        } else {
            ThreadState::Finished
        };
        dispatch();
    }

    // A finished thread is never dispatched again
    std::process::abort()
}

/// Timer tick: demote the running thread and dispatch.
///
/// The tick is dropped while the OS thread is panicking: panic bookkeeping
/// is per OS thread, so no other green thread may run until the panic is
/// caught in [`thread_entry`].
///
/// # Safety
/// Signal-handler context on the runtime thread, `SIGALRM` blocked.
pub(crate) unsafe fn preempt() {
    if std::thread::panicking() {
        return;
    }
    unsafe {
        let sched = &mut *scheduler();
        if !sched.running {
            return;
        }
        if let Some(cur) = sched.current
            && sched.threads[cur].state == ThreadState::Running
        {
            sched.threads[cur].state = ThreadState::Ready;
            dispatch();
        }
    }
}

/// The green thread that currently holds the CPU, if any.
///
/// # Safety
/// Runtime thread only, with `SIGALRM` blocked.
pub(crate) unsafe fn running_thread() -> Option<ThreadId> {
    let sched = unsafe { &*scheduler() };
    if !sched.running {
        return None;
    }
    let cur = sched.current?;
    (sched.threads[cur].state == ThreadState::Running).then_some(ThreadId(cur))
}

/// Retire the running thread after a fault and switch away for good.
///
/// # Safety
/// Same as [`running_thread`], which must have returned `Some`.
pub(crate) unsafe fn park_faulted(fault: Fault) -> ! {
    unsafe {
        let sched = &mut *scheduler();
        if let Some(cur) = sched.current {
            sched.threads[cur].state = ThreadState::Faulted(fault);
        }
        dispatch();
    }
    std::process::abort()
}

/// Green thread factory with non-default settings.
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: STACK_SIZE,
        }
    }

    /// Stack size of the spawned thread, in bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Register a green thread running `f`.
    ///
    /// Can be called either before [`run`] to register initial threads,
    /// or from within a running green thread to add more.
    pub fn spawn<F>(self, f: F) -> Result<ThreadId, CreationError>
    where
        F: FnOnce() + 'static,
    {
        let mut f = Some(f);
        let entry: Box<dyn FnMut()> = Box::new(move || {
            if let Some(f) = f.take() {
                f()
            }
        });
        let _guard = SignalGuard::block();
        // SAFETY: ticks are blocked, so the dispatcher never sees a
        // half-updated table
        let sched = unsafe { &mut *scheduler() };
        sched.insert(self.stack_size, entry)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a green thread running `f` with the default stack size.
pub fn spawn<F>(f: F) -> Result<ThreadId, CreationError>
where
    F: FnOnce() + 'static,
{
    Builder::new().spawn(f)
}

/// Register a green thread that calls `function(arg)`.
pub fn create_thread<T: 'static>(function: fn(T), arg: T) -> Result<ThreadId, CreationError> {
    spawn(move || function(arg))
}

/// Number of control blocks in this OS thread's table.
pub fn thread_count() -> usize {
    let sched = unsafe { &*scheduler() };
    sched.threads.len()
}

/// Id of the green thread calling this, `None` outside a run.
pub fn current_thread() -> Option<ThreadId> {
    let sched = unsafe { &*scheduler() };
    sched.current.map(ThreadId)
}

/// Lifecycle state of a registered thread.
pub fn thread_state(id: ThreadId) -> Option<ThreadState> {
    let sched = unsafe { &*scheduler() };
    sched.threads.get(id.0).map(|t| t.state)
}

/// How one green thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadReport {
    pub id: ThreadId,
    pub state: ThreadState,
    /// Times the dispatcher resumed the thread
    pub activations: u64,
}

/// Outcome of a [`run`], one entry per reclaimed thread in id order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub threads: Vec<ThreadReport>,
}

impl RunReport {
    pub fn finished(&self) -> impl Iterator<Item = &ThreadReport> {
        self.threads
            .iter()
            .filter(|t| t.state == ThreadState::Finished)
    }

    pub fn faulted(&self) -> impl Iterator<Item = (&ThreadReport, Fault)> {
        self.threads.iter().filter_map(|t| match t.state {
            ThreadState::Faulted(fault) => Some((t, fault)),
            _ => None,
        })
    }
}

/// Run every registered green thread until none is ready.
///
/// Arms the preemption timer, dispatches the first thread and blocks until
/// all threads have finished or faulted. The timer, the `SIGALRM`
/// disposition and the signal mask are restored before returning, then
/// every control block is reclaimed.
pub fn run() -> Result<RunReport, RunError> {
    {
        let sched = unsafe { &*scheduler() };
        if sched.running {
            return Err(RunError::AlreadyRunning);
        }
        if sched.threads.is_empty() {
            return Ok(RunReport::default());
        }
    }

    let preemption = Preemption::start(TIME_SLICE)?;

    {
        let sched = unsafe { &mut *scheduler() };
        info!(
            "running {} green threads, {:?} time slice",
            sched.threads.len(),
            TIME_SLICE
        );
        sched.task_mask = Some(preemption.task_mask());
        sched.current = None;
        sched.running = true;
    }

    // Comes back here once no thread is ready
    unsafe { dispatch() };

    {
        let sched = unsafe { &mut *scheduler() };
        sched.running = false;
        sched.task_mask = None;
    }
    drop(preemption);

    let report = unsafe { &mut *scheduler() }.reclaim();
    info!(
        "run complete: {} finished, {} faulted",
        report.finished().count(),
        report.faulted().count()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_in(states: &[bool]) -> impl Fn(usize) -> bool + '_ {
        move |idx| states[idx]
    }

    #[test]
    fn first_dispatch_starts_at_zero() {
        let states = [true, true, true];
        assert_eq!(round_robin(3, None, ready_in(&states)), Some(0));
    }

    #[test]
    fn picks_next_index_after_current() {
        let states = [true, true, true];
        assert_eq!(round_robin(3, Some(0), ready_in(&states)), Some(1));
        assert_eq!(round_robin(3, Some(1), ready_in(&states)), Some(2));
        assert_eq!(round_robin(3, Some(2), ready_in(&states)), Some(0));
    }

    #[test]
    fn skips_threads_that_are_not_ready() {
        let states = [true, false, false, true];
        assert_eq!(round_robin(4, Some(0), ready_in(&states)), Some(3));
        assert_eq!(round_robin(4, Some(3), ready_in(&states)), Some(0));
    }

    #[test]
    fn current_thread_is_considered_last() {
        let states = [false, true, false];
        assert_eq!(round_robin(3, Some(1), ready_in(&states)), Some(1));
    }

    #[test]
    fn nothing_ready() {
        let states = [false, false];
        assert_eq!(round_robin(2, Some(0), ready_in(&states)), None);
        assert_eq!(round_robin(0, None, |_| true), None);
    }

    #[test]
    fn full_cycle_visits_every_ready_thread_once() {
        let states = [true; 5];
        let mut cur = None;
        let mut order = Vec::new();
        for _ in 0..10 {
            cur = round_robin(5, cur, ready_in(&states));
            order.push(cur.unwrap());
        }
        assert_eq!(order, [0, 1, 2, 3, 4, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn table_full_leaves_table_unchanged() {
        for i in 0..MAX_THREADS {
            let id = spawn(|| {}).unwrap();
            assert_eq!(id, ThreadId(i));
        }
        assert!(matches!(spawn(|| {}), Err(CreationError::TableFull)));
        assert_eq!(thread_count(), MAX_THREADS);

        unsafe { (&mut *scheduler()).reclaim() };
        assert_eq!(thread_count(), 0);
    }

    #[test]
    fn empty_run_returns_immediately() {
        let report = run().unwrap();
        assert!(report.threads.is_empty());
    }

    #[test]
    fn introspection_outside_a_run() {
        assert_eq!(current_thread(), None);
        let id = Builder::new().stack_size(64 * 1024).spawn(|| {}).unwrap();
        assert_eq!(thread_state(id), Some(ThreadState::Ready));
        assert_eq!(thread_state(ThreadId(id.0 + 1)), None);
        unsafe { (&mut *scheduler()).reclaim() };
    }
}
