//! Timer-driven preemption.
//!
//! An `ITIMER_REAL` interval timer delivers `SIGALRM` every [`TIME_SLICE`].
//! The handler demotes the running green thread to `Ready` and calls the
//! dispatcher, so time slicing needs no yield calls in user code.
//!
//! `SIGALRM` is process-directed: the kernel may deliver it to any OS thread
//! that does not block it. Only the OS thread that owns the active run
//! touches the scheduler; any other thread forwards the tick to it with
//! `pthread_kill`.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::RunError;
use crate::fault::FaultSignal;
use crate::scheduler;

/// Interval between preemption ticks
pub const TIME_SLICE: Duration = Duration::from_micros(256);

/// Set while a run owns the timer; the timer is process-wide
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// `pthread_t` of the OS thread running the scheduler, 0 when no run is active
static RUNTIME_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Handlers currently between reading `RUNTIME_THREAD` and `pthread_kill`
static FORWARDING: AtomicUsize = AtomicUsize::new(0);

fn current_pthread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// Whether the caller is the OS thread that owns the active run.
pub(crate) fn on_runtime_thread() -> bool {
    let owner = RUNTIME_THREAD.load(Ordering::SeqCst);
    owner != 0 && owner == current_pthread()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

/// Saves `errno` on creation and puts it back on drop.
///
/// errno belongs to the OS thread, so every green thread shares it. A
/// handler that switches threads must hand the interrupted one its own
/// value back when it resumes.
pub(crate) struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub fn save() -> Self {
        ErrnoGuard(unsafe { *errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe { *errno_location() = self.0 };
    }
}

fn tick_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGALRM);
        set
    }
}

/// Block `SIGALRM` on the calling OS thread and leave it blocked.
pub(crate) fn block_ticks() {
    let set = tick_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }
}

/// Replace the calling OS thread's signal mask.
pub(crate) fn set_mask(mask: &libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, ptr::null_mut());
    }
}

/// Guard that blocks `SIGALRM` while it is in scope.
///
/// Used around scheduler table updates that may run inside a green thread.
pub(crate) struct SignalGuard {
    old_mask: libc::sigset_t,
}

impl SignalGuard {
    pub fn block() -> Self {
        let set = tick_set();
        unsafe {
            let mut old_mask: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old_mask);
            SignalGuard { old_mask }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        set_mask(&self.old_mask);
    }
}

/// Run `f` without being preempted.
///
/// A tick that arrives meanwhile is held back and taken as soon as `f`
/// returns. Green threads must use this around anything that takes a
/// process-wide lock, such as printing to stdout or stderr: a thread
/// preempted while holding such a lock would let the next green thread
/// re-enter it on the same OS thread.
///
/// Outside a run this just calls `f`.
///
/// ```no_run
/// use greenrt::{run, spawn, without_preemption};
///
/// for i in 0..4 {
///     spawn(move || {
///         for _ in 0..100 {
///             without_preemption(|| println!("thread {i}"));
///         }
///     })
///     .unwrap();
/// }
/// run().unwrap();
/// ```
pub fn without_preemption<R>(f: impl FnOnce() -> R) -> R {
    let _guard = SignalGuard::block();
    f()
}

fn timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

/// Installed tick handler and armed timer.
///
/// Dropping it restores the interval timer, the `SIGALRM` disposition and
/// the signal mask that were in place when [`Preemption::start`] ran.
pub(crate) struct Preemption {
    old_action: libc::sigaction,
    old_timer: libc::itimerval,
    old_mask: libc::sigset_t,
}

impl Preemption {
    /// Claim the timer for the calling thread, install the tick handler
    /// and arm the timer.
    ///
    /// `SIGALRM` stays blocked on the calling thread afterwards: the first
    /// dispatch must not be interrupted.
    pub fn start(interval: Duration) -> Result<Self, RunError> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }

        let set = tick_set();
        let mut old_mask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old_mask);
        }
        RUNTIME_THREAD.store(current_pthread(), Ordering::SeqCst);

        match unsafe { arm(interval) } {
            Ok((old_action, old_timer)) => Ok(Preemption {
                old_action,
                old_timer,
                old_mask,
            }),
            Err(err) => {
                RUNTIME_THREAD.store(0, Ordering::SeqCst);
                set_mask(&old_mask);
                ACTIVE.store(false, Ordering::Release);
                Err(RunError::Preemption(err))
            }
        }
    }

    /// Signal mask for green threads: the host's mask with the tick and the
    /// synchronous fault signals deliverable.
    pub fn task_mask(&self) -> libc::sigset_t {
        task_mask(&self.old_mask)
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        unsafe {
            let disarmed: libc::itimerval = mem::zeroed();
            libc::setitimer(libc::ITIMER_REAL, &disarmed, ptr::null_mut());
        }

        // Wait out handlers on other threads that may still forward a tick here
        RUNTIME_THREAD.store(0, Ordering::SeqCst);
        while FORWARDING.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }

        unsafe {
            // Ignoring the signal discards a tick that is still pending
            let mut ignore: libc::sigaction = mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            libc::sigaction(libc::SIGALRM, &ignore, ptr::null_mut());

            set_mask(&self.old_mask);
            libc::sigaction(libc::SIGALRM, &self.old_action, ptr::null_mut());
            libc::setitimer(libc::ITIMER_REAL, &self.old_timer, ptr::null_mut());
        }
        ACTIVE.store(false, Ordering::Release);
    }
}

/// Install `on_tick` for `SIGALRM` and start the interval timer, returning
/// what was there before. Nothing is left changed on failure.
unsafe fn arm(interval: Duration) -> io::Result<(libc::sigaction, libc::itimerval)> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = on_tick as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;

        let mut old_action: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGALRM, &sa, &mut old_action) != 0 {
            return Err(io::Error::last_os_error());
        }

        let timer = libc::itimerval {
            it_interval: timeval(interval),
            it_value: timeval(interval),
        };
        let mut old_timer: libc::itimerval = mem::zeroed();
        if libc::setitimer(libc::ITIMER_REAL, &timer, &mut old_timer) != 0 {
            let err = io::Error::last_os_error();
            libc::sigaction(libc::SIGALRM, &old_action, ptr::null_mut());
            return Err(err);
        }
        Ok((old_action, old_timer))
    }
}

fn task_mask(host: &libc::sigset_t) -> libc::sigset_t {
    let mut mask = *host;
    unsafe {
        libc::sigdelset(&mut mask, libc::SIGALRM);
        for signal in FaultSignal::ALL.iter().filter(|s| s.is_synchronous()) {
            libc::sigdelset(&mut mask, signal.signo());
        }
    }
    mask
}

/// `SIGALRM` handler. No allocation, no locks: flag flips and a context
/// switch only.
extern "C" fn on_tick(_signum: libc::c_int) {
    let _errno = ErrnoGuard::save();

    if on_runtime_thread() {
        // SAFETY: we are on the runtime thread and the kernel blocks SIGALRM
        // for the duration of this handler.
        unsafe { scheduler::preempt() };
        return;
    }

    FORWARDING.fetch_add(1, Ordering::SeqCst);
    let owner = RUNTIME_THREAD.load(Ordering::SeqCst);
    if owner != 0 {
        unsafe {
            libc::pthread_kill(owner as libc::pthread_t, libc::SIGALRM);
        }
    }
    FORWARDING.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_mask() -> libc::sigset_t {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut mask);
            mask
        }
    }

    fn is_member(set: &libc::sigset_t, signo: libc::c_int) -> bool {
        unsafe { libc::sigismember(set, signo) == 1 }
    }

    #[test]
    fn guard_blocks_and_restores_tick() {
        assert!(!is_member(&current_mask(), libc::SIGALRM));
        {
            let _guard = SignalGuard::block();
            assert!(is_member(&current_mask(), libc::SIGALRM));
        }
        assert!(!is_member(&current_mask(), libc::SIGALRM));
    }

    #[test]
    fn task_mask_unblocks_tick_and_faults_only() {
        let mut host: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigfillset(&mut host);
        }
        let mask = task_mask(&host);
        assert!(!is_member(&mask, libc::SIGALRM));
        assert!(!is_member(&mask, libc::SIGFPE));
        assert!(!is_member(&mask, libc::SIGSEGV));
        assert!(is_member(&mask, libc::SIGINT));
        assert!(is_member(&mask, libc::SIGUSR1));
    }

    #[test]
    fn time_slice_converts_to_timeval() {
        let tv = timeval(TIME_SLICE);
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 256);

        let tv = timeval(Duration::from_millis(1500));
        assert_eq!(tv.tv_sec, 1);
        assert_eq!(tv.tv_usec, 500_000);
    }

    #[test]
    fn errno_is_restored() {
        unsafe { *errno_location() = libc::EAGAIN };
        {
            let _guard = ErrnoGuard::save();
            unsafe { *errno_location() = libc::EINTR };
        }
        assert_eq!(unsafe { *errno_location() }, libc::EAGAIN);
    }

    #[test]
    fn without_preemption_holds_ticks_for_the_closure_only() {
        let inside = without_preemption(|| is_member(&current_mask(), libc::SIGALRM));
        assert!(inside);
        assert!(!is_member(&current_mask(), libc::SIGALRM));
    }

    #[test]
    fn no_runtime_thread_when_idle() {
        assert!(!on_runtime_thread());
    }
}
