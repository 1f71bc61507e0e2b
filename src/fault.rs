//! Fault containment for green threads.
//!
//! One handler covers a fixed set of fault signals. A fault raised by the
//! running green thread is reported once, the thread is parked as
//! [`ThreadState::Faulted`](crate::ThreadState::Faulted) and the dispatcher
//! moves on, so the remaining threads keep making progress. The faulting
//! thread's machine state is unrecoverable and it is never resumed; its
//! slot is reclaimed when `run()` returns.
//!
//! A fault outside any green thread is reported and re-raised with the
//! default disposition. `SIGINT` is a stop request for the whole process.

use std::fmt::{self, Write};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::preempt::{ErrnoGuard, on_runtime_thread};
use crate::scheduler;
use crate::thread::{Fault, ThreadId};

/// Signals handled by the fault containment layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSignal {
    /// `SIGFPE`, e.g. integer division by zero
    ArithmeticException,
    /// `SIGSEGV`
    SegmentationViolation,
    /// `SIGILL`
    IllegalInstruction,
    /// `SIGBUS`
    BusError,
    /// `SIGINT`, terminates the process
    Interrupt,
}

impl FaultSignal {
    pub const ALL: [FaultSignal; 5] = [
        FaultSignal::ArithmeticException,
        FaultSignal::SegmentationViolation,
        FaultSignal::IllegalInstruction,
        FaultSignal::BusError,
        FaultSignal::Interrupt,
    ];

    pub fn signo(self) -> libc::c_int {
        match self {
            FaultSignal::ArithmeticException => libc::SIGFPE,
            FaultSignal::SegmentationViolation => libc::SIGSEGV,
            FaultSignal::IllegalInstruction => libc::SIGILL,
            FaultSignal::BusError => libc::SIGBUS,
            FaultSignal::Interrupt => libc::SIGINT,
        }
    }

    pub fn from_signo(signo: libc::c_int) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.signo() == signo)
    }

    /// Raised by the faulting instruction itself rather than sent from outside.
    pub fn is_synchronous(self) -> bool {
        self != FaultSignal::Interrupt
    }

    fn description(self) -> &'static str {
        match self {
            FaultSignal::ArithmeticException => "arithmetic exception",
            FaultSignal::SegmentationViolation => "segmentation violation",
            FaultSignal::IllegalInstruction => "illegal instruction",
            FaultSignal::BusError => "bus error",
            FaultSignal::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for FaultSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Dispositions found by the first `install_fault_handlers()`
static SAVED: Mutex<Option<[libc::sigaction; FaultSignal::ALL.len()]>> = Mutex::new(None);

static REPORTED: AtomicUsize = AtomicUsize::new(0);

/// Number of faults reported since process start.
pub fn faults_reported() -> usize {
    REPORTED.load(Ordering::Relaxed)
}

/// Install the fault handler for every signal in [`FaultSignal::ALL`].
///
/// Calling it again while installed is a no-op, so the saved dispositions
/// always describe the state before the first call.
pub fn install_fault_handlers() -> io::Result<()> {
    let mut saved = SAVED.lock().unwrap_or_else(PoisonError::into_inner);
    if saved.is_some() {
        return Ok(());
    }

    let mut previous: [libc::sigaction; FaultSignal::ALL.len()] = unsafe { mem::zeroed() };
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = on_fault
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as libc::sighandler_t;
        sa.sa_flags = libc::SA_SIGINFO;
        // The dispatcher may run from this handler, so ticks must stay out
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGALRM);
        for signal in FaultSignal::ALL {
            libc::sigaddset(&mut sa.sa_mask, signal.signo());
        }

        for (i, signal) in FaultSignal::ALL.iter().enumerate() {
            if libc::sigaction(signal.signo(), &sa, &mut previous[i]) != 0 {
                let err = io::Error::last_os_error();
                for (signal, old) in FaultSignal::ALL[..i].iter().zip(&previous) {
                    libc::sigaction(signal.signo(), old, ptr::null_mut());
                }
                return Err(err);
            }
        }
    }

    *saved = Some(previous);
    debug!("fault handlers installed");
    Ok(())
}

/// Put back the dispositions that `install_fault_handlers()` replaced.
///
/// A no-op when the handlers are not installed.
pub fn restore_fault_handlers() -> io::Result<()> {
    let mut saved = SAVED.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(previous) = saved.take() else {
        return Ok(());
    };

    let mut result = Ok(());
    for (signal, old) in FaultSignal::ALL.iter().zip(&previous) {
        if unsafe { libc::sigaction(signal.signo(), old, ptr::null_mut()) } != 0 && result.is_ok() {
            result = Err(io::Error::last_os_error());
        }
    }
    debug!("fault handlers restored");
    result
}

/// Fixed-size line for reports written from signal context.
struct ReportLine {
    buf: [u8; 160],
    len: usize,
}

impl ReportLine {
    fn new() -> Self {
        ReportLine {
            buf: [0; 160],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Write for ReportLine {
    // Truncates instead of failing
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn format_report(signal: FaultSignal, thread: Option<ThreadId>, address: Option<usize>) -> ReportLine {
    let mut line = ReportLine::new();
    let _ = match thread {
        Some(id) => write!(line, "[greenrt] green thread {id}: {signal}"),
        None if signal.is_synchronous() => write!(line, "[greenrt] {signal} outside any green thread"),
        None => write!(line, "[greenrt] {signal}, terminating"),
    };
    if let Some(address) = address {
        let _ = write!(line, " at {address:#x}");
    }
    let _ = line.write_str("\n");
    line
}

fn report(signal: FaultSignal, thread: Option<ThreadId>, address: Option<usize>) {
    REPORTED.fetch_add(1, Ordering::Relaxed);
    let line = format_report(signal, thread, address);
    let bytes = line.as_bytes();
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn si_addr(info: *const libc::siginfo_t) -> usize {
    unsafe { (&*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn si_addr(info: *const libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr as usize }
}

/// Faulting address, when the kernel generated the signal.
fn fault_address(info: *const libc::siginfo_t) -> Option<usize> {
    if info.is_null() {
        return None;
    }
    // si_code <= 0 means the signal was sent by kill/raise/tgkill
    unsafe { ((*info).si_code > 0).then(|| si_addr(info)) }
}

extern "C" fn on_fault(signum: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let _errno = ErrnoGuard::save();
    let Some(signal) = FaultSignal::from_signo(signum) else {
        return;
    };

    if signal == FaultSignal::Interrupt {
        report(signal, None, None);
        unsafe { libc::_exit(128 + signum) };
    }

    let address = fault_address(info);
    if on_runtime_thread() {
        // SAFETY: runtime thread, SIGALRM blocked through sa_mask
        if let Some(id) = unsafe { scheduler::running_thread() } {
            report(signal, Some(id), address);
            // Never returns: the faulting thread is not resumed
            unsafe { scheduler::park_faulted(Fault::Signal(signal)) };
        }
    }

    report(signal, None, address);
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        // Blocked until this handler returns, then fatal
        libc::raise(signum);
    }
}
