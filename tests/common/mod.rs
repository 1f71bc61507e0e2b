#![allow(dead_code)]

use std::mem;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Runs share the process-wide timer and signal dispositions.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn handler_of(signo: libc::c_int) -> libc::sighandler_t {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(signo, ptr::null(), &mut action), 0);
        action.sa_sigaction
    }
}

pub fn set_handler(signo: libc::c_int, handler: libc::sighandler_t) {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(libc::sigaction(signo, &action, ptr::null_mut()), 0);
    }
}

pub fn real_timer() -> libc::itimerval {
    unsafe {
        let mut timer: libc::itimerval = mem::zeroed();
        assert_eq!(libc::getitimer(libc::ITIMER_REAL, &mut timer), 0);
        timer
    }
}

pub fn set_real_timer(interval: libc::timeval, value: libc::timeval) {
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: value,
    };
    unsafe {
        assert_eq!(libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()), 0);
    }
}

pub fn secs(tv_sec: libc::time_t) -> libc::timeval {
    libc::timeval { tv_sec, tv_usec: 0 }
}

pub fn tick_blocked() -> bool {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut mask);
        libc::sigismember(&mask, libc::SIGALRM) == 1
    }
}

/// Spin for a while without yielding, so only the timer can switch away.
pub fn busy(iterations: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..iterations {
        acc = std::hint::black_box(acc.wrapping_add(i));
    }
    acc
}
