//! # Wait queues
//!
//! Every lock in the crate parks its threads on a kernel wait queue keyed by the address of an `i32` word.
//! There are just a few operations:
//! - `wait(&word, expected, timeout)` - blocks only if the word still holds `expected`, may wake up spuriously
//! - `wake(&word, n)` - wakes up to `n` threads waiting on the word
//! - `cmp_requeue(&from, expected, &to, ..)` - moves the waiters of one word onto another one's queue
//!
//! The wait/wake pair doesn't take any part in memory consistency, the atomics around it do.
//! All of the operations are process-private.

use std::{
    io, ptr,
    sync::atomic::AtomicI32,
    time::Duration,
};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("runtime-locks parks threads on futex wait queues, which only linux and android provide");

/// What woke up a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// somebody called wake on the word (or the kernel felt like it)
    Woken,
    /// the word didn't hold the expected value or a signal interrupted the wait
    Spurious,
    /// the relative timeout elapsed
    TimedOut,
}

fn to_timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    }
}

fn word_ptr(word: &AtomicI32) -> *const i32 {
    word as *const AtomicI32 as *const i32
}

/// Blocks on `word` while it holds `expected`, for at most `timeout` when one is given.
/// EAGAIN and EINTR are folded into [WaitResult::Spurious], any other failure is returned as is.
pub fn wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> io::Result<WaitResult> {
    let ts = timeout.map(to_timespec);
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |ts| ts as *const libc::timespec);
    // SAFETY: the word is a live, aligned i32 for the duration of the call, the timespec outlives it too
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word_ptr(word),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 {
        return Ok(WaitResult::Woken);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(WaitResult::Spurious),
        Some(libc::ETIMEDOUT) if timeout.is_some() => Ok(WaitResult::TimedOut),
        _ => Err(err),
    }
}

/// Wakes at most `count` waiters of the word, returns how many were woken
pub fn wake(word: &AtomicI32, count: i32) -> io::Result<usize> {
    // SAFETY: the word is a live, aligned i32, FUTEX_WAKE doesn't touch its value
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word_ptr(word),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Wakes every waiter of the word
pub fn wake_all(word: &AtomicI32) -> io::Result<usize> {
    wake(word, i32::MAX)
}

/// Wakes `wake` waiters of `from` and moves up to `requeue` of the remaining ones onto the queue of `to`,
/// but only if `from` still holds `expected`.
///
/// Returns `Ok(false)` when `from` changed under our feet and the caller has to retry.
pub fn cmp_requeue(
    from: &AtomicI32,
    expected: i32,
    to: &AtomicI32,
    wake: i32,
    requeue: i32,
) -> io::Result<bool> {
    // SAFETY: both words are live, aligned i32s. The kernel reads the requeue limit from the timeout slot.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word_ptr(from),
            libc::FUTEX_CMP_REQUEUE | libc::FUTEX_PRIVATE_FLAG,
            wake,
            requeue as libc::c_long,
            word_ptr(to),
            expected,
        )
    };
    if rc >= 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}
