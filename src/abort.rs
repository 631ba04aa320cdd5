//! # Fatal errors and the abort policy
//!
//! Misusing a lock (unlocking somebody else's mutex, breaking the level order, ...) is a logic bug, not
//! something to recover from. Such errors go through [fatal](crate::fatal!): logged at `error`, then the thread panics.
//!
//! Destructors are more careful. During shutdown a daemon thread may legitimately still be inside a lock
//! when the lock goes away, so they ask [is_safe_to_abort] first and only warn when aborting would make
//! things worse.

use std::{fmt, sync::OnceLock};

static ABORT_POLICY: OnceLock<fn() -> bool> = OnceLock::new();

/// Installs the process-wide "is it safe to abort now" predicate.
/// The first policy wins, returns whether this one got installed.
pub fn set_abort_policy(policy: fn() -> bool) -> bool {
    ABORT_POLICY.set(policy).is_ok()
}

/// Never safe while the current thread is already unwinding: a second panic would abort the process
/// without telling anybody what went wrong first.
pub fn is_safe_to_abort() -> bool {
    !std::thread::panicking() && ABORT_POLICY.get().map_or(true, |policy| policy())
}

/// Logs and panics. Panicking while already unwinding aborts the process, so abort explicitly instead.
#[cold]
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("{args}");
    if std::thread::panicking() {
        std::process::abort();
    }
    panic!("{args}");
}

/// Same as [fatal] when the abort policy allows it, a warning otherwise
#[cold]
#[track_caller]
pub fn fatal_or_warn(args: fmt::Arguments<'_>) {
    if is_safe_to_abort() {
        fatal(args);
    }
    log::warn!("{args}");
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::abort::fatal(format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! fatal_or_warn {
    ($($arg:tt)+) => {
        $crate::abort::fatal_or_warn(format_args!($($arg)+))
    };
}
