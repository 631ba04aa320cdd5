//! # Lock registry
//!
//! The process-wide named locks, created once by [Locks::init] and reachable through [Locks::get] ever after.
//!
//! ## Creation order
//!
//! The locks are created top-down, strictly descending by level, the order of the list below.
//! A list out of order doesn't compile: the order is checked by a `const_assert`, long before there's
//! a process to abort or a logger to complain to.
//!
//! ## Weak reference access
//!
//! A few locks may be held by a thread that's blocked on a weak reference access. Threads blocked on those
//! locks must still answer empty checkpoints, otherwise a checkpoint could wait on them forever.
//! Such locks are flagged to respond to checkpoints and kept in a list the checkpoint requester wakes up
//! periodically. The list is guarded by a [SpinLock], not a [Mutex]: the mutexes can't depend on themselves.

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, OnceLock,
    },
    time::Duration,
};

use static_assertions::const_assert;

use crate::{
    abort,
    base::{Lockable, DEBUG_LOCKING},
    checkpoint::CheckpointSlot,
    fatal,
    level::{is_strictly_descending, LockLevel},
    spin::SpinLock,
    sync::{Barrier, ConditionVariable, MutatorKey, MutatorMutex, Mutex, MutexLock, ReaderWriterMutex},
    thread::ThreadContext,
};

/// how often a waiting checkpoint requester wakes the locks threads may be stuck on
pub const EMPTY_CHECKPOINT_PERIOD: Duration = Duration::from_millis(100);

/// with debug locking, a checkpoint taking longer than that is fatal
pub const EMPTY_CHECKPOINT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    AlreadyInitialized,
    NotInitialized,
    MutatorKeyTaken,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyInitialized => write!(f, "the lock registry is already initialized"),
            LockError::NotInitialized => write!(f, "the lock registry isn't initialized yet"),
            LockError::MutatorKeyTaken => write!(f, "the mutator lock key was already handed out"),
        }
    }
}

impl Error for LockError {}

static LOCKS: OnceLock<Locks> = OnceLock::new();

macro_rules! registry {
    ($($(#[$doc:meta])* $field:ident: $kind:ident($name:literal, $level:ident),)*) => {
        pub struct Locks {
            $($(#[$doc])* pub $field: &'static $kind,)*
            /// signaled when a thread leaves the thread list
            pub thread_exit_cond: ConditionVariable,
            expected_on_weak_ref_access: SpinLock<Vec<&'static dyn Lockable>>,
            mutator_key_taken: AtomicBool,
        }

        const CREATION_ORDER: &[LockLevel] = &[$(LockLevel::$level,)*];

        impl Locks {
            fn create() -> Self {
                struct Created {
                    $($field: &'static $kind,)*
                }
                let created = Created {
                    $($field: Box::leak(Box::new($kind::new($name, LockLevel::$level))),)*
                };
                Self {
                    $($field: created.$field,)*
                    thread_exit_cond: ConditionVariable::new(
                        "thread exit condition variable",
                        created.thread_list_lock,
                    ),
                    expected_on_weak_ref_access: SpinLock::new(Vec::new()),
                    mutator_key_taken: AtomicBool::new(false),
                }
            }

            /// Every named lock, top level first
            pub fn all(&self) -> Vec<&'static dyn Lockable> {
                vec![$(self.$field as &'static dyn Lockable,)*]
            }
        }
    };
}

registry! {
    instrument_entrypoints_lock: Mutex("instrument entrypoint lock", InstrumentEntrypoints),
    /// held while suspending threads on behalf of user code, may be held when taking a top level lock
    user_code_suspension_lock: Mutex("user code suspension lock", UserCodeSuspension),
    /// shared by every runnable thread, exclusive means the world is stopped
    mutator_lock: MutatorMutex("mutator lock", Mutator),
    heap_bitmap_lock: ReaderWriterMutex("heap bitmap lock", HeapBitmap),
    trace_lock: Mutex("trace lock", Trace),
    runtime_shutdown_lock: Mutex("runtime shutdown lock", RuntimeShutdown),
    profiler_lock: Mutex("profiler lock", Profiler),
    deoptimization_lock: Mutex("Deoptimization lock", Deoptimization),
    alloc_tracker_lock: Mutex("AllocTracker lock", AllocTracker),
    /// guards the thread list, [Locks::thread_exit_cond] waits on it
    thread_list_lock: Mutex("thread list lock", ThreadList),
    jni_libraries_lock: Mutex("JNI shared libraries map lock", JniLoadLibrary),
    breakpoint_lock: ReaderWriterMutex("breakpoint lock", Breakpoint),
    subtype_check_lock: Mutex("SubtypeCheck lock", SubtypeCheck),
    cha_lock: Mutex("CHA lock", Cha),
    classlinker_classes_lock: ReaderWriterMutex("ClassLinker classes lock", ClassLinkerClasses),
    allocated_monitor_ids_lock: Mutex("allocated monitor ids lock", MonitorPool),
    allocated_thread_ids_lock: Mutex("allocated thread ids lock", AllocatedThreadIds),
    dex_lock: ReaderWriterMutex("DexLock", Dex),
    oat_file_manager_lock: ReaderWriterMutex("OatFile manager lock", OatFileManager),
    verifier_deps_lock: ReaderWriterMutex("verifier deps lock", VerifierDeps),
    host_dlopen_handles_lock: Mutex("host dlopen handles lock", HostDlOpenHandles),
    intern_table_lock: Mutex("InternTable lock", InternTable),
    reference_processor_lock: Mutex("ReferenceProcessor lock", ReferenceProcessor),
    reference_queue_cleared_references_lock: Mutex("ReferenceQueue cleared references lock", ReferenceQueueClearedReferences),
    reference_queue_weak_references_lock: Mutex("ReferenceQueue weak references lock", ReferenceQueueWeakReferences),
    reference_queue_finalizer_references_lock: Mutex("ReferenceQueue finalizer references lock", ReferenceQueueFinalizerReferences),
    reference_queue_phantom_references_lock: Mutex("ReferenceQueue phantom references lock", ReferenceQueuePhantomReferences),
    reference_queue_soft_references_lock: Mutex("ReferenceQueue soft references lock", ReferenceQueueSoftReferences),
    jni_globals_lock: ReaderWriterMutex("JNI global reference table lock", JniGlobals),
    jni_weak_globals_lock: Mutex("JNI weak global reference table lock", JniWeakGlobals),
    jni_function_table_lock: Mutex("JNI function table lock", JniFunctionTable),
    native_debug_interface_lock: Mutex("Native debug interface lock", NativeDebugInterface),
    /// held while aborting, nobody else may abort meanwhile
    abort_lock: Mutex("abort lock", Abort),
    thread_suspend_count_lock: Mutex("thread suspend count lock", ThreadSuspendCount),
    unexpected_signal_lock: Mutex("unexpected signal lock", UnexpectedSignal),
    logging_lock: Mutex("logging lock", Logging),
}

const_assert!(is_strictly_descending(CREATION_ORDER));

impl Locks {
    /// Creates every named lock. One shot: a second call gets [LockError::AlreadyInitialized].
    ///
    /// Also flags the locks expected during weak reference access and installs
    /// [Locks::is_safe_to_call_abort_racy] as the abort policy.
    pub fn init() -> Result<&'static Locks, LockError> {
        let mut fresh = false;
        let locks = LOCKS.get_or_init(|| {
            fresh = true;
            Locks::create()
        });
        if !fresh {
            return Err(LockError::AlreadyInitialized);
        }
        locks.add_to_expected_on_weak_ref_access(locks.dex_lock);
        locks.add_to_expected_on_weak_ref_access(locks.classlinker_classes_lock);
        locks.add_to_expected_on_weak_ref_access(locks.jni_libraries_lock);
        if !abort::set_abort_policy(Locks::is_safe_to_call_abort_racy) {
            log::debug!("an abort policy was installed before the lock registry, keeping it");
        }
        log::debug!("lock registry initialized with {} locks", CREATION_ORDER.len());
        Ok(locks)
    }

    pub fn get() -> Option<&'static Locks> {
        LOCKS.get()
    }

    /// [Locks::get] for callers that want an error to propagate
    pub fn instance() -> Result<&'static Locks, LockError> {
        Locks::get().ok_or(LockError::NotInitialized)
    }

    /// The only way to the mutator lock's state transitions. Handed out once, to the thread state machine.
    pub fn take_mutator_key(&self) -> Result<MutatorKey, LockError> {
        if self.mutator_key_taken.swap(true, SeqCst) {
            return Err(LockError::MutatorKeyTaken);
        }
        Ok(MutatorKey::new())
    }

    /// Safe unless somebody's already aborting. Racy: the abort lock may get taken right after the check.
    pub fn is_safe_to_call_abort_racy() -> bool {
        Locks::get().is_some_and(|locks| locks.abort_lock.exclusive_owner_tid() == 0)
    }

    /// Flags the lock to respond to empty checkpoints and adds it to the list the requester wakes up
    pub fn add_to_expected_on_weak_ref_access(&self, lock: &'static dyn Lockable) {
        let mut expected = self.expected_on_weak_ref_access.lock();
        lock.base().set_should_respond_to_checkpoint(true);
        if !expected.iter().any(|l| l.base().handle() == lock.base().handle()) {
            expected.push(lock);
        }
    }

    pub fn remove_from_expected_on_weak_ref_access(&self, lock: &dyn Lockable) {
        let mut expected = self.expected_on_weak_ref_access.lock();
        lock.base().set_should_respond_to_checkpoint(false);
        expected.retain(|l| l.base().handle() != lock.base().handle());
    }

    pub fn is_expected_on_weak_ref_access(&self, lock: &dyn Lockable) -> bool {
        let expected = self.expected_on_weak_ref_access.lock();
        let found = expected.iter().any(|l| l.base().handle() == lock.base().handle());
        if DEBUG_LOCKING && found != lock.base().should_respond_to_checkpoint() {
            fatal!(
                "\"{}\" responds to checkpoints: {} but is on the weak reference list: {found}",
                lock.name(),
                lock.base().should_respond_to_checkpoint()
            );
        }
        found
    }

    fn wake_expected_for_checkpoint(&self) {
        // wake outside of the spin lock, waking is a syscall
        let expected = self.expected_on_weak_ref_access.lock().clone();
        for lock in expected {
            lock.wakeup_to_respond_to_checkpoint();
        }
    }

    /// Makes every runnable thread of `slots` pass a barrier and waits for them. Returns how many threads
    /// were asked; suspended ones are skipped.
    ///
    /// Threads blocked on a lock of the weak reference list get woken every [EMPTY_CHECKPOINT_PERIOD]
    /// so they notice the request. One wakeup isn't enough: the thread may be between its checkpoint check
    /// and the futex call when the wake arrives.
    pub fn run_empty_checkpoint<T: ThreadContext + ?Sized>(&self, thread: &T, slots: &[Arc<CheckpointSlot>]) -> usize {
        self.mutator_lock.assert_not_exclusive_held(thread);
        self.thread_list_lock.assert_not_held(thread);
        self.thread_suspend_count_lock.assert_not_held(thread);

        let barrier = Arc::new(Barrier::new(0));
        let mut count = 0;
        {
            let _mu = MutexLock::new(thread, self.thread_list_lock);
            let _mu2 = MutexLock::new(thread, self.thread_suspend_count_lock);
            for slot in slots {
                if slot.request(&barrier) {
                    count += 1;
                }
            }
        }
        log::trace!("empty checkpoint requested from {count} of {} threads", slots.len());

        let mut total_wait = Duration::ZERO;
        let mut first_iteration = true;
        loop {
            self.wake_expected_for_checkpoint();
            // the count goes in once, later rounds only wait
            let delta = if first_iteration { count as i32 } else { 0 };
            first_iteration = false;
            if !barrier.increment_timed(thread, delta, EMPTY_CHECKPOINT_PERIOD) {
                break;
            }
            total_wait += EMPTY_CHECKPOINT_PERIOD;
            if DEBUG_LOCKING && total_wait > EMPTY_CHECKPOINT_TOTAL_TIMEOUT {
                fatal!(
                    "Empty checkpoint timeout\nBarrier count {}\n{}",
                    barrier.count(),
                    self.mutator_lock
                );
            }
        }
        count
    }

    /// One line per named lock, top level first
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for lock in self.all() {
            lock.dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn locks() -> &'static Locks {
        match Locks::init() {
            Ok(locks) => locks,
            Err(_) => Locks::get().unwrap(),
        }
    }

    #[test]
    fn created_top_down() {
        let levels: Vec<_> = locks().all().iter().map(|l| l.level()).collect();
        assert_eq!(levels, CREATION_ORDER);
        assert_eq!(levels.first(), Some(&LockLevel::InstrumentEntrypoints));
        assert_eq!(levels.last(), Some(&LockLevel::Logging));
    }

    #[test]
    fn second_init_fails() {
        locks();
        assert_eq!(Locks::init().err(), Some(LockError::AlreadyInitialized));
        assert!(Locks::instance().is_ok());
    }

    #[test]
    fn weak_ref_list_starts_with_the_class_locks() {
        let locks = locks();
        assert!(locks.is_expected_on_weak_ref_access(locks.dex_lock));
        assert!(locks.is_expected_on_weak_ref_access(locks.classlinker_classes_lock));
        assert!(locks.is_expected_on_weak_ref_access(locks.jni_libraries_lock));
        assert!(!locks.is_expected_on_weak_ref_access(locks.trace_lock));
        assert!(locks.dex_lock.base().should_respond_to_checkpoint());
    }

    #[test]
    fn weak_ref_list_add_and_remove() {
        let locks = locks();
        locks.add_to_expected_on_weak_ref_access(locks.deoptimization_lock);
        // adding twice keeps one entry
        locks.add_to_expected_on_weak_ref_access(locks.deoptimization_lock);
        assert!(locks.is_expected_on_weak_ref_access(locks.deoptimization_lock));
        locks.remove_from_expected_on_weak_ref_access(locks.deoptimization_lock);
        assert!(!locks.is_expected_on_weak_ref_access(locks.deoptimization_lock));
        assert!(!locks.deoptimization_lock.base().should_respond_to_checkpoint());
    }

    #[test]
    fn waking_while_the_list_changes() {
        let locks = locks();
        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..1000 {
                    locks.add_to_expected_on_weak_ref_access(locks.cha_lock);
                    locks.remove_from_expected_on_weak_ref_access(locks.cha_lock);
                }
            });
            // wakes may come from a list the lock has already left
            for _ in 0..1000 {
                locks.wake_expected_for_checkpoint();
            }
        });
        assert!(!locks.is_expected_on_weak_ref_access(locks.cha_lock));
    }

    #[test]
    fn abort_is_safe_while_nobody_aborts() {
        locks();
        assert!(Locks::is_safe_to_call_abort_racy());
    }

    #[test]
    fn dump_lists_every_lock() {
        let locks = locks();
        let mut out = String::new();
        locks.dump(&mut out).unwrap();
        assert_eq!(out.lines().count(), CREATION_ORDER.len());
        assert!(out.contains("non-recursive thread list lock level=ThreadList"));
        assert!(out.contains("mutator lock level=Mutator owner=0"));
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            LockError::NotInitialized.to_string(),
            "the lock registry isn't initialized yet"
        );
    }
}
