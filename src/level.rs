//! # Lock levels
//!
//! Every lock is tagged with a level. A thread may only acquire a lock whose level is strictly below the
//! level of everything it already holds, so the "may be acquired while holding" graph can't have cycles.
//!
//! Levels are listed bottom-up: [LockLevel::Logging] is the innermost lock, [LockLevel::TopLockLevel]
//! may only be taken while holding nothing else.

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumCount, EnumIter, IntoStaticStr};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount, Display, IntoStaticStr,
)]
#[repr(u8)]
pub enum LockLevel {
    Logging,
    UnexpectedSignal,
    ThreadSuspendCount,
    Abort,
    NativeDebugInterface,
    SignalHandling,
    JniFunctionTable,
    JniWeakGlobals,
    JniGlobals,
    ReferenceQueueSoftReferences,
    ReferenceQueuePhantomReferences,
    ReferenceQueueFinalizerReferences,
    ReferenceQueueWeakReferences,
    ReferenceQueueClearedReferences,
    ReferenceProcessor,
    JitDebugInterface,
    AllocSpace,
    ArenaPool,
    InternTable,
    OatFileSecondaryLookup,
    HostDlOpenHandles,
    VerifierDeps,
    OatFileManager,
    TracingUniqueMethods,
    TracingStreaming,
    DeoptimizedMethods,
    ClassLoaderClasses,
    DefaultMutexLevel,
    Dex,
    MarkSweepLargeObject,
    AllocatedThreadIds,
    MonitorPool,
    ClassLinkerClasses,
    JitCodeCache,
    Cha,
    SubtypeCheck,
    Breakpoint,
    Monitor,
    MonitorList,
    JniLoadLibrary,
    ThreadList,
    AllocTracker,
    Deoptimization,
    Profiler,
    RuntimeShutdown,
    Trace,
    HeapBitmap,
    Mutator,
    UserCodeSuspension,
    InstrumentEntrypoints,
    ZygoteCreation,
    TopLockLevel,
}

impl LockLevel {
    /// slot of the level within a per-thread held lock table
    pub const fn index(self) -> usize {
        self as usize
    }

    /// This level and every level below it, from this one down to [LockLevel::Logging].
    /// These are the levels a thread must not hold anything at when acquiring a lock of this level.
    pub fn this_and_below(self) -> impl Iterator<Item = LockLevel> {
        LockLevel::iter().take(self.index() + 1).rev()
    }
}

/// `true` if the levels go strictly downwards. Used at compile time to check the registry's creation order.
pub const fn is_strictly_descending(levels: &[LockLevel]) -> bool {
    let mut i = 1;
    while i < levels.len() {
        if levels[i] as u8 >= levels[i - 1] as u8 {
            return false;
        }
        i += 1;
    }
    true
}

#[cfg(test)]
mod test {
    use strum::EnumCount;

    use super::*;

    #[test]
    fn levels_are_ordered_by_declaration() {
        assert!(LockLevel::Logging < LockLevel::ThreadSuspendCount);
        assert!(LockLevel::Mutator < LockLevel::TopLockLevel);
        assert_eq!(LockLevel::TopLockLevel.index(), LockLevel::COUNT - 1);
    }

    #[test]
    fn this_and_below_walks_down() {
        let levels: Vec<_> = LockLevel::ThreadSuspendCount.this_and_below().collect();
        assert_eq!(
            levels,
            [LockLevel::ThreadSuspendCount, LockLevel::UnexpectedSignal, LockLevel::Logging]
        );
    }

    #[test]
    fn descending_check() {
        assert!(is_strictly_descending(&[LockLevel::Trace, LockLevel::Abort, LockLevel::Logging]));
        assert!(!is_strictly_descending(&[LockLevel::Abort, LockLevel::Abort]));
        assert!(!is_strictly_descending(&[LockLevel::Logging, LockLevel::Abort]));
        assert!(is_strictly_descending(&[]));
    }
}
