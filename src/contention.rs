//! # Contention ledger
//!
//! Every lock can keep a tiny diagnostic record of its contention:
//! - how many times a thread had to block on it and how long it waited in total
//! - a ring of the last few `(blocked tid, owner tid)` pairs with a repeat count
//!
//! ## Racy on purpose
//!
//! The ledger is updated with relaxed atomics and no lock at all. Concurrent contenders may overwrite
//! each other's samples or bump the count of a slot that was just recycled.
//! The numbers are "monotone-ish", never authoritative, and nothing in the locks depends on them.
//!
//! The ledger only exists with the `contention-log` feature. Without it [ContentionLog] is zero-sized and
//! every call compiles to nothing.
//!
//! Every ledger created while the feature is on is remembered (weakly) so [dump_all] can print them.

pub use imp::{dump_all, ContentionLog, ContentionRecorder};

/// number of `(blocked, owner)` samples kept per lock
pub const CONTENTION_LOG_SIZE: usize = 4;

#[cfg(feature = "contention-log")]
mod imp {
    use std::{
        collections::BTreeMap,
        fmt::{self, Write},
        sync::{
            atomic::{
                AtomicU32, AtomicU64, AtomicUsize,
                Ordering::Relaxed,
            },
            Arc, Weak,
        },
        time::{Duration, Instant},
    };

    use super::CONTENTION_LOG_SIZE;
    use crate::{level::LockLevel, spin::SpinLock, thread::Tid};

    #[derive(Default)]
    struct Entry {
        blocked_tid: AtomicU32,
        owner_tid: AtomicU32,
        count: AtomicU32,
    }

    struct LogData {
        name: &'static str,
        level: LockLevel,
        entries: [Entry; CONTENTION_LOG_SIZE],
        cur_entry: AtomicUsize,
        contention_count: AtomicU32,
        wait_time_ns: AtomicU64,
    }

    /// every ledger ever created, dead ones get pruned lazily
    static ALL_LOGS: SpinLock<Vec<Weak<LogData>>> = SpinLock::new(Vec::new());

    pub struct ContentionLog {
        data: Arc<LogData>,
    }

    impl ContentionLog {
        pub(crate) fn new(name: &'static str, level: LockLevel) -> Self {
            let data = Arc::new(LogData {
                name,
                level,
                entries: Default::default(),
                cur_entry: AtomicUsize::new(0),
                contention_count: AtomicU32::new(0),
                wait_time_ns: AtomicU64::new(0),
            });
            let mut all = ALL_LOGS.lock();
            all.retain(|log| log.strong_count() > 0);
            all.push(Arc::downgrade(&data));
            Self { data }
        }

        /// Starts timing a contended acquisition, the sample is recorded when the recorder is dropped
        pub(crate) fn start(&self, blocked: Tid, owner: Tid) -> ContentionRecorder<'_> {
            ContentionRecorder {
                log: self,
                blocked,
                owner,
                start: Instant::now(),
            }
        }

        pub(crate) fn record(&self, blocked: Tid, owner: Tid, waited: Duration) {
            let data = &*self.data;
            data.contention_count.fetch_add(1, Relaxed);
            data.wait_time_ns
                .fetch_add(waited.as_nanos().min(u64::MAX as u128) as u64, Relaxed);

            let mut slot = data.cur_entry.load(Relaxed);
            let entry = &data.entries[slot];
            if entry.blocked_tid.load(Relaxed) == blocked && entry.owner_tid.load(Relaxed) == owner {
                entry.count.fetch_add(1, Relaxed);
                return;
            }
            // claim the next slot, whoever wins the CAS writes it; the write itself isn't atomic as a whole
            let new_slot = loop {
                let next = (slot + 1) % CONTENTION_LOG_SIZE;
                match data
                    .cur_entry
                    .compare_exchange_weak(slot, next, Relaxed, Relaxed)
                {
                    Ok(_) => break next,
                    Err(actual) => slot = actual,
                }
            };
            let entry = &data.entries[new_slot];
            entry.blocked_tid.store(blocked, Relaxed);
            entry.owner_tid.store(owner, Relaxed);
            entry.count.store(1, Relaxed);
        }

        pub fn has_ever_contended(&self) -> bool {
            self.contention_count() > 0
        }

        pub fn contention_count(&self) -> u32 {
            self.data.contention_count.load(Relaxed)
        }

        pub fn total_wait(&self) -> Duration {
            Duration::from_nanos(self.data.wait_time_ns.load(Relaxed))
        }

        /// the human readable contention summary, part of every lock's dump
        pub fn dump(&self, out: &mut dyn Write) -> fmt::Result {
            self.data.dump(out)
        }
    }

    impl LogData {
        fn dump(&self, out: &mut dyn Write) -> fmt::Result {
            let count = self.contention_count.load(Relaxed);
            if count == 0 {
                return write!(out, "never contended");
            }
            let wait = Duration::from_nanos(self.wait_time_ns.load(Relaxed));
            write!(
                out,
                "contended {count} total wait of contender {wait:?} average {:?}",
                wait / count
            )?;

            let mut blocked = BTreeMap::new();
            let mut owners = BTreeMap::new();
            for entry in &self.entries {
                let n = entry.count.load(Relaxed);
                if n > 0 {
                    *blocked.entry(entry.blocked_tid.load(Relaxed)).or_insert(0) += n;
                    *owners.entry(entry.owner_tid.load(Relaxed)).or_insert(0) += n;
                }
            }
            if let Some(tid) = most_common(&blocked) {
                write!(out, " sample shows most blocked tid={tid}")?;
            }
            if let Some(tid) = most_common(&owners) {
                write!(out, " sample shows tid={tid} owning during this time")?;
            }
            Ok(())
        }
    }

    /// first tid with the highest count, 0 doesn't count as a tid
    fn most_common(counts: &BTreeMap<Tid, u32>) -> Option<Tid> {
        let mut best: Option<(Tid, u32)> = None;
        for (&tid, &n) in counts {
            if best.map_or(true, |(_, max)| n > max) {
                best = Some((tid, n));
            }
        }
        best.map(|(tid, _)| tid).filter(|&tid| tid != 0)
    }

    /// Records one contended acquisition on drop
    pub struct ContentionRecorder<'a> {
        log: &'a ContentionLog,
        blocked: Tid,
        owner: Tid,
        start: Instant,
    }

    impl Drop for ContentionRecorder<'_> {
        fn drop(&mut self) {
            self.log
                .record(self.blocked, self.owner, self.start.elapsed());
        }
    }

    /// Every ledger still alive, the contended ones first
    pub fn dump_all() -> String {
        let live: Vec<Arc<LogData>> = ALL_LOGS.lock().iter().filter_map(Weak::upgrade).collect();
        let mut out = String::new();
        // writing into a String can't fail
        let _ = write_all(&live, &mut out);
        out
    }

    fn write_all(live: &[Arc<LogData>], out: &mut String) -> fmt::Result {
        writeln!(out, "Mutex logging:")?;
        writeln!(out, "(Contended)")?;
        for data in live.iter().filter(|d| d.contention_count.load(Relaxed) > 0) {
            write_line(data, out)?;
        }
        writeln!(out, "(Never contended)")?;
        for data in live.iter().filter(|d| d.contention_count.load(Relaxed) == 0) {
            write_line(data, out)?;
        }
        Ok(())
    }

    fn write_line(data: &LogData, out: &mut String) -> fmt::Result {
        write!(out, "{} level={} ", data.name, data.level)?;
        data.dump(out)?;
        writeln!(out)
    }
}

#[cfg(not(feature = "contention-log"))]
mod imp {
    use std::{
        fmt::{self, Write},
        marker::PhantomData,
        time::Duration,
    };

    use crate::{level::LockLevel, thread::Tid};

    pub struct ContentionLog;

    impl ContentionLog {
        pub(crate) fn new(_name: &'static str, _level: LockLevel) -> Self {
            Self
        }

        pub(crate) fn start(&self, _blocked: Tid, _owner: Tid) -> ContentionRecorder<'_> {
            ContentionRecorder(PhantomData)
        }

        pub(crate) fn record(&self, _blocked: Tid, _owner: Tid, _waited: Duration) {}

        pub fn has_ever_contended(&self) -> bool {
            false
        }

        pub fn contention_count(&self) -> u32 {
            0
        }

        pub fn total_wait(&self) -> Duration {
            Duration::ZERO
        }

        pub fn dump(&self, _out: &mut dyn Write) -> fmt::Result {
            Ok(())
        }
    }

    pub struct ContentionRecorder<'a>(PhantomData<&'a ()>);

    pub fn dump_all() -> String {
        String::new()
    }
}
