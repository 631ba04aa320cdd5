use std::env::args;
use std::str::FromStr;
use std::string::ToString;
use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering::SeqCst},
    Arc,
};
use std::thread::{scope, sleep};
use std::time::Duration;

use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};

use runtime_locks::{
    dump_all, CheckpointSlot, Locks, LockThread, MutexLock, ReaderMutexLock, ScopedRunnable, ThreadContext, WriterMutexLock,
};

fn main() -> Result<(), String> {
    env_logger::init();
    args()
        .nth(1)
        .ok_or(format!(
            "no scenario supplied, use one of {}",
            Scenario::iter()
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Scenario::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|scenario| {
            let locks = Locks::init().map_err(|e| e.to_string())?;
            match scenario {
                Scenario::Contention => contention(locks),
                Scenario::Condvar => condvar(locks),
                Scenario::Rwlock => rwlock(locks)?,
                Scenario::Checkpoint => checkpoint(locks),
                Scenario::Dump => dump(locks)?,
            }
            print!("{}", dump_all());
            Ok(())
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Scenario {
    Contention,
    Condvar,
    Rwlock,
    Checkpoint,
    Dump,
}

/// a few threads fighting over one mutex
fn contention(locks: &'static Locks) {
    let counter = AtomicU64::new(0);
    scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let thread = LockThread::attach();
                for _ in 0..10_000 {
                    let _mu = MutexLock::new(&thread, locks.intern_table_lock);
                    counter.fetch_add(1, SeqCst);
                }
            });
        }
    });
    println!("counted to {}", counter.load(SeqCst));
}

/// workers leave the thread list one by one, the main thread waits for the last one
fn condvar(locks: &'static Locks) {
    let live = AtomicI32::new(4);
    scope(|s| {
        for _ in 0..live.load(SeqCst) {
            s.spawn(|| {
                let thread = LockThread::attach();
                sleep(Duration::from_millis(10));
                let _mu = MutexLock::new(&thread, locks.thread_list_lock);
                live.fetch_sub(1, SeqCst);
                locks.thread_exit_cond.broadcast(&thread);
            });
        }
        let thread = LockThread::attach();
        let _mu = MutexLock::new(&thread, locks.thread_list_lock);
        while live.load(SeqCst) != 0 {
            locks.thread_exit_cond.wait(&thread);
        }
    });
    println!("every worker left");
}

/// runnable readers and writers on the heap bitmap, a suspender stopping them all now and then
fn rwlock(locks: &'static Locks) -> Result<(), String> {
    let key = locks.take_mutator_key().map_err(|e| e.to_string())?;
    let marked = AtomicU64::new(0);
    scope(|s| {
        for i in 0..6 {
            let key = &key;
            let marked = &marked;
            s.spawn(move || {
                let thread = LockThread::attach();
                for _ in 0..1_000 {
                    let _runnable = ScopedRunnable::new(key, &thread, locks.mutator_lock);
                    if i % 3 == 0 {
                        let _wmu = WriterMutexLock::new(&thread, locks.heap_bitmap_lock);
                        marked.fetch_add(1, SeqCst);
                    } else {
                        let _rmu = ReaderMutexLock::new(&thread, locks.heap_bitmap_lock);
                        marked.load(SeqCst);
                    }
                }
            });
        }
        let suspender = LockThread::attach();
        for _ in 0..10 {
            locks.mutator_lock.exclusive_lock(&key, &suspender);
            sleep(Duration::from_millis(1));
            locks.mutator_lock.exclusive_unlock(&key, &suspender);
        }
    });
    println!("marked {} times", marked.load(SeqCst));
    Ok(())
}

/// a thread blocked on the dex lock still answers an empty checkpoint
fn checkpoint(locks: &'static Locks) {
    let held = AtomicBool::new(false);
    let release = AtomicBool::new(false);
    let holder_slot = Arc::new(CheckpointSlot::new());
    let blocked_slot = Arc::new(CheckpointSlot::new());
    scope(|s| {
        s.spawn(|| {
            let thread = LockThread::attach_with_checkpoint(Arc::clone(&holder_slot));
            let _wmu = WriterMutexLock::new(&thread, locks.dex_lock);
            held.store(true, SeqCst);
            // runnable, not blocked: polls for checkpoints on its own
            while !release.load(SeqCst) {
                holder_slot.run_if_pending(&thread);
                sleep(Duration::from_millis(1));
            }
        });
        while !held.load(SeqCst) {
            std::thread::yield_now();
        }
        s.spawn(|| {
            let thread = LockThread::attach_with_checkpoint(Arc::clone(&blocked_slot));
            let _rmu = ReaderMutexLock::new(&thread, locks.dex_lock);
        });
        sleep(Duration::from_millis(20));

        let requester = LockThread::attach();
        let count = locks.run_empty_checkpoint(&requester, &[Arc::clone(&holder_slot), Arc::clone(&blocked_slot)]);
        println!("{count} threads passed the empty checkpoint requested by tid {}", requester.tid());
        release.store(true, SeqCst);
    });
}

fn dump(locks: &'static Locks) -> Result<(), String> {
    let mut out = String::new();
    locks.dump(&mut out).map_err(|e| e.to_string())?;
    print!("{out}");
    Ok(())
}
