/*
 * A CAS-on-a-bit spin lock.
 *
 * It guards the bookkeeping the locks themselves need (the list of every lock for dumping,
 * the list of locks expected during weak reference access, checkpoint requests).
 * Using a real Mutex there would make the mutex subsystem depend on itself.
 * Critical sections are a handful of instructions, so spinning is cheaper than parking anyway.
 */

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
};

pub struct SpinLock<Y> {
    locked: AtomicBool,
    value: UnsafeCell<Y>,
}
// UnsafeCell makes the above definition !Sync => we promise it's fine as long as Y can be sent
unsafe impl<Y> Sync for SpinLock<Y> where Y: Send {}

impl<Y> SpinLock<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, Y> {
        // weak CAS is enough, we retry anyway; Acquire pairs with the Release in the guard's drop
        while self
            .locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            // spin on a plain load to keep the cache line shared
            while self.locked.load(Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

// a guard to Deref like &mut and Drop like unlock
pub struct SpinGuard<'a, Y> {
    lock: &'a SpinLock<Y>,
}

impl<Y> Deref for SpinGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<Y> DerefMut for SpinGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<Y> Drop for SpinGuard<'_, Y> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}
