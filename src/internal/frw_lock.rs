//! A very simple and cheap spinning RwLock. This is the pause lock: every running transaction holds
//! the read side, and stopping the world (a major collection, or installing preexisting objects)
//! takes the write side.
//!
//! Writers are preferred. Once a writer has set the write bit, new readers back off until the
//! writer is done, while the writer waits for the existing readers to reach a safe point.

use crossbeam_utils::Backoff;
use lock_api::{GuardNoSend, RawRwLock};
use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering::*},
};

const WRITE_BIT: usize = 1 << (mem::size_of::<usize>() * 8 - 1);
const READ_MASK: usize = !WRITE_BIT;

#[inline]
const fn write_locked(val: usize) -> bool {
    val & WRITE_BIT != 0
}

#[inline]
const fn shared_locked(val: usize) -> bool {
    val & READ_MASK != 0
}

#[derive(Debug)]
pub struct FrwLock {
    read_count: AtomicUsize,
}

pub type PauseLock = lock_api::RwLock<FrwLock, ()>;
pub type PauseGuard<'a> = lock_api::RwLockReadGuard<'a, FrwLock, ()>;
pub type PauseWriteGuard<'a> = lock_api::RwLockWriteGuard<'a, FrwLock, ()>;

unsafe impl RawRwLock for FrwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: FrwLock = FrwLock {
        read_count: AtomicUsize::new(0),
    };
    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock_shared(&self) {
        if unlikely!(write_locked(self.read_count.fetch_add(1, Acquire))) {
            self.lock_shared_slow();
        }
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        let read_state = self.read_count.load(Relaxed);
        !write_locked(read_state)
            && self
                .read_count
                .compare_exchange(read_state, read_state + 1, Acquire, Relaxed)
                .is_ok()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        let _prev = self.read_count.fetch_sub(1, Release);
        debug_assert!(
            shared_locked(_prev),
            "attempt to unlock an unlocked `FrwLock`"
        );
    }

    #[inline]
    fn lock_exclusive(&self) {
        let test = self
            .read_count
            .compare_exchange_weak(0, WRITE_BIT, Acquire, Relaxed);
        if unlikely!(test.is_err()) {
            self.lock_exclusive_slow()
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.read_count
            .compare_exchange(0, WRITE_BIT, Acquire, Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let _prev = self.read_count.fetch_and(READ_MASK, Release);
        debug_assert!(
            write_locked(_prev),
            "attempt to unlock an unlocked `FrwLock`"
        );
    }
}

impl FrwLock {
    #[cold]
    #[inline(never)]
    fn lock_shared_slow(&self) {
        let _ = self.read_count.fetch_sub(1, Relaxed);

        // a major collection can hold the write side for a while, so fall back to yielding
        let backoff = Backoff::new();
        loop {
            backoff.snooze();
            let read_state = self.read_count.load(Relaxed);
            if !write_locked(read_state)
                && self
                    .read_count
                    .compare_exchange_weak(read_state, read_state + 1, Acquire, Relaxed)
                    .is_ok()
            {
                break;
            }
        }

        debug_assert!(shared_locked(self.read_count.load(Relaxed)));
    }

    #[inline]
    fn request_exclusive_lock(&self) -> usize {
        let backoff = Backoff::new();
        let mut prev_read_count = self.read_count.load(Relaxed);
        // first come first serve
        while write_locked(prev_read_count)
            || self
                .read_count
                .compare_exchange_weak(
                    prev_read_count,
                    prev_read_count | WRITE_BIT,
                    Acquire,
                    Relaxed,
                )
                .is_err()
        {
            backoff.snooze();
            prev_read_count = self.read_count.load(Relaxed);
        }

        prev_read_count
    }

    #[inline]
    fn wait_for_readers(&self, mut prev_read_count: usize) {
        let backoff = Backoff::new();
        while shared_locked(prev_read_count) {
            backoff.snooze();
            prev_read_count = self.read_count.load(Acquire);
        }
    }

    #[inline(never)]
    #[cold]
    fn lock_exclusive_slow(&self) {
        let prev_read_count = self.request_exclusive_lock();
        self.wait_for_readers(prev_read_count);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_utils::thread;
    use std::sync::atomic::AtomicBool;

    fn send_sync<T: Send + Sync>() {}

    #[test]
    fn is_send_sync() {
        send_sync::<FrwLock>()
    }

    #[test]
    fn try_lock() {
        let lock = PauseLock::new(());
        let read = lock.try_read();
        assert!(read.is_some());
        assert!(lock.try_write().is_none());
        drop(read);
        let write = lock.try_write();
        assert!(write.is_some());
        assert!(lock.try_read().is_none());
    }

    #[test]
    fn writer_waits_for_unlocked_reader() {
        let lock = PauseLock::new(());
        let wrote = AtomicBool::new(false);
        thread::scope(|s| {
            let mut guard = lock.read();
            s.spawn(|_| {
                let _write = lock.write();
                wrote.store(true, SeqCst);
            });
            while !wrote.load(SeqCst) {
                // a safe point: the reader steps aside until the writer is done
                PauseGuard::unlocked(&mut guard, || {});
            }
            drop(guard);
        })
        .unwrap();
        assert!(wrote.load(SeqCst));
    }
}
