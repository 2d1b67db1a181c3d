//! Process-shared synchronization primitives over futex words.
//!
//! Every primitive here is a single `AtomicU32` that lives inside the mapped
//! control block, so the zero-initialized segment produced by `create_shm`
//! is already in the valid "unlocked / generation 0" state. The futex calls
//! deliberately do NOT pass `FUTEX_PRIVATE_FLAG`: the words sit in a
//! `MAP_SHARED` mapping and must wake waiters in other processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Outcome of a single futex-style wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken up, or the word no longer held the expected value.
    Woken,
    /// The timeout expired first.
    TimedOut,
    /// The underlying primitive failed.
    Failed,
}

/// Current monotonic time in nanoseconds.
pub fn mono_time_ns() -> u64 {
    use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * NSEC_PER_SEC + (ts.tv_nsec as u64)
    }
}

/// Sleep until `word != expected`, a wakeup arrives, or `timeout` expires.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    use std::ptr;

    let ts;
    let ts_ptr = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(t.subsec_nanos() as i32),
            };
            &ts as *const libc::timespec
        }
        None => ptr::null(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match unsafe { *libc::__errno_location() } {
        libc::ETIMEDOUT => WaitOutcome::TimedOut,
        // EAGAIN: the word already changed; EINTR: signal — both mean the
        // caller should re-check its predicate
        libc::EAGAIN | libc::EINTR => WaitOutcome::Woken,
        _ => WaitOutcome::Failed,
    }
}

/// Polling fallback for platforms without futex.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        if word.load(Ordering::Acquire) != expected {
            return WaitOutcome::Woken;
        }
        if let Some(d) = deadline {
            if std::time::Instant::now() >= d {
                return WaitOutcome::TimedOut;
            }
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Wake every waiter blocked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            libc::c_int::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_word: &AtomicU32) {
    // Pollers notice the store on their next tick
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Inter-process mutex: one futex word in shared memory.
///
/// Zero means unlocked, so a freshly zeroed segment needs no construction
/// step. There is no owner tracking; `lock`/`unlock` may legitimately be
/// paired across separate calls (the write-borrow protocol relies on this).
#[repr(transparent)]
pub struct ShmMutex {
    state: AtomicU32,
}

impl ShmMutex {
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        loop {
            // Mark contended so the unlocker knows to wake us
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            futex_wait(&self.state, CONTENDED, None);
        }
    }

    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake_all(&self.state);
        }
    }

    /// Scoped lock: unlocks when the guard drops.
    pub fn guard(&self) -> ShmMutexGuard<'_> {
        self.lock();
        ShmMutexGuard { mutex: self }
    }
}

pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Inter-process condition variable: a generation counter on a futex word.
///
/// Waiters snapshot the generation, re-check their predicate, then sleep
/// until the generation moves past the snapshot. Unlike a POSIX condvar no
/// mutex is required around the wait; the predicate re-check after every
/// wake is what makes it race- and spurious-wake-safe.
#[repr(transparent)]
pub struct ShmCondvar {
    seq: AtomicU32,
}

impl ShmCondvar {
    pub fn snapshot(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Block until a broadcast arrives after `snapshot` was taken, or the
    /// timeout expires. Callers must re-check their predicate on `Woken`.
    pub fn wait(&self, snapshot: u32, timeout: Duration) -> WaitOutcome {
        futex_wait(&self.seq, snapshot, Some(timeout))
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_mono_time_ns_monotonic() {
        let t1 = mono_time_ns();
        let t2 = mono_time_ns();
        assert!(t1 > 0);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_mutex_excludes() {
        let mutex = ShmMutex {
            state: AtomicU32::new(0),
        };
        let counter = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _g = mutex.guard();
                        // Non-atomic read-modify-write under the lock: torn
                        // interleavings would lose increments
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn test_mutex_try_lock() {
        let mutex = ShmMutex {
            state: AtomicU32::new(0),
        };
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn test_condvar_timeout() {
        let cond = ShmCondvar {
            seq: AtomicU32::new(0),
        };
        let snap = cond.snapshot();
        let start = std::time::Instant::now();
        let outcome = cond.wait(snap, Duration::from_millis(50));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_condvar_broadcast_wakes() {
        let cond = ShmCondvar {
            seq: AtomicU32::new(0),
        };

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let snap = cond.snapshot();
                cond.wait(snap, Duration::from_secs(5))
            });

            std::thread::sleep(Duration::from_millis(20));
            cond.broadcast();

            assert_eq!(waiter.join().unwrap(), WaitOutcome::Woken);
        });
    }

    #[test]
    fn test_condvar_stale_snapshot_returns_immediately() {
        let cond = ShmCondvar {
            seq: AtomicU32::new(0),
        };
        let snap = cond.snapshot();
        cond.broadcast();

        // The generation already moved, so the wait must not block
        let start = std::time::Instant::now();
        let outcome = cond.wait(snap, Duration::from_secs(5));
        assert_eq!(outcome, WaitOutcome::Woken);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
