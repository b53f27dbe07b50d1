//! Futex-style wait/wake on shared 32-bit cells.
//!
//! Provides `wait` and `wake` operations using a global hash table of wait
//! queues keyed by cell address. The host process has no scheduler of its
//! own to block tasks in, so waiters park on a `Condvar`; the table entry
//! is dropped once the last waiter leaves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use hashbrown::HashMap;

/// One wait queue per cell address.
struct WaitQueue {
    /// Bumped on every wake so parked threads can tell a wake from a
    /// spurious `Condvar` return.
    epoch: Mutex<u64>,
    cond: Condvar,
}

/// Global wait-queue table.
///
/// Maps cell addresses to queues of parked threads, with a waiter count so
/// empty entries can be removed eagerly.
static QUEUES: spin::Mutex<Option<HashMap<usize, (Arc<WaitQueue>, usize)>>> =
    spin::Mutex::new(None);

fn with_queues<F, R>(f: F) -> R
where
    F: FnOnce(&mut HashMap<usize, (Arc<WaitQueue>, usize)>) -> R,
{
    let mut guard = QUEUES.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    f(guard.as_mut().unwrap())
}

fn enter(addr: usize) -> Arc<WaitQueue> {
    with_queues(|table| {
        let entry = table.entry(addr).or_insert_with(|| {
            (
                Arc::new(WaitQueue {
                    epoch: Mutex::new(0),
                    cond: Condvar::new(),
                }),
                0,
            )
        });
        entry.1 += 1;
        entry.0.clone()
    })
}

fn leave(addr: usize) {
    with_queues(|table| {
        if let Some(entry) = table.get_mut(&addr) {
            entry.1 -= 1;
            if entry.1 == 0 {
                table.remove(&addr);
            }
        }
    });
}

/// Block the calling thread while `*cell == expected`.
///
/// Returns immediately if the cell already differs. A return does not
/// guarantee the value changed; callers loop, exactly as with a native
/// futex.
pub fn wait(cell: &AtomicU32, expected: u32) {
    wait_inner(cell, expected, None);
}

/// [`wait`] with an upper bound. Returns `false` on timeout.
pub fn wait_timeout(cell: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    wait_inner(cell, expected, Some(timeout))
}

fn wait_inner(cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let addr = cell.as_ptr() as usize;
    let queue = enter(addr);

    let mut epoch = queue.epoch.lock().unwrap();
    // Check under the queue lock so a concurrent wake cannot slip between
    // the load and the park.
    if cell.load(Ordering::SeqCst) != expected {
        drop(epoch);
        leave(addr);
        return true;
    }

    let entry_epoch = *epoch;
    let mut woken = true;
    while cell.load(Ordering::SeqCst) == expected && *epoch == entry_epoch {
        match timeout {
            None => {
                epoch = queue.cond.wait(epoch).unwrap();
            }
            Some(limit) => {
                let (guard, result) = queue.cond.wait_timeout(epoch, limit).unwrap();
                epoch = guard;
                if result.timed_out() {
                    woken = cell.load(Ordering::SeqCst) != expected || *epoch != entry_epoch;
                    break;
                }
            }
        }
    }

    drop(epoch);
    leave(addr);
    woken
}

/// Wake up to `count` threads parked on `cell`. Returns the number of
/// threads that could have been woken (bounded by the current waiter
/// count).
pub fn wake(cell: &AtomicU32, count: u32) -> u32 {
    let addr = cell.as_ptr() as usize;
    let (queue, waiters) = match with_queues(|table| {
        table.get(&addr).map(|(q, n)| (q.clone(), *n))
    }) {
        Some(found) => found,
        None => return 0,
    };

    let woken = (waiters as u32).min(count);
    let mut epoch = queue.epoch.lock().unwrap();
    *epoch += 1;
    drop(epoch);

    if woken >= waiters as u32 {
        queue.cond.notify_all();
    } else {
        for _ in 0..woken {
            queue.cond.notify_one();
        }
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let cell = AtomicU32::new(5);
        // expected != current: must not block
        wait(&cell, 4);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let cell = AtomicU32::new(0);
        let woken = wait_timeout(&cell, 0, Duration::from_millis(20));
        assert!(!woken);
    }

    #[test]
    fn test_wake_without_waiters() {
        let cell = AtomicU32::new(0);
        assert_eq!(wake(&cell, 1), 0);
    }

    #[test]
    fn test_wake_unblocks_waiter() {
        let cell = AtomicU32::new(0);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                while cell.load(Ordering::SeqCst) == 0 {
                    wait(&cell, 0);
                }
            });
            // Give the waiter a moment to park, then flip and wake.
            std::thread::sleep(Duration::from_millis(10));
            cell.store(1, Ordering::SeqCst);
            wake(&cell, 1);
            waiter.join().unwrap();
        });
    }
}
