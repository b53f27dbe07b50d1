//! Mutual exclusion and one-shot signalling on shared 32-bit cells.
//!
//! The cell protocol is shared with every other thread attached to the
//! region, so only the cell value carries state; hold counts for
//! re-entrancy live in the handle, outside shared memory.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::MemoryError;
use crate::futex;
use crate::region::MemoryRange;

/// Lock cell value when the lock is free.
const LOCK_FREE: u32 = 1;

/// Signal cell value once resolved.
const SIGNAL_RESOLVED: u32 = 1;

/// A re-entrant lock over a shared 32-bit cell.
///
/// Cell values: 1 = free, 0 = held. `acquire` decrements 1 → 0; waiters
/// sleep on the cell. A `Lock` handle belongs to one thread (it is not
/// `Sync`); separate handles over the same cell coordinate through the
/// shared region.
pub struct Lock {
    cell: MemoryRange,
    depth: Cell<u32>,
}

impl Lock {
    /// Create a handle over an existing lock cell. The range must cover a
    /// 4-aligned u32.
    pub fn new(cell: MemoryRange) -> Result<Lock, MemoryError> {
        cell.atomic_u32(0)?;
        Ok(Lock {
            cell,
            depth: Cell::new(0),
        })
    }

    /// Create a handle and initialise the cell to the free state. Call
    /// once, from the thread that allocated the record.
    pub fn initialize(cell: MemoryRange) -> Result<Lock, MemoryError> {
        let lock = Lock::new(cell)?;
        lock.cell.atomic_u32(0)?.store(LOCK_FREE, Ordering::Release);
        Ok(lock)
    }

    /// Acquire the lock, blocking while another holder has it. Nested
    /// acquisition from the same handle is permitted.
    pub fn acquire(&self) {
        if self.depth.get() > 0 {
            self.depth.set(self.depth.get() + 1);
            return;
        }
        let cell = self.cell.atomic_u32(0).expect("validated at construction");
        loop {
            let value = cell.load(Ordering::Acquire);
            if value > 0 {
                if cell
                    .compare_exchange(value, value - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            futex::wait(cell, value);
        }
        self.depth.set(1);
    }

    /// Release the lock. Must pair with a preceding `acquire` on this
    /// handle.
    pub fn release(&self) {
        debug_assert!(self.depth.get() > 0, "release without acquire");
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            let cell = self.cell.atomic_u32(0).expect("validated at construction");
            cell.fetch_add(1, Ordering::Release);
            futex::wake(cell, 1);
        }
    }

    /// Run `f` with the lock held.
    pub fn run_locked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.acquire();
        let result = f();
        self.release();
        result
    }
}

impl core::fmt::Debug for Lock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lock").field("depth", &self.depth.get()).finish()
    }
}

/// A one-shot event on a shared 32-bit cell.
///
/// Cell values: 0 = pending, 1 = resolved. Monotonic: once resolved the
/// cell never returns to pending.
pub struct Signal {
    cell: MemoryRange,
}

impl Signal {
    /// Create a handle over an existing signal cell.
    pub fn new(cell: MemoryRange) -> Result<Signal, MemoryError> {
        cell.atomic_u32(0)?;
        Ok(Signal { cell })
    }

    /// Create a handle and initialise the cell to pending.
    pub fn initialize(cell: MemoryRange) -> Result<Signal, MemoryError> {
        let signal = Signal::new(cell)?;
        signal.cell.atomic_u32(0)?.store(0, Ordering::Release);
        Ok(signal)
    }

    /// Block until the signal resolves.
    pub fn wait(&self) {
        let cell = self.cell.atomic_u32(0).expect("validated at construction");
        while cell.load(Ordering::Acquire) != SIGNAL_RESOLVED {
            futex::wait(cell, 0);
        }
    }

    /// [`Signal::wait`] with an upper bound. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let cell = self.cell.atomic_u32(0).expect("validated at construction");
        let deadline = std::time::Instant::now() + timeout;
        while cell.load(Ordering::Acquire) != SIGNAL_RESOLVED {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            futex::wait_timeout(cell, 0, deadline - now);
        }
        true
    }

    /// Whether the signal has resolved.
    pub fn is_resolved(&self) -> bool {
        let cell = self.cell.atomic_u32(0).expect("validated at construction");
        cell.load(Ordering::Acquire) == SIGNAL_RESOLVED
    }

    /// Resolve the signal and wake up to `count` waiters.
    pub fn resolve(&self, count: u32) {
        let cell = self.cell.atomic_u32(0).expect("validated at construction");
        cell.store(SIGNAL_RESOLVED, Ordering::Release);
        futex::wake(cell, count);
    }

    /// Resolve the signal and wake every waiter.
    pub fn resolve_all(&self) {
        self.resolve(u32::MAX);
    }
}

impl core::fmt::Debug for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signal")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MemoryRegion;

    #[test]
    fn test_lock_acquire_release() {
        let region = MemoryRegion::new(4096).unwrap();
        let cell = region.alloc(4, 4).unwrap();
        let lock = Lock::initialize(cell.sub_range(0, 4).unwrap()).unwrap();
        lock.acquire();
        lock.release();
        region.free(cell).unwrap();
    }

    #[test]
    fn test_lock_reentrant() {
        let region = MemoryRegion::new(4096).unwrap();
        let cell = region.alloc(4, 4).unwrap();
        let lock = Lock::initialize(cell.sub_range(0, 4).unwrap()).unwrap();
        lock.run_locked(|| {
            lock.run_locked(|| {
                assert_eq!(cell.read_u32(0).unwrap(), 0);
            });
            // Still held after the inner release.
            assert_eq!(cell.read_u32(0).unwrap(), 0);
        });
        assert_eq!(cell.read_u32(0).unwrap(), 1);
        region.free(cell).unwrap();
    }

    #[test]
    fn test_signal_monotonic() {
        let region = MemoryRegion::new(4096).unwrap();
        let cell = region.alloc(4, 4).unwrap();
        let signal = Signal::initialize(cell.sub_range(0, 4).unwrap()).unwrap();
        assert!(!signal.is_resolved());
        signal.resolve(1);
        assert!(signal.is_resolved());
        // wait after resolution returns immediately
        signal.wait();
        assert!(signal.is_resolved());
        region.free(cell).unwrap();
    }

    #[test]
    fn test_signal_wait_timeout() {
        let region = MemoryRegion::new(4096).unwrap();
        let cell = region.alloc(4, 4).unwrap();
        let signal = Signal::initialize(cell.sub_range(0, 4).unwrap()).unwrap();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        signal.resolve_all();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        region.free(cell).unwrap();
    }
}
