//! Cross-thread behaviour of the shared-memory kit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use wasmbed_shm::{Lock, MemoryRegion, SharedArray, ShmError, Signal};

/// Tiny deterministic generator so each thread gets its own op sequence.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

#[test]
fn lock_mutual_exclusion() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let region = MemoryRegion::new(4096).unwrap();
    let cell = region.alloc(4, 4).unwrap();
    let lock_cell = cell.sub_range(0, 4).unwrap();
    Lock::initialize(lock_cell).unwrap();

    let in_critical = AtomicU32::new(0);
    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let handle =
                    Lock::new(region.pre_allocated(cell.ptr(), 4).unwrap()).unwrap();
                for _ in 0..ROUNDS {
                    handle.run_locked(|| {
                        let nested = in_critical.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(nested, 0, "two threads inside the critical section");
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }
    });
    region.free(cell).unwrap();
}

#[test]
fn signal_wakes_all_waiters() {
    const WAITERS: usize = 4;

    let region = MemoryRegion::new(4096).unwrap();
    let cell = region.alloc(4, 4).unwrap();
    Signal::initialize(cell.sub_range(0, 4).unwrap()).unwrap();

    std::thread::scope(|s| {
        for _ in 0..WAITERS {
            s.spawn(|| {
                let signal =
                    Signal::new(region.pre_allocated(cell.ptr(), 4).unwrap()).unwrap();
                signal.wait();
                assert!(signal.is_resolved());
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let signal = Signal::new(region.pre_allocated(cell.ptr(), 4).unwrap()).unwrap();
        signal.resolve_all();
    });
    region.free(cell).unwrap();
}

/// One logged operation against a shared array.
#[derive(Debug, Clone, Copy)]
enum Op {
    Push(u32),
    Pop(Option<u32>),
    Get(u32, u32),
}

/// Spec scenario: 16 threads hammer several arrays; replaying each array's
/// operation log against a plain `Vec` must reproduce the live contents.
#[test]
fn shared_array_log_replay() {
    const THREADS: u64 = 16;
    const ARRAYS: usize = 4;
    const OPS: usize = 120;

    let region = MemoryRegion::new(1 << 22).unwrap();
    let mut ptrs = Vec::new();
    let mut originals = Vec::new();
    for _ in 0..ARRAYS {
        let array: SharedArray<u32> = SharedArray::new(&region, 8).unwrap();
        ptrs.push(array.ptr());
        originals.push(array);
    }
    let logs: Vec<Mutex<Vec<Op>>> = (0..ARRAYS).map(|_| Mutex::new(Vec::new())).collect();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let ptrs = &ptrs;
            let logs = &logs;
            let region = &region;
            s.spawn(move || {
                let mut rng = Rng(0x9E3779B9 ^ t);
                let handles: Vec<SharedArray<u32>> = ptrs
                    .iter()
                    .map(|&p| SharedArray::attach(region, p).unwrap())
                    .collect();
                for _ in 0..OPS {
                    let a = (rng.next() as usize) % ARRAYS;
                    let handle = &handles[a];
                    let choice = rng.next() % 3;
                    let value = rng.next();
                    // Hold the array lock across op + log append so the log
                    // order matches the op order exactly.
                    handle.run_locked(|| {
                        let mut log = logs[a].lock().unwrap();
                        match choice {
                            0 | 1 => {
                                handle.push(&[value]).unwrap();
                                log.push(Op::Push(value));
                            }
                            _ => {
                                let popped = handle.pop().unwrap();
                                log.push(Op::Pop(popped));
                            }
                        }
                        drop(log);
                        let len = handle.len().unwrap();
                        if len > 0 {
                            let idx = rng.next() % len;
                            let got = handle.at(idx).unwrap();
                            logs[a].lock().unwrap().push(Op::Get(idx, got));
                        }
                    });
                }
            });
        }
    });

    for (a, array) in originals.into_iter().enumerate() {
        let mut replay: Vec<u32> = Vec::new();
        for op in logs[a].lock().unwrap().iter() {
            match *op {
                Op::Push(v) => replay.push(v),
                Op::Pop(expected) => assert_eq!(replay.pop(), expected),
                Op::Get(idx, expected) => assert_eq!(replay[idx as usize], expected),
            }
        }
        assert_eq!(array.to_vec().unwrap(), replay, "array {} diverged", a);
        array.dispose().unwrap();
    }
}

/// Spec scenario: an iterator yields items only while the state counter is
/// untouched; a concurrent push fails the next `next()`.
#[test]
fn shared_array_iteration_vs_push() {
    let region = MemoryRegion::new(1 << 18).unwrap();
    let array: SharedArray<u32> = SharedArray::new(&region, 8).unwrap();
    array.push(&[1, 2, 3, 4, 5]).unwrap();
    let ptr = array.ptr();

    let mut iter = array.values().unwrap();
    assert_eq!(iter.next().unwrap().unwrap(), 1);
    assert_eq!(iter.next().unwrap().unwrap(), 2);

    std::thread::scope(|s| {
        s.spawn(|| {
            let other: SharedArray<u32> = SharedArray::attach(&region, ptr).unwrap();
            other.push(&[6]).unwrap();
        });
    });

    assert_eq!(iter.next().unwrap(), Err(ShmError::ConcurrentModification));
    drop(iter);
    array.dispose().unwrap();
}
