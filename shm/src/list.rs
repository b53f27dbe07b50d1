//! Shared doubly-linked list.
//!
//! Nodes are individually allocated in the region; the list record keeps
//! `first`/`last` pointers. Pointer value 0 is never a valid allocation
//! (the region header occupies it), so 0 marks the empty ends. The same
//! `state` snapshot rule as [`crate::array::SharedArray`] applies to
//! iteration.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::array::ShmElement;
use crate::error::ShmError;
use crate::record::{PropertyType, Record, RecordDescriptor};
use crate::region::{MemoryRange, MemoryRegion};

fn descriptor() -> Arc<RecordDescriptor> {
    RecordDescriptor::shared(&[
        ("state", PropertyType::U32),
        ("first", PropertyType::U32),
        ("last", PropertyType::U32),
        ("size", PropertyType::U32),
    ])
}

/// Node header: next (4B) + prev (4B), value follows at its alignment.
const NODE_NEXT: u32 = 0;
const NODE_PREV: u32 = 4;

fn node_value_offset<T: ShmElement>() -> u32 {
    let align = T::ALIGN.max(1);
    (8 + align - 1) & !(align - 1)
}

fn node_size<T: ShmElement>() -> u32 {
    node_value_offset::<T>() + T::SIZE
}

fn node_align<T: ShmElement>() -> u32 {
    T::ALIGN.max(4)
}

/// A doubly-linked list in shared memory.
pub struct SharedLinkedList<T: ShmElement> {
    region: Arc<MemoryRegion>,
    record: Record,
    lock: crate::lock::Lock,
    _element: PhantomData<T>,
}

impl<T: ShmElement> SharedLinkedList<T> {
    /// Allocate a fresh, empty list.
    pub fn new(region: &Arc<MemoryRegion>) -> Result<SharedLinkedList<T>, ShmError> {
        let record = descriptor().alloc(region)?;
        let lock = record.lock()?;
        Ok(SharedLinkedList {
            region: region.clone(),
            record,
            lock,
            _element: PhantomData,
        })
    }

    /// Attach to an existing list image at `ptr`.
    pub fn attach(
        region: &Arc<MemoryRegion>,
        ptr: u32,
    ) -> Result<SharedLinkedList<T>, ShmError> {
        let desc = descriptor();
        let range = region.pre_allocated(ptr, desc.size())?;
        let record = desc.load(&range, 0)?;
        let lock = record.lock()?;
        Ok(SharedLinkedList {
            region: region.clone(),
            record,
            lock,
            _element: PhantomData,
        })
    }

    /// Pointer of the list image, for sharing with other threads.
    pub fn ptr(&self) -> u32 {
        self.record.ptr()
    }

    /// Number of elements currently stored.
    pub fn len(&self) -> Result<u32, ShmError> {
        Ok(self.record.get_u32("size")?)
    }

    /// Check whether the list is empty.
    pub fn is_empty(&self) -> Result<bool, ShmError> {
        Ok(self.len()? == 0)
    }

    /// Mutation counter; changes on every structural mutation.
    pub fn state(&self) -> Result<u32, ShmError> {
        Ok(self.record.get_u32("state")?)
    }

    fn node(&self, ptr: u32) -> Result<MemoryRange, ShmError> {
        Ok(self.region.pre_allocated(ptr, node_size::<T>())?)
    }

    fn bump_state(&self) -> Result<(), ShmError> {
        let state = self.record.get_u32("state")?;
        self.record.set_u32("state", state.wrapping_add(1))?;
        Ok(())
    }

    /// Append a value at the tail.
    pub fn push_back(&self, value: T) -> Result<(), ShmError> {
        self.lock.acquire();
        let result = (|| {
            self.bump_state()?;
            let node = self.region.alloc(node_align::<T>(), node_size::<T>())?;
            T::store(&node, node_value_offset::<T>(), value)?;
            node.write_u32(NODE_NEXT, 0)?;
            let last = self.record.get_u32("last")?;
            node.write_u32(NODE_PREV, last)?;
            if last == 0 {
                self.record.set_u32("first", node.ptr())?;
            } else {
                self.node(last)?.write_u32(NODE_NEXT, node.ptr())?;
            }
            self.record.set_u32("last", node.ptr())?;
            self.record
                .set_u32("size", self.record.get_u32("size")? + 1)?;
            Ok(())
        })();
        self.lock.release();
        result
    }

    /// Prepend a value at the head.
    pub fn push_front(&self, value: T) -> Result<(), ShmError> {
        self.lock.acquire();
        let result = (|| {
            self.bump_state()?;
            let node = self.region.alloc(node_align::<T>(), node_size::<T>())?;
            T::store(&node, node_value_offset::<T>(), value)?;
            node.write_u32(NODE_PREV, 0)?;
            let first = self.record.get_u32("first")?;
            node.write_u32(NODE_NEXT, first)?;
            if first == 0 {
                self.record.set_u32("last", node.ptr())?;
            } else {
                self.node(first)?.write_u32(NODE_PREV, node.ptr())?;
            }
            self.record.set_u32("first", node.ptr())?;
            self.record
                .set_u32("size", self.record.get_u32("size")? + 1)?;
            Ok(())
        })();
        self.lock.release();
        result
    }

    /// Remove and return the head value.
    pub fn pop_front(&self) -> Result<Option<T>, ShmError> {
        self.lock.acquire();
        let result = self.unlink(true);
        self.lock.release();
        result
    }

    /// Remove and return the tail value.
    pub fn pop_back(&self) -> Result<Option<T>, ShmError> {
        self.lock.acquire();
        let result = self.unlink(false);
        self.lock.release();
        result
    }

    fn unlink(&self, front: bool) -> Result<Option<T>, ShmError> {
        let ptr = self
            .record
            .get_u32(if front { "first" } else { "last" })?;
        if ptr == 0 {
            return Ok(None);
        }
        self.bump_state()?;
        let node = self.node(ptr)?;
        let value = T::load(&node, node_value_offset::<T>())?;
        if front {
            let next = node.read_u32(NODE_NEXT)?;
            self.record.set_u32("first", next)?;
            if next == 0 {
                self.record.set_u32("last", 0)?;
            } else {
                self.node(next)?.write_u32(NODE_PREV, 0)?;
            }
        } else {
            let prev = node.read_u32(NODE_PREV)?;
            self.record.set_u32("last", prev)?;
            if prev == 0 {
                self.record.set_u32("first", 0)?;
            } else {
                self.node(prev)?.write_u32(NODE_NEXT, 0)?;
            }
        }
        let owned = self
            .region
            .assume_owned(ptr, node_size::<T>(), node_align::<T>())?;
        self.region.free(owned)?;
        self.record
            .set_u32("size", self.record.get_u32("size")? - 1)?;
        Ok(Some(value))
    }

    /// Iterate values head to tail with the `state` snapshot rule.
    pub fn values(&self) -> Result<ListValues<'_, T>, ShmError> {
        Ok(ListValues {
            list: self,
            state: self.state()?,
            current: self.record.get_u32("first")?,
        })
    }

    /// Drain into a plain vector (primarily for tests and diagnostics).
    pub fn to_vec(&self) -> Result<Vec<T>, ShmError> {
        self.lock.acquire();
        let result = (|| {
            let mut out = Vec::new();
            let mut current = self.record.get_u32("first")?;
            while current != 0 {
                let node = self.node(current)?;
                out.push(T::load(&node, node_value_offset::<T>())?);
                current = node.read_u32(NODE_NEXT)?;
            }
            Ok(out)
        })();
        self.lock.release();
        result
    }

    /// Free every node and the list record.
    pub fn dispose(self) -> Result<(), ShmError> {
        let mut current = self.record.get_u32("first")?;
        while current != 0 {
            let node = self.node(current)?;
            let next = node.read_u32(NODE_NEXT)?;
            let owned =
                self.region
                    .assume_owned(current, node_size::<T>(), node_align::<T>())?;
            self.region.free(owned)?;
            current = next;
        }
        self.record.free()?;
        Ok(())
    }
}

impl<T: ShmElement> core::fmt::Debug for SharedLinkedList<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedLinkedList")
            .field("ptr", &self.record.ptr())
            .finish()
    }
}

/// Iterator over list values.
pub struct ListValues<'a, T: ShmElement> {
    list: &'a SharedLinkedList<T>,
    state: u32,
    current: u32,
}

impl<'a, T: ShmElement> Iterator for ListValues<'a, T> {
    type Item = Result<T, ShmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == 0 {
            return None;
        }
        match self.list.state() {
            Ok(state) if state == self.state => {}
            Ok(_) => return Some(Err(ShmError::ConcurrentModification)),
            Err(e) => return Some(Err(e)),
        }
        let node = match self.list.node(self.current) {
            Ok(node) => node,
            Err(e) => return Some(Err(e)),
        };
        let value = match T::load(&node, node_value_offset::<T>()) {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        };
        self.current = match node.read_u32(NODE_NEXT) {
            Ok(next) => next,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Ok(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Arc<MemoryRegion> {
        MemoryRegion::new(1 << 18).unwrap()
    }

    #[test]
    fn test_push_pop_both_ends() {
        let region = region();
        let list: SharedLinkedList<u32> = SharedLinkedList::new(&region).unwrap();
        list.push_back(2).unwrap();
        list.push_front(1).unwrap();
        list.push_back(3).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![1, 2, 3]);
        assert_eq!(list.pop_front().unwrap(), Some(1));
        assert_eq!(list.pop_back().unwrap(), Some(3));
        assert_eq!(list.pop_back().unwrap(), Some(2));
        assert_eq!(list.pop_front().unwrap(), None);
        list.dispose().unwrap();
    }

    #[test]
    fn test_iterator_detects_mutation() {
        let region = region();
        let list: SharedLinkedList<u8> = SharedLinkedList::new(&region).unwrap();
        list.push_back(1).unwrap();
        list.push_back(2).unwrap();
        let mut values = list.values().unwrap();
        assert_eq!(values.next().unwrap().unwrap(), 1);
        list.push_back(3).unwrap();
        assert_eq!(
            values.next().unwrap(),
            Err(ShmError::ConcurrentModification)
        );
        list.dispose().unwrap();
    }

    #[test]
    fn test_attach_shares_state() {
        let region = region();
        let list: SharedLinkedList<u64> = SharedLinkedList::new(&region).unwrap();
        list.push_back(11).unwrap();
        let other: SharedLinkedList<u64> =
            SharedLinkedList::attach(&region, list.ptr()).unwrap();
        other.push_back(22).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![11, 22]);
        list.dispose().unwrap();
    }
}
