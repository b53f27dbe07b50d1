//! Shared growable array.
//!
//! Elements are stored indirectly: the array record holds a pointer area
//! whose slots point at individually allocated element images. Structural
//! mutations increment the `state` counter under the record lock; iterators
//! snapshot `state` and fail with a concurrent-modification error when it
//! moves underneath them.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{MemoryError, ShmError};
use crate::record::{PropertyType, Record, RecordDescriptor};
use crate::region::{MemoryRange, MemoryRegion};

/// Fixed-size element stored inside a shared container.
pub trait ShmElement: Copy {
    /// Element size in bytes.
    const SIZE: u32;
    /// Element alignment.
    const ALIGN: u32;

    /// Load an element image.
    fn load(range: &MemoryRange, offset: u32) -> Result<Self, MemoryError>;
    /// Store an element image.
    fn store(range: &MemoryRange, offset: u32, value: Self) -> Result<(), MemoryError>;
}

macro_rules! shm_element {
    {$($ty:ty : $read:ident / $write:ident;)*} => {$(
        impl ShmElement for $ty {
            const SIZE: u32 = core::mem::size_of::<$ty>() as u32;
            const ALIGN: u32 = core::mem::size_of::<$ty>() as u32;

            fn load(range: &MemoryRange, offset: u32) -> Result<Self, MemoryError> {
                range.$read(offset)
            }

            fn store(
                range: &MemoryRange,
                offset: u32,
                value: Self,
            ) -> Result<(), MemoryError> {
                range.$write(offset, value)
            }
        }
    )*};
}

shm_element! {
    u8  : read_u8  / write_u8;
    u16 : read_u16 / write_u16;
    u32 : read_u32 / write_u32;
    u64 : read_u64 / write_u64;
    i8  : read_i8  / write_i8;
    i16 : read_i16 / write_i16;
    i32 : read_i32 / write_i32;
    i64 : read_i64 / write_i64;
}

/// Size of one slot in the pointer area.
const SLOT_SIZE: u32 = 4;

fn descriptor() -> Arc<RecordDescriptor> {
    RecordDescriptor::shared(&[
        ("state", PropertyType::U32),
        ("start", PropertyType::U32),
        ("next", PropertyType::U32),
        ("element_size", PropertyType::U32),
        ("elements_ptr", PropertyType::U32),
        ("elements_len", PropertyType::U32),
    ])
}

/// A growable array in shared memory.
///
/// Handles to the same array image (attached via [`SharedArray::attach`])
/// coordinate through the record lock; a handle itself belongs to one
/// thread at a time.
pub struct SharedArray<T: ShmElement> {
    region: Arc<MemoryRegion>,
    record: Record,
    lock: crate::lock::Lock,
    _element: PhantomData<T>,
}

impl<T: ShmElement> SharedArray<T> {
    /// Allocate a fresh array with room for `capacity` elements before the
    /// first grow.
    pub fn new(region: &Arc<MemoryRegion>, capacity: u32) -> Result<SharedArray<T>, ShmError> {
        let capacity = capacity.max(1);
        let record = descriptor().alloc(region)?;
        let elements = region.alloc(SLOT_SIZE, capacity * SLOT_SIZE)?;
        record.set_u32("element_size", T::SIZE)?;
        record.set_u32("elements_ptr", elements.ptr())?;
        record.set_u32("elements_len", elements.len())?;
        let lock = record.lock()?;
        Ok(SharedArray {
            region: region.clone(),
            record,
            lock,
            _element: PhantomData,
        })
    }

    /// Attach to an existing array image at `ptr`.
    pub fn attach(region: &Arc<MemoryRegion>, ptr: u32) -> Result<SharedArray<T>, ShmError> {
        let desc = descriptor();
        let range = region.pre_allocated(ptr, desc.size())?;
        let record = desc.load(&range, 0)?;
        let lock = record.lock()?;
        Ok(SharedArray {
            region: region.clone(),
            record,
            lock,
            _element: PhantomData,
        })
    }

    /// Run `f` with this handle holding the array lock, so that a compound
    /// sequence of operations is observed atomically by other handles.
    pub fn run_locked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.lock.acquire();
        let result = f();
        self.lock.release();
        result
    }

    /// Pointer of the array image, for sharing with other threads.
    pub fn ptr(&self) -> u32 {
        self.record.ptr()
    }

    /// Number of elements currently stored.
    pub fn len(&self) -> Result<u32, ShmError> {
        Ok(self.record.get_u32("next")? - self.record.get_u32("start")?)
    }

    /// Check whether the array is empty.
    pub fn is_empty(&self) -> Result<bool, ShmError> {
        Ok(self.len()? == 0)
    }

    /// Mutation counter; changes on every structural mutation.
    pub fn state(&self) -> Result<u32, ShmError> {
        Ok(self.record.get_u32("state")?)
    }

    fn pointer_area(&self) -> Result<MemoryRange, ShmError> {
        let ptr = self.record.get_u32("elements_ptr")?;
        let len = self.record.get_u32("elements_len")?;
        Ok(self.region.pre_allocated(ptr, len)?)
    }

    fn capacity(&self) -> Result<u32, ShmError> {
        Ok(self.record.get_u32("elements_len")? / SLOT_SIZE)
    }

    fn grow(&self, additional: u32) -> Result<(), ShmError> {
        let capacity = self.capacity()?;
        let next = self.record.get_u32("next")?;
        if next + additional <= capacity {
            return Ok(());
        }
        let new_capacity = (capacity * 2).max(capacity + additional);
        let new_area = self.region.alloc(SLOT_SIZE, new_capacity * SLOT_SIZE)?;
        let old_area = self.pointer_area()?;
        self.region.copy_within(&new_area, &old_area)?;
        let old_owned = self.region.assume_owned(
            old_area.ptr(),
            old_area.len(),
            SLOT_SIZE,
        )?;
        // The new area's ownership now lives in the record image.
        self.record.set_u32("elements_ptr", new_area.ptr())?;
        self.record.set_u32("elements_len", new_area.len())?;
        self.region.free(old_owned)?;
        Ok(())
    }

    fn bump_state(&self) -> Result<(), ShmError> {
        let state = self.record.get_u32("state")?;
        self.record.set_u32("state", state.wrapping_add(1))?;
        Ok(())
    }

    /// Append elements to the end of the array.
    pub fn push(&self, items: &[T]) -> Result<(), ShmError> {
        self.lock.acquire();
        let result = self.push_locked(items);
        self.lock.release();
        result
    }

    fn push_locked(&self, items: &[T]) -> Result<(), ShmError> {
        self.bump_state()?;
        self.grow(items.len() as u32)?;
        let area = self.pointer_area()?;
        let mut next = self.record.get_u32("next")?;
        for &item in items {
            let slot = self.region.alloc(T::ALIGN.max(1), T::SIZE)?;
            T::store(&slot, 0, item)?;
            area.write_u32(next * SLOT_SIZE, slot.ptr())?;
            next += 1;
        }
        self.record.set_u32("next", next)?;
        Ok(())
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Option<T>, ShmError> {
        self.lock.acquire();
        let result = self.pop_locked();
        self.lock.release();
        result
    }

    fn pop_locked(&self) -> Result<Option<T>, ShmError> {
        let start = self.record.get_u32("start")?;
        let next = self.record.get_u32("next")?;
        if start == next {
            return Ok(None);
        }
        self.bump_state()?;
        let area = self.pointer_area()?;
        let slot_ptr = area.read_u32((next - 1) * SLOT_SIZE)?;
        let slot = self
            .region
            .assume_owned(slot_ptr, T::SIZE, T::ALIGN.max(1))?;
        let value = T::load(&slot, 0)?;
        self.region.free(slot)?;
        self.record.set_u32("next", next - 1)?;
        Ok(Some(value))
    }

    /// Read the element at `index` without removing it.
    pub fn at(&self, index: u32) -> Result<T, ShmError> {
        self.lock.acquire();
        let result = self.at_locked(index);
        self.lock.release();
        result
    }

    fn at_locked(&self, index: u32) -> Result<T, ShmError> {
        let start = self.record.get_u32("start")?;
        let next = self.record.get_u32("next")?;
        if index >= next - start {
            return Err(ShmError::IndexOutOfRange);
        }
        let area = self.pointer_area()?;
        let slot_ptr = area.read_u32((start + index) * SLOT_SIZE)?;
        let slot = self.region.pre_allocated(slot_ptr, T::SIZE)?;
        Ok(T::load(&slot, 0)?)
    }

    /// Iterate element values. The iterator snapshots the mutation counter
    /// and yields a concurrent-modification error if the array changes
    /// underneath it.
    pub fn values(&self) -> Result<Values<'_, T>, ShmError> {
        Ok(Values {
            entries: self.entries()?,
        })
    }

    /// Iterate indices.
    pub fn keys(&self) -> Result<Keys<'_, T>, ShmError> {
        Ok(Keys {
            entries: self.entries()?,
        })
    }

    /// Iterate `(index, value)` pairs.
    pub fn entries(&self) -> Result<Entries<'_, T>, ShmError> {
        Ok(Entries {
            array: self,
            state: self.state()?,
            index: 0,
            len: self.len()?,
        })
    }

    /// Drain into a plain vector (primarily for tests and diagnostics).
    pub fn to_vec(&self) -> Result<Vec<T>, ShmError> {
        self.lock.acquire();
        let mut out = Vec::new();
        let result = (|| {
            let len = self.record.get_u32("next")? - self.record.get_u32("start")?;
            for i in 0..len {
                out.push(self.at_locked(i)?);
            }
            Ok(())
        })();
        self.lock.release();
        result.map(|_| out)
    }

    /// Free every element slot, the pointer area and the array record.
    pub fn dispose(self) -> Result<(), ShmError> {
        let start = self.record.get_u32("start")?;
        let next = self.record.get_u32("next")?;
        let area = self.pointer_area()?;
        for i in start..next {
            let slot_ptr = area.read_u32(i * SLOT_SIZE)?;
            let slot = self
                .region
                .assume_owned(slot_ptr, T::SIZE, T::ALIGN.max(1))?;
            self.region.free(slot)?;
        }
        let area_owned = self.region.assume_owned(area.ptr(), area.len(), SLOT_SIZE)?;
        self.region.free(area_owned)?;
        self.record.free()?;
        Ok(())
    }
}

impl<T: ShmElement> core::fmt::Debug for SharedArray<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedArray")
            .field("ptr", &self.record.ptr())
            .finish()
    }
}

/// Iterator over `(index, value)` pairs.
pub struct Entries<'a, T: ShmElement> {
    array: &'a SharedArray<T>,
    state: u32,
    index: u32,
    len: u32,
}

impl<'a, T: ShmElement> Iterator for Entries<'a, T> {
    type Item = Result<(u32, T), ShmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.len {
            return None;
        }
        match self.array.state() {
            Ok(state) if state == self.state => {}
            Ok(_) => return Some(Err(ShmError::ConcurrentModification)),
            Err(e) => return Some(Err(e)),
        }
        let index = self.index;
        self.index += 1;
        Some(self.array.at(index).map(|v| (index, v)))
    }
}

/// Iterator over element values.
pub struct Values<'a, T: ShmElement> {
    entries: Entries<'a, T>,
}

impl<'a, T: ShmElement> Iterator for Values<'a, T> {
    type Item = Result<T, ShmError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|r| r.map(|(_, v)| v))
    }
}

/// Iterator over element indices.
pub struct Keys<'a, T: ShmElement> {
    entries: Entries<'a, T>,
}

impl<'a, T: ShmElement> Iterator for Keys<'a, T> {
    type Item = Result<u32, ShmError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|r| r.map(|(i, _)| i))
    }
}
