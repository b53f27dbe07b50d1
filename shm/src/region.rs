//! Shared memory regions and range views.
//!
//! A `MemoryRegion` is a power-of-two-sized byte area with an internal
//! first-fit heap (`linked_list_allocator`) that hands out aligned,
//! zero-filled ranges. The first bytes of the region are a reserved header
//! holding the resource-handle generation counter, so no allocation ever
//! has pointer value 0.
//!
//! A `MemoryRange` is a (region, offset, length) view. Ranges obtained from
//! `alloc` own their bytes and must be returned via `free`; ranges obtained
//! from `pre_allocated`, `sub_range` or `readonly` are borrowed views and
//! must not be freed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use linked_list_allocator::Heap;

use crate::error::MemoryError;

/// Unique region identity token. Equal ids imply aliasing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Reserved region header: generation counter (4B) + padding (4B).
const HEADER_SIZE: u32 = 8;

/// Smallest supported region.
const MIN_REGION_SIZE: u32 = 256;

/// Spin mutex that yields the thread while contended, used to guard the
/// allocator's internal free list.
type AllocatorMutex<T> = spin::mutex::Mutex<T, spin::relax::Yield>;

/// A power-of-two-sized shared byte region with an internal allocator.
pub struct MemoryRegion {
    id: RegionId,
    base: *mut u8,
    size: u32,
    heap: AllocatorMutex<Heap>,
}

// Raw shared memory; cross-thread coordination is the job of the locks and
// protocols layered on top.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Allocate a zero-filled region of `size` bytes (power of two).
    pub fn new(size: u32) -> Result<Arc<MemoryRegion>, MemoryError> {
        if size < MIN_REGION_SIZE || !size.is_power_of_two() {
            return Err(MemoryError::InvalidSize);
        }
        let layout = Layout::from_size_align(size as usize, 4096)
            .map_err(|_| MemoryError::InvalidSize)?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(MemoryError::OutOfMemory);
        }

        let mut heap = Heap::empty();
        unsafe {
            heap.init(
                base.add(HEADER_SIZE as usize),
                (size - HEADER_SIZE) as usize,
            );
        }

        Ok(Arc::new(MemoryRegion {
            id: RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)),
            base,
            size,
            heap: AllocatorMutex::new(heap),
        }))
    }

    /// Get the region identity.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Get the region size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of bits needed to address any byte of the region; the shift
    /// used by the resource-handle encoding.
    pub fn handle_shift(&self) -> u32 {
        self.size.trailing_zeros()
    }

    /// Mint the next resource-handle generation from the shared counter in
    /// the region header.
    pub(crate) fn next_generation(&self) -> u32 {
        // Offset 0 is 4096-aligned by construction.
        let counter = unsafe { &*(self.base as *const AtomicU32) };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check(&self, ptr: u32, len: u32) -> Result<(), MemoryError> {
        if ptr.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(())
    }

    pub(crate) fn byte_ptr(&self, offset: u32) -> *mut u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.base.add(offset as usize) }
    }

    /// Allocate `size` bytes on an `align` boundary, zero-filled. The
    /// returned range owns its bytes.
    pub fn alloc(
        self: &Arc<Self>,
        align: u32,
        size: u32,
    ) -> Result<MemoryRange, MemoryError> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return Err(MemoryError::InvalidSize);
        }
        let layout = Layout::from_size_align(size as usize, align as usize)
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = self
            .heap
            .lock()
            .allocate_first_fit(layout)
            .map_err(|_| MemoryError::OutOfMemory)?;
        let offset = (ptr.as_ptr() as usize - self.base as usize) as u32;
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size as usize);
        }
        Ok(MemoryRange {
            region: self.clone(),
            ptr: offset,
            len: size,
            align,
            owned: true,
        })
    }

    /// Release an owned range back to the allocator.
    pub fn free(&self, range: MemoryRange) -> Result<(), MemoryError> {
        if !range.owned {
            return Err(MemoryError::FreeOfBorrowed);
        }
        if range.region.id != self.id {
            return Err(MemoryError::OutOfBounds);
        }
        let layout =
            Layout::from_size_align(range.len as usize, range.align as usize).unwrap();
        unsafe {
            let ptr = std::ptr::NonNull::new_unchecked(self.byte_ptr(range.ptr));
            self.heap.lock().deallocate(ptr, layout);
        }
        Ok(())
    }

    /// Grow or shrink an allocation in place.
    pub fn realloc(
        self: &Arc<Self>,
        _range: &MemoryRange,
        _new_size: u32,
    ) -> Result<MemoryRange, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    /// Re-assume ownership of an allocation whose pointer travelled through
    /// shared memory (e.g. an element slot stored in a container). The
    /// caller asserts that `ptr`/`size`/`align` match the original `alloc`.
    pub fn assume_owned(
        self: &Arc<Self>,
        ptr: u32,
        size: u32,
        align: u32,
    ) -> Result<MemoryRange, MemoryError> {
        self.check(ptr, size)?;
        Ok(MemoryRange {
            region: self.clone(),
            ptr,
            len: size,
            align,
            owned: true,
        })
    }

    /// Obtain a borrowed view over bytes that are already valid (allocated
    /// by some other owner, or part of a record image).
    pub fn pre_allocated(
        self: &Arc<Self>,
        ptr: u32,
        size: u32,
    ) -> Result<MemoryRange, MemoryError> {
        self.check(ptr, size)?;
        Ok(MemoryRange {
            region: self.clone(),
            ptr,
            len: size,
            align: 1,
            owned: false,
        })
    }

    /// Obtain an immutable borrowed view.
    pub fn readonly(
        self: &Arc<Self>,
        ptr: u32,
        size: u32,
    ) -> Result<ReadonlyMemoryRange, MemoryError> {
        self.check(ptr, size)?;
        Ok(ReadonlyMemoryRange {
            region: self.clone(),
            ptr,
            len: size,
        })
    }

    /// `memmove` the bytes of `src` into `dst`. `dst` must be at least as
    /// long as `src`; the two ranges may overlap.
    pub fn copy_within(
        &self,
        dst: &MemoryRange,
        src: &MemoryRange,
    ) -> Result<(), MemoryError> {
        if dst.region.id != self.id || src.region.id != self.id {
            return Err(MemoryError::OutOfBounds);
        }
        if dst.len < src.len {
            return Err(MemoryError::OutOfBounds);
        }
        unsafe {
            std::ptr::copy(
                self.byte_ptr(src.ptr),
                self.byte_ptr(dst.ptr),
                src.len as usize,
            );
        }
        Ok(())
    }

    /// Bytes currently available in the allocator.
    pub fn free_bytes(&self) -> usize {
        self.heap.lock().free()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size as usize, 4096).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

macro_rules! scalar_accessors {
    {$($ty:ty : $read:ident / $write:ident;)*} => {$(
        /// Read a little-endian scalar at `offset`.
        pub fn $read(&self, offset: u32) -> Result<$ty, MemoryError> {
            let mut bytes = [0u8; core::mem::size_of::<$ty>()];
            self.copy_to_slice(offset, &mut bytes)?;
            Ok(<$ty>::from_le_bytes(bytes))
        }

        /// Write a little-endian scalar at `offset`.
        pub fn $write(&self, offset: u32, value: $ty) -> Result<(), MemoryError> {
            self.copy_from_slice(offset, &value.to_le_bytes())
        }
    )*};
}

macro_rules! scalar_readers {
    {$($ty:ty : $read:ident;)*} => {$(
        /// Read a little-endian scalar at `offset`.
        pub fn $read(&self, offset: u32) -> Result<$ty, MemoryError> {
            let mut bytes = [0u8; core::mem::size_of::<$ty>()];
            self.copy_to_slice(offset, &mut bytes)?;
            Ok(<$ty>::from_le_bytes(bytes))
        }
    )*};
}

/// A writable (region, offset, length) view. Owning when obtained from
/// `alloc`, borrowed otherwise. Cloning yields a borrowed view so that
/// exactly one range stays responsible for `free`.
pub struct MemoryRange {
    region: Arc<MemoryRegion>,
    ptr: u32,
    len: u32,
    align: u32,
    owned: bool,
}

impl MemoryRange {
    /// Get the owning region.
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Offset of the first byte inside the region.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check whether the range is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this range owns its allocation.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    fn check(&self, offset: u32, count: u32) -> Result<(), MemoryError> {
        if offset.checked_add(count).map_or(true, |end| end > self.len) {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(())
    }

    /// A borrowed sub-view of this range.
    pub fn sub_range(&self, offset: u32, len: u32) -> Result<MemoryRange, MemoryError> {
        self.check(offset, len)?;
        Ok(MemoryRange {
            region: self.region.clone(),
            ptr: self.ptr + offset,
            len,
            align: 1,
            owned: false,
        })
    }

    /// An immutable view of this range.
    pub fn as_readonly(&self) -> ReadonlyMemoryRange {
        ReadonlyMemoryRange {
            region: self.region.clone(),
            ptr: self.ptr,
            len: self.len,
        }
    }

    /// View a 4-byte cell as an atomic. The cell must be 4-aligned within
    /// the region.
    pub fn atomic_u32(&self, offset: u32) -> Result<&AtomicU32, MemoryError> {
        self.check(offset, 4)?;
        let abs = self.ptr + offset;
        if abs % 4 != 0 {
            return Err(MemoryError::Misaligned);
        }
        Ok(unsafe { &*(self.region.byte_ptr(abs) as *const AtomicU32) })
    }

    /// Copy bytes out of the range.
    pub fn copy_to_slice(&self, offset: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, dst.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.byte_ptr(self.ptr + offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the range.
    pub fn copy_from_slice(&self, offset: u32, src: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, src.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.region.byte_ptr(self.ptr + offset),
                src.len(),
            );
        }
        Ok(())
    }

    /// Copy the whole range into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len as usize];
        // Bounds hold by construction.
        let _ = self.copy_to_slice(0, &mut out);
        out
    }

    /// Zero the whole range.
    pub fn zero_fill(&self) {
        unsafe {
            std::ptr::write_bytes(self.region.byte_ptr(self.ptr), 0, self.len as usize);
        }
    }

    scalar_accessors! {
        u8  : read_u8  / write_u8;
        u16 : read_u16 / write_u16;
        u32 : read_u32 / write_u32;
        u64 : read_u64 / write_u64;
        i8  : read_i8  / write_i8;
        i16 : read_i16 / write_i16;
        i32 : read_i32 / write_i32;
        i64 : read_i64 / write_i64;
    }
}

impl Clone for MemoryRange {
    fn clone(&self) -> Self {
        MemoryRange {
            region: self.region.clone(),
            ptr: self.ptr,
            len: self.len,
            align: 1,
            owned: false,
        }
    }
}

impl core::fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRange")
            .field("region", &self.region.id)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("owned", &self.owned)
            .finish()
    }
}

/// An immutable (region, offset, length) view.
#[derive(Clone)]
pub struct ReadonlyMemoryRange {
    region: Arc<MemoryRegion>,
    ptr: u32,
    len: u32,
}

impl ReadonlyMemoryRange {
    /// Get the owning region.
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Offset of the first byte inside the region.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check whether the range is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u32, count: u32) -> Result<(), MemoryError> {
        if offset.checked_add(count).map_or(true, |end| end > self.len) {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(())
    }

    /// Copy bytes out of the range.
    pub fn copy_to_slice(&self, offset: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, dst.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.byte_ptr(self.ptr + offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy the whole range into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len as usize];
        let _ = self.copy_to_slice(0, &mut out);
        out
    }

    scalar_readers! {
        u8  : read_u8;
        u16 : read_u16;
        u32 : read_u32;
        u64 : read_u64;
        i8  : read_i8;
        i16 : read_i16;
        i32 : read_i32;
        i64 : read_i64;
    }
}

impl core::fmt::Debug for ReadonlyMemoryRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadonlyMemoryRange")
            .field("region", &self.region.id)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rejects_bad_sizes() {
        assert!(matches!(
            MemoryRegion::new(100),
            Err(MemoryError::InvalidSize)
        ));
        assert!(matches!(
            MemoryRegion::new(4000),
            Err(MemoryError::InvalidSize)
        ));
        assert!(MemoryRegion::new(4096).is_ok());
    }

    #[test]
    fn test_alloc_zero_filled_and_aligned() {
        let region = MemoryRegion::new(65536).unwrap();
        let range = region.alloc(8, 32).unwrap();
        assert_eq!(range.ptr() % 8, 0);
        assert_eq!(range.to_vec(), vec![0u8; 32]);
        region.free(range).unwrap();
    }

    #[test]
    fn test_alloc_disjoint_ranges() {
        let region = MemoryRegion::new(65536).unwrap();
        let a = region.alloc(4, 64).unwrap();
        let b = region.alloc(4, 64).unwrap();
        let (a0, a1) = (a.ptr(), a.ptr() + a.len());
        let (b0, b1) = (b.ptr(), b.ptr() + b.len());
        assert!(a1 <= b0 || b1 <= a0, "ranges overlap: {:?} {:?}", a, b);
        region.free(a).unwrap();
        region.free(b).unwrap();
    }

    #[test]
    fn test_free_of_borrowed_rejected() {
        let region = MemoryRegion::new(4096).unwrap();
        let view = region.pre_allocated(16, 16).unwrap();
        assert_eq!(region.free(view), Err(MemoryError::FreeOfBorrowed));
    }

    #[test]
    fn test_pre_allocated_bounds() {
        let region = MemoryRegion::new(4096).unwrap();
        assert!(region.pre_allocated(4090, 8).is_err());
        assert!(region.readonly(4096, 1).is_err());
    }

    #[test]
    fn test_scalar_round_trip() {
        let region = MemoryRegion::new(4096).unwrap();
        let range = region.alloc(8, 64).unwrap();
        range.write_u64(0, u64::MAX - 3).unwrap();
        range.write_i32(8, -77).unwrap();
        range.write_u16(12, 513).unwrap();
        assert_eq!(range.read_u64(0).unwrap(), u64::MAX - 3);
        assert_eq!(range.read_i32(8).unwrap(), -77);
        assert_eq!(range.read_u16(12).unwrap(), 513);
        region.free(range).unwrap();
    }

    #[test]
    fn test_copy_within_overlapping() {
        let region = MemoryRegion::new(4096).unwrap();
        let range = region.alloc(4, 16).unwrap();
        range.copy_from_slice(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let src = range.sub_range(0, 6).unwrap();
        let dst = range.sub_range(2, 6).unwrap();
        region.copy_within(&dst, &src).unwrap();
        let mut out = [0u8; 8];
        range.copy_to_slice(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5, 6]);
        region.free(range).unwrap();
    }

    #[test]
    fn test_realloc_unsupported() {
        let region = MemoryRegion::new(4096).unwrap();
        let range = region.alloc(4, 8).unwrap();
        assert!(matches!(
            region.realloc(&range, 16),
            Err(MemoryError::Unsupported)
        ));
        region.free(range).unwrap();
    }
}
