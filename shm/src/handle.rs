//! Resource handles: pointer + generation counter in a single u32.
//!
//! A handle encodes `(generation << shift) | ptr` where `shift` is
//! `log2(region.size)`. The generation comes from the shared counter in
//! the region header, so a pointer that is freed and re-minted yields a
//! different handle and stale handles remain detectable.

use std::sync::Arc;

use crate::error::MemoryError;
use crate::region::{MemoryRange, MemoryRegion};

/// A 32-bit token representing ownership of an object inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

impl ResourceHandle {
    /// Mint a fresh handle for the range's pointer, drawing the next
    /// generation from the region's shared counter.
    pub fn mint(region: &Arc<MemoryRegion>, range: &MemoryRange) -> ResourceHandle {
        Self::mint_for_ptr(region, range.ptr())
    }

    /// Mint a fresh handle for a raw pointer value.
    pub fn mint_for_ptr(region: &Arc<MemoryRegion>, ptr: u32) -> ResourceHandle {
        debug_assert!(ptr < region.size());
        let shift = region.handle_shift();
        let generation = region.next_generation();
        ResourceHandle((generation << shift) | ptr)
    }

    /// Extract the pointer part.
    pub fn ptr(self, region: &MemoryRegion) -> u32 {
        self.0 & (region.size() - 1)
    }

    /// Extract the generation part.
    pub fn generation(self, region: &MemoryRegion) -> u32 {
        self.0 >> region.handle_shift()
    }

    /// Re-derive the range this handle points at, validating bounds.
    pub fn deref(
        self,
        region: &Arc<MemoryRegion>,
        len: u32,
    ) -> Result<MemoryRange, MemoryError> {
        region.pre_allocated(self.ptr(region), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ptr_in_bounds() {
        let region = MemoryRegion::new(65536).unwrap();
        let range = region.alloc(4, 16).unwrap();
        let handle = ResourceHandle::mint(&region, &range);
        assert!(handle.ptr(&region) < region.size());
        assert_eq!(handle.ptr(&region), range.ptr());
        region.free(range).unwrap();
    }

    #[test]
    fn test_handles_for_same_ptr_differ() {
        let region = MemoryRegion::new(65536).unwrap();
        let range = region.alloc(4, 16).unwrap();
        let first = ResourceHandle::mint(&region, &range);
        let second = ResourceHandle::mint(&region, &range);
        assert_ne!(first, second);
        assert_eq!(first.ptr(&region), second.ptr(&region));
        assert_ne!(first.generation(&region), second.generation(&region));
        region.free(range).unwrap();
    }

    #[test]
    fn test_handle_deref_round_trip() {
        let region = MemoryRegion::new(4096).unwrap();
        let range = region.alloc(4, 8).unwrap();
        range.write_u32(0, 42).unwrap();
        let handle = ResourceHandle::mint(&region, &range);
        let view = handle.deref(&region, 8).unwrap();
        assert_eq!(view.read_u32(0).unwrap(), 42);
        region.free(range).unwrap();
    }
}
