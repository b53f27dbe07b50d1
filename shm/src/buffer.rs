//! Fixed-size shared byte buffers.
//!
//! A `SharedBuffer` is a plain contiguous byte area without an allocator,
//! used for one-shot message exchange between threads (the RPC transport
//! allocates one per request). Wrapped in an `Arc` it is cheaply
//! transferable; identity is the `BufferId`, and equal ids imply aliasing
//! of the underlying bytes.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::MemoryError;

/// Unique buffer identity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Buffer allocation alignment. Generous enough for any scalar cell.
const BUFFER_ALIGN: usize = 8;

/// A contiguous shared byte buffer.
pub struct SharedBuffer {
    id: BufferId,
    base: *mut u8,
    len: u32,
}

// The buffer is raw shared memory: concurrent access is coordinated by the
// protocols layered on top (sync-words, locks), not by this type.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn new(len: u32) -> Result<SharedBuffer, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let layout = Layout::from_size_align(len as usize, BUFFER_ALIGN)
            .map_err(|_| MemoryError::InvalidSize)?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(SharedBuffer {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            base,
            len,
        })
    }

    /// Get the buffer identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Get the buffer length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check whether the buffer is empty (never true for a live buffer).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u32, count: u32) -> Result<(), MemoryError> {
        if offset.checked_add(count).map_or(true, |end| end > self.len) {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(())
    }

    /// View a 4-byte cell as an atomic. The offset must be 4-aligned.
    pub fn atomic_u32(&self, offset: u32) -> Result<&AtomicU32, MemoryError> {
        self.check(offset, 4)?;
        if offset % 4 != 0 {
            return Err(MemoryError::Misaligned);
        }
        // Alignment and bounds were checked; the cell lives as long as self.
        Ok(unsafe { &*(self.base.add(offset as usize) as *const AtomicU32) })
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, offset: u32) -> Result<u32, MemoryError> {
        let mut bytes = [0u8; 4];
        self.read_bytes_into(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32.
    pub fn write_u32(&self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Copy `dst.len()` bytes out of the buffer.
    pub fn read_bytes_into(&self, offset: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, dst.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy a byte range out of the buffer into a fresh vector.
    pub fn read_bytes(&self, offset: u32, count: u32) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; count as usize];
        self.read_bytes_into(offset, &mut out)?;
        Ok(out)
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: u32, src: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, src.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.base.add(offset as usize),
                src.len(),
            );
        }
        Ok(())
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len as usize, BUFFER_ALIGN).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

impl core::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_zero_filled() {
        let buf = SharedBuffer::new(64).unwrap();
        assert_eq!(buf.read_bytes(0, 64).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn test_buffer_scalar_round_trip() {
        let buf = SharedBuffer::new(16).unwrap();
        buf.write_u32(4, 0xDEAD_BEEF).unwrap();
        assert_eq!(buf.read_u32(4).unwrap(), 0xDEAD_BEEF);
        // Little-endian image
        assert_eq!(buf.read_bytes(4, 4).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_buffer_bounds() {
        let buf = SharedBuffer::new(8).unwrap();
        assert_eq!(buf.read_u32(6), Err(MemoryError::OutOfBounds));
        assert_eq!(buf.write_bytes(8, &[1]), Err(MemoryError::OutOfBounds));
        assert!(matches!(buf.atomic_u32(6), Err(MemoryError::Misaligned)));
    }

    #[test]
    fn test_buffer_ids_unique() {
        let a = SharedBuffer::new(8).unwrap();
        let b = SharedBuffer::new(8).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
