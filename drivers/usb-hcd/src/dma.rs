//! DMA-visible memory
//!
//! Rings, contexts and data buffers are read and written by the controller
//! while software holds references to them. All accesses to memory the
//! controller may touch go through volatile reads and writes.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use crate::error::{HcdError, HcdResult};

/// Alignment of rings, contexts and segment tables
pub const DMA_ALIGN: usize = 64;

/// Rings and contexts must not cross this boundary
pub const DMA_BOUNDARY: usize = 0x10000;

/// Zero-initialised, aligned buffer shared with the controller
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned; shared access from interrupt context
// is serialized by the owning manager's lock.
unsafe impl Send for DmaBuffer {}
// SAFETY: `&DmaBuffer` only exposes volatile reads and raw addresses.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `size` zeroed bytes aligned to `align` that do not cross a
    /// `boundary` (0 = no boundary)
    ///
    /// The boundary constraint is met by aligning the allocation to the next
    /// power of two of its size, which keeps it inside one boundary window.
    pub fn new(size: usize, align: usize, boundary: usize) -> HcdResult<Self> {
        if size == 0 {
            return Err(HcdError::InvalidArgument {
                name: "size",
                value: "DMA buffer must not be empty",
            });
        }
        if boundary != 0 && size > boundary {
            return Err(HcdError::InvalidArgument {
                name: "size",
                value: "larger than DMA boundary",
            });
        }

        let mut align = align.max(1);
        if boundary != 0 {
            align = align.max(size.next_power_of_two());
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| {
            HcdError::InvalidArgument {
                name: "align",
                value: "not a power of two",
            }
        })?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HcdError::OutOfMemory { requested: size })?;

        Ok(Self {
            ptr,
            len: size,
            layout,
        })
    }

    /// Buffer for transfer data, cache line aligned
    pub fn for_data(size: usize) -> HcdResult<Self> {
        Self::new(size, DMA_ALIGN, 0)
    }

    /// Copy `data` into a new data buffer
    pub fn from_slice(data: &[u8]) -> HcdResult<Self> {
        let mut buffer = Self::for_data(data.len())?;
        buffer.as_mut_slice().copy_from_slice(data);
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// CPU address of the first byte
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Snapshot view of the contents
    ///
    /// Only meaningful while the controller is not writing the buffer, e.g.
    /// after the transfer that used it has completed.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed through self
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Volatile read of a `T` at byte `offset`
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + core::mem::size_of::<T>() <= self.len);
        assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: bounds and alignment checked above; the buffer is at least
        // DMA_ALIGN aligned
        unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const T) }
    }

    /// Volatile write of a `T` at byte `offset`
    ///
    /// Takes `&self` because the controller writes the same memory
    /// concurrently; callers serialize software writers.
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        assert!(offset + core::mem::size_of::<T>() <= self.len);
        assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: bounds and alignment checked above
        unsafe { core::ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut T, value) }
    }

    /// Zero the whole buffer
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_boundary() {
        let buffer = DmaBuffer::new(1024, DMA_ALIGN, DMA_BOUNDARY).unwrap();
        assert_eq!(buffer.addr() % 1024, 0);
        let start = buffer.addr() / DMA_BOUNDARY;
        let end = (buffer.addr() + buffer.len() - 1) / DMA_BOUNDARY;
        assert_eq!(start, end);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_oversize_and_empty() {
        assert!(DmaBuffer::new(DMA_BOUNDARY + 1, DMA_ALIGN, DMA_BOUNDARY).is_err());
        assert!(DmaBuffer::for_data(0).is_err());
    }

    #[test]
    fn test_volatile_access() {
        let buffer = DmaBuffer::new(64, DMA_ALIGN, 0).unwrap();
        buffer.write::<u32>(8, 0xdead_beef);
        assert_eq!(buffer.read::<u32>(8), 0xdead_beef);
        assert_eq!(buffer.as_slice()[8], 0xef);
    }

    #[test]
    fn test_from_slice() {
        let buffer = DmaBuffer::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        assert_eq!(buffer.addr() % DMA_ALIGN, 0);
    }
}
