//! CMA allocations shared with the ISP by descriptor.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use dma_heap::{Heap, HeapKind};
use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::error::Result;

/// A CMA buffer mapped into the process. The descriptor is handed to the
/// ISP through a compound control; the mapping lets us fill it.
pub struct DmaBuffer {
    map: MmapMut,
    fd: OwnedFd,
}

impl DmaBuffer {
    pub fn allocate(size: usize) -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma)?;
        let fd = heap.allocate(size)?;
        // SAFETY: the heap just handed us `size` bytes behind `fd`; nothing
        // else maps it until the descriptor is passed to the driver.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&fd)? };
        debug!(size, fd = fd.as_raw_fd(), "Allocated CMA buffer");
        Ok(Self { map, fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Copy little-endian u16 words into the buffer from its start.
    pub fn write_u16(&mut self, words: &[u16]) {
        for (chunk, w) in self.map.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
    }
}
