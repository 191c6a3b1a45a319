//! Buffer bookkeeping shared by real device nodes and simulated queues.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Who currently owns a buffer. A buffer is never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the kernel; the process must not touch the memory.
    Queued,
    /// Owned by the process until it is enqueued again.
    Dequeued,
}

/// Memory behind one buffer slot.
pub enum Backing {
    /// Kernel-allocated and mapped into the process.
    Mapped(Mmap),
    /// Imported by descriptor; the exporting node owns the memory.
    Shared(RawFd),
}

pub struct Buffer {
    pub(crate) backing: Backing,
    pub(crate) length: usize,
    pub(crate) bytesused: usize,
    pub(crate) state: BufferState,
}

impl Buffer {
    pub(crate) fn mapped(map: Mmap) -> Self {
        let length = map.len();
        Self {
            backing: Backing::Mapped(map),
            length,
            bytesused: 0,
            state: BufferState::Dequeued,
        }
    }

    pub(crate) fn shared(fd: RawFd, length: usize) -> Self {
        Self {
            backing: Backing::Shared(fd),
            length,
            bytesused: 0,
            state: BufferState::Dequeued,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Descriptor to hand to the kernel for DMABUF queues.
    pub fn dmabuf_fd(&self) -> Option<RawFd> {
        match self.backing {
            Backing::Shared(fd) => Some(fd),
            Backing::Mapped(_) => None,
        }
    }

    /// Payload of a dequeued mapped buffer.
    pub fn bytes(&self) -> Option<&[u8]> {
        match (&self.backing, self.state) {
            (Backing::Mapped(map), BufferState::Dequeued) => Some(&map[..self.bytesused.min(map.len())]),
            _ => None,
        }
    }
}

/// Buffers exported from one node and imported into others by descriptor.
/// The pool is the single owner of the descriptors; importers only keep the
/// raw numbers, so the pool must outlive every node that imported it.
pub struct SharedPool {
    fds: Vec<OwnedFd>,
    length: usize,
}

impl SharedPool {
    pub fn new(fds: Vec<OwnedFd>, length: usize) -> Self {
        Self { fds, length }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn buffer_len(&self) -> usize {
        self.length
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(|fd| fd.as_raw_fd()).collect()
    }
}

/// Descriptor of a buffer handed back by a non-blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytesused: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// A streaming queue of indexed buffers. Implemented by device nodes and by
/// in-memory simulations in tests.
pub trait BufferQueue {
    fn name(&self) -> &str;

    /// Hand buffer `index` to the device.
    fn enqueue(&mut self, index: u32) -> Result<()>;

    /// Take one finished buffer back, or `None` if nothing is ready.
    fn dequeue(&mut self) -> Result<Option<Dequeued>>;
}

/// Per-index ownership ledger.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    states: Vec<BufferState>,
}

impl Ledger {
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![BufferState::Dequeued; count],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.states.get(index as usize).copied()
    }

    pub fn queued(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == BufferState::Queued)
            .count()
    }

    /// Record a hand-off to the kernel. Fails if the slot is already queued.
    pub fn queue(&mut self, node: &str, index: u32) -> Result<()> {
        self.transition(node, index, BufferState::Dequeued, BufferState::Queued)
    }

    /// Record a buffer coming back. Fails if the slot was not queued.
    pub fn dequeue(&mut self, node: &str, index: u32) -> Result<()> {
        self.transition(node, index, BufferState::Queued, BufferState::Dequeued)
    }

    fn transition(
        &mut self,
        node: &str,
        index: u32,
        from: BufferState,
        to: BufferState,
    ) -> Result<()> {
        match self.states.get_mut(index as usize) {
            Some(state) if *state == from => {
                *state = to;
                Ok(())
            }
            Some(state) => Err(Error::BufferState {
                node: node.to_owned(),
                index,
                state: *state,
            }),
            None => Err(Error::BufferState {
                node: node.to_owned(),
                index,
                state: to,
            }),
        }
    }
}

/// Move one finished buffer from `from` to `to` under the same index.
/// Returns the index that moved, if any.
pub fn hand_off<A, B>(from: &mut A, to: &mut B) -> Result<Option<u32>>
where
    A: BufferQueue + ?Sized,
    B: BufferQueue + ?Sized,
{
    match from.dequeue()? {
        Some(buf) => {
            to.enqueue(buf.index)?;
            Ok(Some(buf.index))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_rejects_double_queue() {
        let mut ledger = Ledger::new(2);
        ledger.queue("sim", 0).unwrap();
        assert!(ledger.queue("sim", 0).is_err());
        assert_eq!(ledger.queued(), 1);
    }

    #[test]
    fn test_ledger_rejects_dequeue_of_owned_buffer() {
        let mut ledger = Ledger::new(1);
        assert!(ledger.dequeue("sim", 0).is_err());
        ledger.queue("sim", 0).unwrap();
        ledger.dequeue("sim", 0).unwrap();
        assert_eq!(ledger.state(0), Some(BufferState::Dequeued));
    }

    #[test]
    fn test_ledger_rejects_unknown_index() {
        let mut ledger = Ledger::new(1);
        assert!(ledger.queue("sim", 4).is_err());
        assert_eq!(ledger.state(4), None);
    }
}
