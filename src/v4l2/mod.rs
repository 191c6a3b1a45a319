//! Kernel buffer I/O: device nodes, buffer ownership and shared memory.

pub mod buffer;
pub mod cma;
pub mod device;
pub mod sys;

pub use buffer::{hand_off, BufferQueue, BufferState, Dequeued, Ledger, SharedPool};
pub use cma::DmaBuffer;
pub use device::{ControlRange, DeviceHandle, Format};
