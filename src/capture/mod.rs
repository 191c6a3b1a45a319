pub mod convert;
pub mod frame;
pub mod mode;
pub mod stats;
pub mod unicam_isp;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use unicam_isp::{SessionState, UnicamIsp};
