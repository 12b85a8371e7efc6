pub mod buffer;
pub mod config;
pub mod frame;
pub mod overlay;

pub use buffer::{Published, SharedFrameBuffer};
pub use frame::{Frame, FrameError};
