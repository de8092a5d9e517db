pub mod slot;

pub use slot::{FrameSlot, SlotStats};
