pub mod events;
pub mod generation;
pub mod watermark;
