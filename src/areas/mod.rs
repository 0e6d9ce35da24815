//! Client area reservations

pub mod allocator;

pub use allocator::{Area, AreaAllocator, OwnerId, AREA_AUTO};
