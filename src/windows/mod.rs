//! Resource window management
//!
//! Every wired memory resource is split into [`SLOTS_PER_RESOURCE`]
//! expansion windows. The smallest window is hard-wired to the CPP bus's
//! register block and carries the configuration registers of all windows;
//! the next [`EXPLICIT_GROUPS`] are reserved for explicit transactions and
//! the rest are handed out to areas on demand.

pub mod manager;
pub mod routing;
pub mod window;

pub use manager::{AcquiredWindow, AreaHandle, WindowManager, WindowStats};
pub use routing::{LengthSelect, MapType, RoutingConfig};
pub use window::{size_class, Window, WindowRole};

/// Expansion windows carved out of each memory resource
pub const SLOTS_PER_RESOURCE: usize = 8;

/// Fewer usable windows than this is fatal at start-up
pub const MIN_WINDOWS: usize = 8;

/// Number of dedicated explicit-transaction windows
pub const EXPLICIT_GROUPS: usize = 4;

/// Offset of the window configuration registers inside the control window;
/// window `n` is configured by the 32-bit register at `BASE + 4 * n`
pub const EXPANSION_CFG_BASE: u64 = 0x30000;
