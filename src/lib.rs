//! # nfp-cpp-proxy - CPP bus proxy for NFP SmartNICs
//!
//! A user-space daemon that owns a SmartNIC's PCIe expansion windows and
//! multiplexes them across local clients connected over a Unix domain
//! socket.
//!
//! ## Features
//!
//! - **Window management**: BARs split into expansion windows, classified
//!   into control, explicit and bulk windows, reprogrammed on demand
//! - **Area reservations**: page-granular offset space with first-fit
//!   placement and overlap checks
//! - **Chunked transfers**: READ/WRITE routed through transient areas,
//!   never crossing the memory-I/O boundary
//! - **Single-threaded server**: one `mio` readiness loop, buffered framing,
//!   connection-scoped failures
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │        Server (listener + connection table)      │
//! ├──────────────────────────────────────────────────┤
//! │  Command framing  │  Dispatcher                  │
//! └──────────────────────────────────────────────────┘
//!           │                         │
//!           ▼                         ▼
//! ┌─────────────────┐    ┌─────────────────────────┐
//! │ Area Allocator  │    │    Transfer Engine      │
//! └─────────────────┘    └─────────────────────────┘
//!           │                         │
//!           └────────────┬────────────┘
//!                        ▼
//! ┌──────────────────────────────────────────────────┐
//! │   Window Manager  ──►  Hardware (sysfs / sim)    │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod areas;
pub mod config;
pub mod cpp;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod server;
pub mod state;
pub mod transfer;
pub mod windows;

pub use areas::{Area, AreaAllocator, OwnerId, AREA_AUTO};
pub use config::ProxyConfig;
pub use cpp::CppId;
pub use error::{ProxyError, Result};
pub use hardware::{DeviceIdentity, Hardware, MemoryResource, SimulatedDevice, SysfsDevice};
pub use protocol::{AreaRequest, Command, Identification, ProxyClient};
pub use server::{shutdown_on_signals, Server, ShutdownHandle};
pub use state::ProxyState;
pub use transfer::{plan_chunks, TransferEngine, TransferError};
pub use windows::{WindowManager, WindowRole, WindowStats};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_PATCH: u32 = 0;
