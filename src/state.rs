//! Device-side state shared by every connection

use log::info;

use crate::{
    areas::AreaAllocator,
    config::ProxyConfig,
    error::Result,
    hardware::Hardware,
    transfer::TransferEngine,
    windows::WindowManager,
};

/// Windows, areas and the transfer engine of one device
///
/// Owned by the server and lent to the dispatcher for one command at a
/// time.
#[derive(Debug)]
pub struct ProxyState {
    pub windows: WindowManager,
    pub areas: AreaAllocator,
    pub transfer: TransferEngine,
    /// Largest READ/WRITE payload
    pub max_transfer: u64,
}

impl ProxyState {
    /// Discover the device's windows and set up an empty area space
    pub fn new(hardware: Box<dyn Hardware>, config: &ProxyConfig) -> Result<Self> {
        config.validate()?;
        let windows = WindowManager::discover(hardware)?;
        let areas = AreaAllocator::new(config.page_size)?;
        info!(
            "device {:#010x}: {} windows, {} bulk",
            windows.identity().model,
            windows.windows().len(),
            windows.bulk_windows()
        );
        Ok(Self {
            windows,
            areas,
            transfer: TransferEngine::new(),
            max_transfer: config.max_transfer,
        })
    }
}
