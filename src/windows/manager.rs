//! Window discovery and CPP area primitives

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::{
    cpp::{CppId, CPP_ADDRESS_MASK},
    error::{ProxyError, Result},
    hardware::{DeviceIdentity, Hardware, Span},
};

use super::{
    routing::RoutingConfig,
    window::{Window, WindowRole},
    EXPANSION_CFG_BASE, EXPLICIT_GROUPS, MIN_WINDOWS, SLOTS_PER_RESOURCE,
};

/// Opaque handle of an opened CPP area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaHandle(u64);

impl AreaHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where an acquired area currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredWindow {
    /// Expansion index of the window
    pub window: usize,
    /// Host physical address of the area's first byte
    pub phys_addr: u64,
}

#[derive(Debug)]
struct BackingArea {
    id: CppId,
    address: u64,
    size: u64,
    /// Position in `windows` while acquired
    window: Option<usize>,
    acquired: u32,
}

/// Window counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Bulk windows reprogrammed with a new routing
    pub reprograms: u64,
    /// Acquisitions served by a window already routed identically
    pub shared: u64,
    /// Acquisitions refused for lack of a window
    pub exhausted: u64,
}

/// Owner of the window table and of every opened CPP area
#[derive(Debug)]
pub struct WindowManager {
    hardware: Box<dyn Hardware>,
    /// Sorted by `(size class, index)`
    windows: Vec<Window>,
    areas: HashMap<AreaHandle, BackingArea>,
    next_handle: u64,
    stats: WindowStats,
}

impl WindowManager {
    /// Classify the hardware's memory resources into windows
    ///
    /// Fails if fewer than [`MIN_WINDOWS`] windows are usable or if the
    /// control window cannot reach the window configuration registers.
    pub fn discover(hardware: Box<dyn Hardware>) -> Result<Self> {
        let mut windows = Vec::new();

        for (position, resource) in hardware.resources().into_iter().enumerate() {
            if resource.index != position {
                return Err(ProxyError::hardware(format!(
                    "resource list out of order: entry {} reports index {}",
                    position, resource.index
                )));
            }
            if !resource.is_wired() {
                debug!("resource {} not wired, skipping", resource.index);
                continue;
            }

            let len = resource.len / SLOTS_PER_RESOURCE as u64;
            if len == 0 {
                warn!(
                    "resource {} too small to split ({:#x} bytes)",
                    resource.index, resource.len
                );
                continue;
            }

            for slot in 0..SLOTS_PER_RESOURCE {
                let offset = slot as u64 * len;
                windows.push(Window::new(
                    resource.index * SLOTS_PER_RESOURCE + slot,
                    resource.index,
                    Span::new(offset, len),
                    resource.phys_base + offset,
                ));
            }
        }

        if windows.len() < MIN_WINDOWS {
            return Err(ProxyError::hardware(format!(
                "only {} usable windows, need at least {}",
                windows.len(),
                MIN_WINDOWS
            )));
        }

        windows.sort_by_key(|w| (w.size_class, w.index));

        let mut manager = Self {
            hardware,
            windows,
            areas: HashMap::new(),
            next_handle: 1,
            stats: WindowStats::default(),
        };

        manager.windows[0].set_role(WindowRole::Control);
        let control = &manager.windows[0];
        let cfg_end = EXPANSION_CFG_BASE + 4 * manager.max_window_index() as u64 + 4;
        if cfg_end > control.len() {
            return Err(ProxyError::hardware(format!(
                "control window {} ({:#x} bytes) does not cover configuration registers",
                control.index,
                control.len()
            )));
        }

        let explicit = EXPLICIT_GROUPS.min(manager.windows.len() - 1);
        for group in 0..explicit {
            let position = group + 1;
            manager.windows[position].set_role(WindowRole::Explicit(group as u8));
            manager.program(position, RoutingConfig::explicit(group as u8))?;
        }

        info!(
            "discovered {} windows: control #{}, {} explicit, {} bulk",
            manager.windows.len(),
            manager.windows[0].index,
            explicit,
            manager.bulk_windows()
        );

        Ok(manager)
    }

    fn max_window_index(&self) -> usize {
        self.windows.iter().map(|w| w.index).max().unwrap_or(0)
    }

    /// All windows in best-fit order
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// The control window
    pub fn control_window(&self) -> &Window {
        &self.windows[0]
    }

    /// Explicit-transaction window of `group`, if one was reserved
    pub fn explicit_window(&self, group: u8) -> Option<&Window> {
        self.windows
            .iter()
            .find(|w| w.role() == WindowRole::Explicit(group))
    }

    /// Number of bulk windows
    pub fn bulk_windows(&self) -> usize {
        self.windows.iter().filter(|w| w.is_bulk()).count()
    }

    /// Number of bulk windows with no acquired area
    pub fn free_bulk_windows(&self) -> usize {
        self.windows
            .iter()
            .filter(|w| w.is_bulk() && w.users() == 0)
            .count()
    }

    /// Number of open CPP areas
    pub fn open_areas(&self) -> usize {
        self.areas.len()
    }

    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    /// Identification data of the device
    pub fn identity(&self) -> DeviceIdentity {
        self.hardware.identity()
    }

    /// Borrow the hardware handle
    pub fn hardware(&self) -> &dyn Hardware {
        self.hardware.as_ref()
    }

    /// Write a routing word through the control window and read it back
    fn program(&mut self, position: usize, routing: RoutingConfig) -> Result<()> {
        let control = self.windows[0].clone();
        let window_index = self.windows[position].index;
        let reg = EXPANSION_CFG_BASE + 4 * window_index as u64;
        let (offset, _) = control.span.checked_range(reg, 4)?;

        let word = routing.encode();
        if let Err(e) = self.hardware.write_u32(control.resource, offset, word) {
            self.windows[position].set_routing(None);
            return Err(e);
        }
        // Read back so the posted write lands before the window is used
        let readback = self.hardware.read_u32(control.resource, offset)?;
        if readback != word {
            self.windows[position].set_routing(None);
            return Err(ProxyError::hardware(format!(
                "window {} config readback {:#010x} != {:#010x}",
                window_index, readback, word
            )));
        }

        debug!("window {} routed {:#010x}", window_index, word);
        self.windows[position].set_routing(Some(routing));
        Ok(())
    }

    /// Open an area over `[address, address + size)` of CPP target `id`
    ///
    /// No window is touched until the area is acquired.
    pub fn area_open(&mut self, id: CppId, address: u64, size: u64) -> Result<AreaHandle> {
        if size == 0 {
            return Err(ProxyError::invalid_parameter("size", "Area size must be greater than 0"));
        }
        address
            .checked_add(size - 1)
            .filter(|last| *last <= CPP_ADDRESS_MASK)
            .ok_or_else(|| {
                ProxyError::invalid_parameter(
                    "address",
                    format!("[{:#x}, +{:#x}) exceeds the 40-bit CPP space", address, size),
                )
            })?;
        if RoutingConfig::for_address(id, 0, 0).is_none() {
            return Err(ProxyError::invalid_parameter(
                "cpp_id",
                format!("{:?} cannot be routed through a bulk window", id),
            ));
        }
        if !self
            .windows
            .iter()
            .any(|w| w.is_bulk() && w.can_hold(address, size))
        {
            return Err(ProxyError::invalid_parameter(
                "size",
                format!("no window class can hold [{:#x}, +{:#x})", address, size),
            ));
        }

        let handle = AreaHandle(self.next_handle);
        self.next_handle += 1;
        self.areas.insert(
            handle,
            BackingArea {
                id,
                address,
                size,
                window: None,
                acquired: 0,
            },
        );
        Ok(handle)
    }

    /// Route an opened area through a bulk window
    ///
    /// Prefers a window already routed identically; otherwise takes the
    /// smallest unused window able to hold the range. Nested acquisitions
    /// share the window.
    pub fn area_acquire(&mut self, handle: AreaHandle) -> Result<AcquiredWindow> {
        let (id, address, size, current) = {
            let area = self.area(handle)?;
            (area.id, area.address, area.size, area.window)
        };

        if let Some(position) = current {
            if let Some(area) = self.areas.get_mut(&handle) {
                area.acquired += 1;
            }
            return Ok(self.acquired_window(position, address));
        }

        let shared = self.windows.iter().position(|w| {
            w.is_bulk()
                && w.users() > 0
                && w.can_hold(address, size)
                && w.routing() == RoutingConfig::for_address(id, address, w.size_class)
        });

        let position = match shared {
            Some(position) => {
                self.stats.shared += 1;
                position
            }
            None => {
                let free = self.windows.iter().position(|w| {
                    w.is_bulk()
                        && w.users() == 0
                        && w.can_hold(address, size)
                        && RoutingConfig::for_address(id, address, w.size_class).is_some()
                });
                let position = match free {
                    Some(position) => position,
                    None => {
                        self.stats.exhausted += 1;
                        return Err(ProxyError::no_window(address, size));
                    }
                };
                let routing = RoutingConfig::for_address(id, address, self.windows[position].size_class)
                    .ok_or_else(|| ProxyError::no_window(address, size))?;
                if self.windows[position].routing() != Some(routing) {
                    self.program(position, routing)?;
                    self.stats.reprograms += 1;
                }
                position
            }
        };

        self.windows[position].add_user();
        if let Some(area) = self.areas.get_mut(&handle) {
            area.window = Some(position);
            area.acquired = 1;
        }
        Ok(self.acquired_window(position, address))
    }

    fn acquired_window(&self, position: usize, address: u64) -> AcquiredWindow {
        let window = &self.windows[position];
        AcquiredWindow {
            window: window.index,
            phys_addr: window.phys_base + window.window_offset(address),
        }
    }

    /// Drop one acquisition; the window is freed when the last one goes
    pub fn area_release(&mut self, handle: AreaHandle) -> Result<()> {
        let area = self
            .areas
            .get_mut(&handle)
            .ok_or_else(|| ProxyError::not_found(format!("area handle {}", handle.0)))?;
        let position = area
            .window
            .ok_or_else(|| ProxyError::invalid_parameter("handle", "Area is not acquired"))?;

        area.acquired -= 1;
        if area.acquired == 0 {
            area.window = None;
            self.windows[position].remove_user();
        }
        Ok(())
    }

    /// Close an area, releasing every outstanding acquisition first
    pub fn area_close(&mut self, handle: AreaHandle) -> Result<()> {
        let area = self
            .areas
            .remove(&handle)
            .ok_or_else(|| ProxyError::not_found(format!("area handle {}", handle.0)))?;
        if let Some(position) = area.window {
            self.windows[position].remove_user();
        }
        Ok(())
    }

    /// Whether an area is currently routed through a window
    pub fn is_acquired(&self, handle: AreaHandle) -> bool {
        self.areas
            .get(&handle)
            .map_or(false, |area| area.window.is_some())
    }

    /// Read from an acquired area
    pub fn area_read(&self, handle: AreaHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (resource, at) = self.locate(handle, offset, buf.len() as u64)?;
        self.hardware.read(resource, at, buf)
    }

    /// Write into an acquired area
    pub fn area_write(&mut self, handle: AreaHandle, offset: u64, data: &[u8]) -> Result<()> {
        let (resource, at) = self.locate(handle, offset, data.len() as u64)?;
        self.hardware.write(resource, at, data)
    }

    /// Resolve `[offset, offset + len)` of an area to a resource location
    fn locate(&self, handle: AreaHandle, offset: u64, len: u64) -> Result<(usize, u64)> {
        let area = self.area(handle)?;
        let position = area
            .window
            .ok_or_else(|| ProxyError::invalid_parameter("handle", "Area is not acquired"))?;
        let area_span = Span::new(area.address, area.size);
        let (address, _) = area_span.checked_range(offset, len)?;

        let window = &self.windows[position];
        let (at, _) = window
            .span
            .checked_range(window.window_offset(address), len)?;
        Ok((window.resource, at))
    }

    fn area(&self, handle: AreaHandle) -> Result<&BackingArea> {
        self.areas
            .get(&handle)
            .ok_or_else(|| ProxyError::not_found(format!("area handle {}", handle.0)))
    }
}
