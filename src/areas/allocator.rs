//! Area allocator - page-granular reservations of the proxy's offset space

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::{
    cpp::CppId,
    error::{ProxyError, Result},
    windows::{AcquiredWindow, AreaHandle, WindowManager},
};

/// Offset value asking the allocator to pick the first free gap
pub const AREA_AUTO: u64 = u64::MAX;

/// Identifies the connection that owns an area or a mapping
pub type OwnerId = u64;

/// A granted reservation of CPP address space
#[derive(Debug, Clone)]
pub struct Area {
    /// Offset in the proxy's area space
    pub offset: u64,
    /// CPP target identifier
    pub id: CppId,
    /// Intra-target address of the first byte
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    handle: AreaHandle,
    owner: Option<OwnerId>,
    mappings: Vec<OwnerId>,
}

impl Area {
    /// Exclusive end of the area's offset range
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Connection that requested the area, if still connected
    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    /// Number of outstanding client mappings
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Backing CPP area handle
    pub fn handle(&self) -> AreaHandle {
        self.handle
    }
}

/// Grants non-overlapping areas and tracks their mappings
///
/// Areas are keyed by offset, so both the gap search and the overlap check
/// are ordered walks over the map.
#[derive(Debug)]
pub struct AreaAllocator {
    areas: BTreeMap<u64, Area>,
    page_size: u64,
}

impl AreaAllocator {
    /// Create an allocator granting areas in multiples of `page_size`
    pub fn new(page_size: u64) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(ProxyError::invalid_parameter(
                "page_size",
                format!("Page size {} is not a power of two", page_size),
            ));
        }
        Ok(Self {
            areas: BTreeMap::new(),
            page_size,
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of live areas
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Area starting exactly at `offset`
    pub fn get(&self, offset: u64) -> Option<&Area> {
        self.areas.get(&offset)
    }

    /// Live areas in increasing offset order
    pub fn iter(&self) -> impl Iterator<Item = &Area> {
        self.areas.values()
    }

    fn is_aligned(&self, value: u64) -> bool {
        value & (self.page_size - 1) == 0
    }

    /// First gap of at least `size` bytes, scanning from offset 0
    pub fn find_gap(&self, size: u64) -> Option<u64> {
        let mut cursor = 0u64;
        for area in self.areas.values() {
            if area.offset - cursor >= size {
                return Some(cursor);
            }
            cursor = area.end();
        }
        // AREA_AUTO itself must never become a granted offset
        match cursor.checked_add(size) {
            Some(end) if end <= AREA_AUTO => Some(cursor),
            _ => None,
        }
    }

    /// Fail if `[offset, offset + size)` intersects a live area
    pub fn check_overlap(&self, offset: u64, size: u64) -> Result<()> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= AREA_AUTO)
            .ok_or_else(|| ProxyError::invalid_parameter("offset", "Area end overflows"))?;

        // Only the last area starting before `end` can reach into the range
        if let Some((_, area)) = self.areas.range(..end).next_back() {
            if area.end() > offset {
                return Err(ProxyError::overlap(offset, size, area.offset));
            }
        }
        Ok(())
    }

    /// Grant an area of `size` bytes routed to `[address, address + size)`
    /// of CPP target `id`
    ///
    /// `offset` is either page aligned or [`AREA_AUTO`]. Nothing changes
    /// unless the whole request succeeds.
    pub fn request(
        &mut self,
        windows: &mut WindowManager,
        offset: u64,
        id: CppId,
        address: u64,
        size: u64,
        owner: OwnerId,
    ) -> Result<u64> {
        if size == 0 {
            return Err(ProxyError::invalid_parameter("size", "Area size must be greater than 0"));
        }
        if !self.is_aligned(size) {
            return Err(ProxyError::alignment(size, self.page_size));
        }

        let offset = if offset == AREA_AUTO {
            self.find_gap(size).ok_or_else(|| {
                ProxyError::invalid_parameter("size", "No gap left in the area space")
            })?
        } else {
            if !self.is_aligned(offset) {
                return Err(ProxyError::alignment(offset, self.page_size));
            }
            offset
        };

        self.check_overlap(offset, size)?;

        let handle = windows.area_open(id, address, size)?;
        debug!(
            "area {:#x}+{:#x} -> {:?} {:#x} granted to {}",
            offset, size, id, address, owner
        );
        self.areas.insert(
            offset,
            Area {
                offset,
                id,
                address,
                size,
                handle,
                owner: Some(owner),
                mappings: Vec::new(),
            },
        );
        Ok(offset)
    }

    /// Release the area starting exactly at `offset`
    pub fn release(&mut self, windows: &mut WindowManager, offset: u64) -> Result<()> {
        let area = self
            .areas
            .get(&offset)
            .ok_or_else(|| ProxyError::not_found(format!("area at {:#x}", offset)))?;
        if !area.mappings.is_empty() {
            return Err(ProxyError::busy(format!(
                "area at {:#x} has {} mappings",
                offset,
                area.mappings.len()
            )));
        }

        windows.area_close(area.handle)?;
        self.areas.remove(&offset);
        debug!("area {:#x} released", offset);
        Ok(())
    }

    /// Route the area at `offset` through a window on behalf of `owner`
    pub fn map(
        &mut self,
        windows: &mut WindowManager,
        offset: u64,
        owner: OwnerId,
    ) -> Result<AcquiredWindow> {
        let area = self
            .areas
            .get_mut(&offset)
            .ok_or_else(|| ProxyError::not_found(format!("area at {:#x}", offset)))?;
        let acquired = windows.area_acquire(area.handle)?;
        area.mappings.push(owner);
        Ok(acquired)
    }

    /// Drop one mapping of the area at `offset` held by `owner`
    pub fn unmap(&mut self, windows: &mut WindowManager, offset: u64, owner: OwnerId) -> Result<()> {
        let area = self
            .areas
            .get_mut(&offset)
            .ok_or_else(|| ProxyError::not_found(format!("area at {:#x}", offset)))?;
        let position = area
            .mappings
            .iter()
            .position(|mapper| *mapper == owner)
            .ok_or_else(|| ProxyError::not_found(format!("mapping of {:#x} by {}", offset, owner)))?;

        windows.area_release(area.handle)?;
        area.mappings.remove(position);
        Ok(())
    }

    /// Drop every mapping held by `owner`, then release the areas it owns
    ///
    /// Areas still mapped by other connections survive without an owner.
    /// Returns the number of areas released.
    pub fn release_owner(&mut self, windows: &mut WindowManager, owner: OwnerId) -> usize {
        for area in self.areas.values_mut() {
            while let Some(position) = area.mappings.iter().position(|m| *m == owner) {
                if let Err(e) = windows.area_release(area.handle) {
                    warn!("area {:#x}: dropping mapping failed: {}", area.offset, e);
                }
                area.mappings.remove(position);
            }
        }

        let owned: Vec<u64> = self
            .areas
            .values()
            .filter(|area| area.owner == Some(owner))
            .map(|area| area.offset)
            .collect();

        let mut released = 0;
        for offset in owned {
            match self.release(windows, offset) {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!("area {:#x} outlives connection {}: {}", offset, owner, e);
                    if let Some(area) = self.areas.get_mut(&offset) {
                        area.owner = None;
                    }
                }
            }
        }
        released
    }
}
