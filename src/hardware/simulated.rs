//! In-memory device model
//!
//! Models the expansion-window routing of a real device: accesses to the
//! control window hit the configuration registers, accesses to any other
//! window are routed by its configuration word onto a sparse CPP memory.
//! Unwritten memory reads as zero.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::{
    error::{ProxyError, Result},
    windows::{size_class, MapType, RoutingConfig, EXPANSION_CFG_BASE, SLOTS_PER_RESOURCE},
};

use super::{DeviceIdentity, Hardware, MemoryResource};

/// Physical address assigned to the first simulated resource
pub const DEFAULT_PHYS_BASE: u64 = 0xd000_0000;

const PAGE_SIZE: u64 = 4096;

/// Register space reserved for window configuration words
const CFG_REGION_LEN: u64 = 4 * 256;

#[derive(Debug, Clone)]
struct Fault {
    target: u8,
    range: Range<u64>,
}

enum Route {
    Control(u64),
    Cpp { target: u8, token: u8, address: u64 },
}

/// Simulated device with NFP-style expansion windows
#[derive(Debug)]
pub struct SimulatedDevice {
    resources: Vec<MemoryResource>,
    config: HashMap<usize, u32>,
    registers: BTreeMap<u64, u8>,
    memory: HashMap<(u8, u8, u64), Box<[u8]>>,
    faults: Vec<Fault>,
    identity: DeviceIdentity,
    config_writes: u64,
}

impl SimulatedDevice {
    /// Create a device with one resource per entry of `lens`; a zero
    /// length leaves that resource unwired
    pub fn new(lens: &[u64]) -> Self {
        let mut next_base = DEFAULT_PHYS_BASE;
        let resources = lens
            .iter()
            .enumerate()
            .map(|(index, &len)| {
                let phys_base = if len == 0 { 0 } else { next_base };
                next_base += len;
                MemoryResource {
                    index,
                    phys_base,
                    len,
                }
            })
            .collect();

        Self {
            resources,
            config: HashMap::new(),
            registers: BTreeMap::new(),
            memory: HashMap::new(),
            faults: Vec::new(),
            identity: DeviceIdentity {
                model: 0x4001_0010,
                interface: 0x1000,
                serial: [0x00, 0x15, 0x4d, 0x00, 0x00, 0x01],
            },
            config_writes: 0,
        }
    }

    /// Three 64-bit BARs: 8MB, 32MB, 32MB
    pub fn nfp6000() -> Self {
        Self::new(&[8 << 20, 32 << 20, 32 << 20])
    }

    /// Mark a resource as not wired
    pub fn with_unwired(mut self, index: usize) -> Self {
        if let Some(resource) = self.resources.get_mut(index) {
            resource.phys_base = 0;
        }
        self
    }

    /// Make every access to `range` of `target` fail
    pub fn with_fault(mut self, target: u8, range: Range<u64>) -> Self {
        self.faults.push(Fault { target, range });
        self
    }

    /// Replace the identification data
    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Seed CPP memory of `(target, token)` at `address`
    pub fn with_memory(mut self, target: u8, token: u8, address: u64, data: &[u8]) -> Self {
        self.store(target, token, address, data);
        self
    }

    /// Raw configuration word of window `index`, if it was ever written
    pub fn window_config(&self, index: usize) -> Option<u32> {
        self.config.get(&index).copied()
    }

    /// Number of configuration register writes seen
    pub fn config_writes(&self) -> u64 {
        self.config_writes
    }

    /// Read CPP memory directly, bypassing the windows
    pub fn peek(&self, target: u8, token: u8, address: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.load(target, token, address, &mut out);
        out
    }

    /// Resource and slot of the control window: the smallest window,
    /// lowest expansion index on ties
    fn control_slot(&self) -> Option<(usize, u64)> {
        self.resources
            .iter()
            .filter(|r| r.is_wired() && r.len / SLOTS_PER_RESOURCE as u64 > 0)
            .min_by_key(|r| (size_class(r.len / SLOTS_PER_RESOURCE as u64), r.index))
            .map(|r| (r.index, 0))
    }

    fn route(&self, resource: usize, offset: u64, len: u64) -> Result<Route> {
        let res = self
            .resources
            .get(resource)
            .filter(|r| r.is_wired())
            .ok_or_else(|| ProxyError::hardware(format!("resource {} not mapped", resource)))?;

        let end = offset.checked_add(len).filter(|end| *end <= res.len);
        if end.is_none() {
            return Err(ProxyError::hardware(format!(
                "access [{:#x}, +{:#x}) outside resource {}",
                offset, len, resource
            )));
        }

        let window_len = res.len / SLOTS_PER_RESOURCE as u64;
        let slot = offset / window_len;
        let window_offset = offset % window_len;
        if window_offset + len > window_len {
            return Err(ProxyError::hardware("access straddles two windows"));
        }

        if self.control_slot() == Some((resource, slot)) {
            return Ok(Route::Control(window_offset));
        }

        let index = resource * SLOTS_PER_RESOURCE + slot as usize;
        let routing = self
            .config
            .get(&index)
            .and_then(|word| RoutingConfig::decode(*word))
            .ok_or_else(|| ProxyError::hardware(format!("window {} not programmed", index)))?;

        if let MapType::Explicit(group) = routing.map_type {
            return Err(ProxyError::hardware(format!(
                "window {} is reserved for explicit group {}",
                index, group
            )));
        }

        let address = routing.cpp_address(window_offset, size_class(window_len));
        let hit = self.faults.iter().any(|f| {
            f.target == routing.target && f.range.start < address + len && address < f.range.end
        });
        if hit {
            return Err(ProxyError::hardware(format!(
                "bus error at target {} address {:#x}",
                routing.target, address
            )));
        }

        Ok(Route::Cpp {
            target: routing.target,
            token: routing.token,
            address,
        })
    }

    fn control_read(&self, offset: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = offset + i as u64;
            *byte = if (EXPANSION_CFG_BASE..EXPANSION_CFG_BASE + CFG_REGION_LEN).contains(&at) {
                let rel = at - EXPANSION_CFG_BASE;
                let word = self.config.get(&((rel / 4) as usize)).copied().unwrap_or(0);
                word.to_le_bytes()[(rel % 4) as usize]
            } else {
                self.registers.get(&at).copied().unwrap_or(0)
            };
        }
    }

    fn control_write(&mut self, offset: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let at = offset + i as u64;
            if (EXPANSION_CFG_BASE..EXPANSION_CFG_BASE + CFG_REGION_LEN).contains(&at) {
                let rel = at - EXPANSION_CFG_BASE;
                let word = self.config.entry((rel / 4) as usize).or_insert(0);
                let mut bytes = word.to_le_bytes();
                bytes[(rel % 4) as usize] = *byte;
                *word = u32::from_le_bytes(bytes);
                if rel % 4 == 3 {
                    self.config_writes += 1;
                }
            } else {
                self.registers.insert(at, *byte);
            }
        }
    }

    fn load(&self, target: u8, token: u8, address: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = address + i as u64;
            *byte = self
                .memory
                .get(&(target, token, at / PAGE_SIZE))
                .map_or(0, |page| page[(at % PAGE_SIZE) as usize]);
        }
    }

    fn store(&mut self, target: u8, token: u8, address: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let at = address + i as u64;
            let page = self
                .memory
                .entry((target, token, at / PAGE_SIZE))
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[(at % PAGE_SIZE) as usize] = *byte;
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::nfp6000()
    }
}

impl Hardware for SimulatedDevice {
    fn resources(&self) -> Vec<MemoryResource> {
        self.resources.clone()
    }

    fn read(&self, resource: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.route(resource, offset, buf.len() as u64)? {
            Route::Control(at) => self.control_read(at, buf),
            Route::Cpp {
                target,
                token,
                address,
            } => self.load(target, token, address, buf),
        }
        Ok(())
    }

    fn write(&mut self, resource: usize, offset: u64, data: &[u8]) -> Result<()> {
        match self.route(resource, offset, data.len() as u64)? {
            Route::Control(at) => self.control_write(at, data),
            Route::Cpp {
                target,
                token,
                address,
            } => self.store(target, token, address, data),
        }
        Ok(())
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpp::{target, CppId, ACTION_RW};

    #[test]
    fn test_layout() {
        let device = SimulatedDevice::nfp6000().with_unwired(2);
        let resources = device.resources();
        assert_eq!(resources.len(), 3);
        assert_eq!(resources[0].phys_base, DEFAULT_PHYS_BASE);
        assert!(resources[1].is_wired());
        assert!(!resources[2].is_wired());
        assert_eq!(device.control_slot(), Some((0, 0)));
    }

    #[test]
    fn test_unprogrammed_window_faults() {
        let device = SimulatedDevice::nfp6000();
        let mut buf = [0u8; 4];
        assert!(device.read(1, 0, &mut buf).is_err());
    }

    #[test]
    fn test_routed_access() {
        let mut device = SimulatedDevice::nfp6000().with_memory(target::MU, 0, 0x40, b"abcd");
        let routing = RoutingConfig::for_address(CppId::new(target::MU, ACTION_RW, 0), 0, 22).unwrap();
        // Window 8 is resource 1 slot 0 (4MB, size class 22)
        device
            .write_u32(0, EXPANSION_CFG_BASE + 4 * 8, routing.encode())
            .unwrap();
        assert_eq!(device.window_config(8), Some(routing.encode()));

        let mut buf = [0u8; 4];
        device.read(1, 0x40, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        device.write(1, 0x44, b"efgh").unwrap();
        assert_eq!(device.peek(target::MU, 0, 0x40, 8), b"abcdefgh".to_vec());
    }

    #[test]
    fn test_fault_injection() {
        let mut device = SimulatedDevice::nfp6000().with_fault(target::MU, 0x100..0x200);
        let routing = RoutingConfig::for_address(CppId::new(target::MU, ACTION_RW, 0), 0, 22).unwrap();
        device
            .write_u32(0, EXPANSION_CFG_BASE + 4 * 8, routing.encode())
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(device.read(1, 0xf8, &mut buf).is_err());
        assert!(device.read(1, 0x200, &mut buf).is_ok());
    }
}
