//! Hardware handle interface
//!
//! The proxy core never discovers devices itself. It is handed an opened
//! [`Hardware`] handle that exposes the device's mapped memory resources
//! (PCI BARs) as bounds-checked spans, plus the identification data.

pub mod simulated;
pub mod sysfs;

use std::fmt;

use crate::error::{ProxyError, Result};

pub use simulated::SimulatedDevice;
pub use sysfs::SysfsDevice;

/// Physical description of one mapped memory resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResource {
    /// Position of the resource in the handle's resource list
    pub index: usize,
    /// Host physical base address; zero means the resource is not wired
    pub phys_base: u64,
    /// Length of the resource in bytes
    pub len: u64,
}

impl MemoryResource {
    /// Whether the resource is wired on this board variant
    pub fn is_wired(&self) -> bool {
        self.phys_base != 0 && self.len != 0
    }
}

/// Identification data reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// Chip model identifier
    pub model: u32,
    /// CPP interface identifier of the host link
    pub interface: u16,
    /// 48-bit device serial number
    pub serial: [u8; 6],
}

impl DeviceIdentity {
    /// Low 32 bits of the serial number
    pub fn serial_low(&self) -> u32 {
        u32::from_be_bytes([self.serial[2], self.serial[3], self.serial[4], self.serial[5]])
    }

    /// High 16 bits of the serial number
    pub fn serial_high(&self) -> u16 {
        u16::from_be_bytes([self.serial[0], self.serial[1]])
    }
}

/// Bounds-checked `[start, start + len)` span of a memory resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub len: u64,
}

impl Span {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end of the span
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Translate `[offset, offset + len)` relative to the span into an
    /// absolute range, failing if it leaves the span
    pub fn checked_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok((self.start + offset, self.start + end)),
            _ => Err(ProxyError::invalid_parameter(
                "offset",
                format!(
                    "[{:#x}, +{:#x}) outside span of {:#x} bytes",
                    offset, len, self.len
                ),
            )),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Opened hardware handle
///
/// Offsets passed to `read` and `write` are relative to the start of the
/// resource. Implementations must reject accesses outside the resource.
pub trait Hardware: Send + fmt::Debug {
    /// Memory resources in index order, including unwired ones
    fn resources(&self) -> Vec<MemoryResource>;

    /// Read `buf.len()` bytes from a resource
    fn read(&self, resource: usize, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` into a resource
    fn write(&mut self, resource: usize, offset: u64, data: &[u8]) -> Result<()>;

    /// Model, interface and serial of the device
    fn identity(&self) -> DeviceIdentity;

    /// Read a little-endian 32-bit register
    fn read_u32(&self, resource: usize, offset: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(resource, offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian 32-bit register
    fn write_u32(&mut self, resource: usize, offset: u64, value: u32) -> Result<()> {
        self.write(resource, offset, &value.to_le_bytes())
    }
}
