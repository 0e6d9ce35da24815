//! Hardware handle over an already-discovered PCI function
//!
//! Maps the 64-bit memory BARs of `/sys/bus/pci/devices/<bdf>` through their
//! `resourceN` files. Accesses go through volatile loads and stores so the
//! compiler never merges or elides device transactions.

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use log::{debug, info};
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{ProxyError, Result};

use super::{DeviceIdentity, Hardware, MemoryResource, Span};

/// Root of the PCI device tree in sysfs
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// BARs used as expansion resources, in resource index order
const EXPANSION_BARS: [usize; 3] = [0, 2, 4];

/// PCI express extended capability ID of the device serial number
const PCI_EXT_CAP_ID_DSN: u32 = 0x0003;

/// CPP interface type of a PCIe host link
const INTERFACE_TYPE_PCI: u16 = 0x1;

#[derive(Debug)]
struct MappedBar {
    map: MmapRaw,
    span: Span,
}

/// PCI device opened through sysfs
#[derive(Debug)]
pub struct SysfsDevice {
    path: PathBuf,
    resources: Vec<MemoryResource>,
    bars: Vec<Option<MappedBar>>,
    identity: DeviceIdentity,
}

impl SysfsDevice {
    /// Open the device with PCI address `bdf` (e.g. `0000:04:00.0`)
    pub fn open(bdf: &str) -> Result<Self> {
        Self::open_at(Path::new(SYSFS_PCI_DEVICES).join(bdf))
    }

    /// Open a device directory directly
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = fs::read_to_string(path.join("resource"))
            .map_err(|e| ProxyError::from_io(e, "Failed to read PCI resource table"))?;
        let table = parse_resource_table(&table)?;

        let mut resources = Vec::with_capacity(EXPANSION_BARS.len());
        let mut bars = Vec::with_capacity(EXPANSION_BARS.len());

        for (index, bar) in EXPANSION_BARS.iter().enumerate() {
            let (start, len) = table.get(*bar).copied().unwrap_or((0, 0));
            if start == 0 || len == 0 {
                debug!("{}: BAR{} not assigned", path.display(), bar);
                resources.push(MemoryResource {
                    index,
                    phys_base: 0,
                    len: 0,
                });
                bars.push(None);
                continue;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path.join(format!("resource{}", bar)))
                .map_err(|e| ProxyError::from_io(e, "Failed to open PCI resource"))?;
            let map = MmapOptions::new()
                .len(len as usize)
                .map_raw(&file)
                .map_err(|e| ProxyError::from_io(e, "Failed to map PCI resource"))?;

            resources.push(MemoryResource {
                index,
                phys_base: start,
                len,
            });
            bars.push(Some(MappedBar {
                map,
                span: Span::new(0, len),
            }));
        }

        let identity = read_identity(&path)?;
        info!(
            "opened {}: model {:#010x}, {} resources",
            path.display(),
            identity.model,
            resources.iter().filter(|r| r.is_wired()).count()
        );

        Ok(Self {
            path,
            resources,
            bars,
            identity,
        })
    }

    /// Sysfs directory of the device
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bar(&self, resource: usize, offset: u64, len: usize) -> Result<(*mut u8, usize)> {
        let bar = self
            .bars
            .get(resource)
            .and_then(Option::as_ref)
            .ok_or_else(|| ProxyError::hardware(format!("resource {} not mapped", resource)))?;
        let (start, _) = bar
            .span
            .checked_range(offset, len as u64)
            .map_err(|e| ProxyError::hardware(e.to_string()))?;
        Ok((bar.map.as_mut_ptr(), start as usize))
    }
}

impl Hardware for SysfsDevice {
    fn resources(&self) -> Vec<MemoryResource> {
        self.resources.clone()
    }

    fn read(&self, resource: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (base, start) = self.bar(resource, offset, buf.len())?;
        // SAFETY: the range was bounds-checked against the mapping above
        unsafe {
            if start % 4 == 0 && buf.len() % 4 == 0 {
                for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
                    let word = std::ptr::read_volatile(base.add(start + i * 4) as *const u32);
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
            } else {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = std::ptr::read_volatile(base.add(start + i));
                }
            }
        }
        Ok(())
    }

    fn write(&mut self, resource: usize, offset: u64, data: &[u8]) -> Result<()> {
        let (base, start) = self.bar(resource, offset, data.len())?;
        // SAFETY: the range was bounds-checked against the mapping above
        unsafe {
            if start % 4 == 0 && data.len() % 4 == 0 {
                for (i, chunk) in data.chunks_exact(4).enumerate() {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    std::ptr::write_volatile(base.add(start + i * 4) as *mut u32, word);
                }
            } else {
                for (i, byte) in data.iter().enumerate() {
                    std::ptr::write_volatile(base.add(start + i), *byte);
                }
            }
        }
        Ok(())
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity
    }
}

/// Parse the sysfs `resource` table into `(start, len)` per BAR
fn parse_resource_table(table: &str) -> Result<Vec<(u64, u64)>> {
    table
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<u64> = line
                .split_whitespace()
                .map(|field| u64::from_str_radix(field.trim_start_matches("0x"), 16))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ProxyError::platform(format!("bad resource line {:?}: {}", line, e)))?;
            match fields.as_slice() {
                [start, end, _flags] if *end > *start => Ok((*start, end - start + 1)),
                [_, _, _] => Ok((0, 0)),
                _ => Err(ProxyError::platform(format!("bad resource line {:?}", line))),
            }
        })
        .collect()
}

fn read_hex_file(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path)
        .map_err(|e| ProxyError::from_io(e, &format!("Failed to read {}", path.display())))?;
    u64::from_str_radix(text.trim().trim_start_matches("0x"), 16)
        .map_err(|e| ProxyError::platform(format!("{}: {}", path.display(), e)))
}

/// Model from the PCI device ID, interface from the function number and
/// serial from the PCIe device serial number capability
fn read_identity(path: &Path) -> Result<DeviceIdentity> {
    let device = read_hex_file(&path.join("device"))? as u32;
    let vendor = read_hex_file(&path.join("vendor"))? as u32;

    let function = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rsplit('.').next())
        .and_then(|func| func.parse::<u16>().ok())
        .unwrap_or(0);

    let serial = match fs::read(path.join("config")) {
        Ok(config) => find_serial(&config).unwrap_or_default(),
        Err(_) => [0u8; 6],
    };

    Ok(DeviceIdentity {
        model: (vendor << 16) | device,
        interface: (INTERFACE_TYPE_PCI << 12) | (function & 0xff),
        serial,
    })
}

/// Walk the extended capability list for the device serial number
fn find_serial(config: &[u8]) -> Option<[u8; 6]> {
    let dword = |at: usize| -> Option<u32> {
        config
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    let mut at = 0x100;
    for _ in 0..64 {
        let header = dword(at)?;
        if header == 0 || header == u32::MAX {
            return None;
        }
        if header & 0xffff == PCI_EXT_CAP_ID_DSN {
            let dsn = (u64::from(dword(at + 8)?) << 32) | u64::from(dword(at + 4)?);
            let bytes = (dsn >> 16).to_be_bytes();
            let mut serial = [0u8; 6];
            serial.copy_from_slice(&bytes[2..]);
            return Some(serial);
        }
        at = (header >> 20) as usize;
        if at < 0x100 {
            return None;
        }
    }
    None
}
