//! Transfer engine - READ/WRITE through transient areas
//!
//! A transfer is split into chunks that never cross a multiple of the
//! memory-I/O boundary. Each chunk is routed through a freshly opened area
//! and moved in small bursts via a staging buffer; the area is closed again
//! before the next chunk, whether the chunk succeeded or not.

use crate::{
    cpp::{chunk_len, CppId, MEMIO_BOUNDARY},
    error::{ProxyError, Result},
    windows::{AreaHandle, WindowManager},
};

/// Bytes moved per hardware access
pub const BURST_SIZE: usize = 64;

/// A transfer that stopped part-way
#[derive(Debug, thiserror::Error)]
#[error("transfer stopped after {moved} bytes: {source}")]
pub struct TransferError {
    /// Bytes moved before the failure
    pub moved: u64,
    #[source]
    pub source: ProxyError,
}

impl TransferError {
    /// Wire status of the underlying failure
    pub fn status(&self) -> i64 {
        self.source.status()
    }
}

/// Iterator over the `(address, len)` chunks of a transfer
#[derive(Debug, Clone)]
pub struct Chunks {
    address: u64,
    remaining: u64,
    boundary: u64,
}

impl Iterator for Chunks {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = chunk_len(self.address, self.remaining, self.boundary);
        let chunk = (self.address, len);
        self.address = self.address.wrapping_add(len);
        self.remaining -= len;
        Some(chunk)
    }
}

/// Chunks of `count` bytes starting at `address`, split at the memory-I/O
/// boundary
pub fn plan_chunks(address: u64, count: u64) -> Chunks {
    plan_chunks_with(address, count, MEMIO_BOUNDARY)
}

/// Same as [`plan_chunks`] with an explicit power-of-two boundary
pub fn plan_chunks_with(address: u64, count: u64, boundary: u64) -> Chunks {
    Chunks {
        address,
        remaining: count,
        boundary,
    }
}

/// Client side of a transfer
enum ClientBuffer<'a> {
    /// Device to client
    Fill(&'a mut [u8]),
    /// Client to device
    Drain(&'a [u8]),
}

/// State of one in-flight READ or WRITE
struct PendingTransfer<'a> {
    id: CppId,
    client: ClientBuffer<'a>,
    moved: u64,
    staging: [u8; BURST_SIZE],
}

/// Moves bytes between client buffers and CPP targets
#[derive(Debug, Clone, Copy)]
pub struct TransferEngine {
    boundary: u64,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            boundary: MEMIO_BOUNDARY,
        }
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine splitting at a custom power-of-two boundary
    pub fn with_boundary(boundary: u64) -> Result<Self> {
        if boundary < BURST_SIZE as u64 || !boundary.is_power_of_two() {
            return Err(ProxyError::invalid_parameter(
                "boundary",
                format!("{:#x} is not a power of two >= {}", boundary, BURST_SIZE),
            ));
        }
        Ok(Self { boundary })
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    /// Fill `buf` from `[address, address + buf.len())` of target `id`
    pub fn read(
        &self,
        windows: &mut WindowManager,
        id: CppId,
        address: u64,
        buf: &mut [u8],
    ) -> std::result::Result<u64, TransferError> {
        let pending = PendingTransfer {
            id,
            client: ClientBuffer::Fill(buf),
            moved: 0,
            staging: [0u8; BURST_SIZE],
        };
        self.run(windows, address, pending)
    }

    /// Write `data` to `[address, address + data.len())` of target `id`
    pub fn write(
        &self,
        windows: &mut WindowManager,
        id: CppId,
        address: u64,
        data: &[u8],
    ) -> std::result::Result<u64, TransferError> {
        let pending = PendingTransfer {
            id,
            client: ClientBuffer::Drain(data),
            moved: 0,
            staging: [0u8; BURST_SIZE],
        };
        self.run(windows, address, pending)
    }

    fn run(
        &self,
        windows: &mut WindowManager,
        address: u64,
        mut pending: PendingTransfer<'_>,
    ) -> std::result::Result<u64, TransferError> {
        let count = match &pending.client {
            ClientBuffer::Fill(buf) => buf.len(),
            ClientBuffer::Drain(data) => data.len(),
        } as u64;

        for (chunk_address, len) in plan_chunks_with(address, count, self.boundary) {
            if let Err(source) = self.chunk(windows, chunk_address, len, &mut pending) {
                return Err(TransferError {
                    moved: pending.moved,
                    source,
                });
            }
        }
        Ok(pending.moved)
    }

    /// Open, acquire, move, release and close one transient area
    fn chunk(
        &self,
        windows: &mut WindowManager,
        address: u64,
        len: u64,
        pending: &mut PendingTransfer<'_>,
    ) -> Result<()> {
        let handle = windows.area_open(pending.id, address, len)?;
        let result = windows
            .area_acquire(handle)
            .and_then(|_| Self::bursts(windows, handle, len, pending));

        if windows.is_acquired(handle) {
            windows.area_release(handle)?;
        }
        windows.area_close(handle)?;
        result
    }

    fn bursts(
        windows: &mut WindowManager,
        handle: AreaHandle,
        len: u64,
        pending: &mut PendingTransfer<'_>,
    ) -> Result<()> {
        let mut pos = 0u64;
        while pos < len {
            let n = (len - pos).min(BURST_SIZE as u64) as usize;
            let cursor = pending.moved as usize;
            match &mut pending.client {
                ClientBuffer::Fill(buf) => {
                    windows.area_read(handle, pos, &mut pending.staging[..n])?;
                    buf[cursor..cursor + n].copy_from_slice(&pending.staging[..n]);
                }
                ClientBuffer::Drain(data) => {
                    pending.staging[..n].copy_from_slice(&data[cursor..cursor + n]);
                    windows.area_write(handle, pos, &pending.staging[..n])?;
                }
            }
            pending.moved += n as u64;
            pos += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpp::{target, ACTION_RW};
    use crate::hardware::SimulatedDevice;

    #[test]
    fn test_plan_single_chunk() {
        let chunks: Vec<_> = plan_chunks(0x100, 0x200).collect();
        assert_eq!(chunks, vec![(0x100, 0x200)]);
    }

    #[test]
    fn test_plan_splits_at_boundary() {
        let start = MEMIO_BOUNDARY - 0x10;
        let chunks: Vec<_> = plan_chunks(start, 2 * MEMIO_BOUNDARY).collect();
        assert_eq!(
            chunks,
            vec![
                (start, 0x10),
                (MEMIO_BOUNDARY, MEMIO_BOUNDARY),
                (2 * MEMIO_BOUNDARY, MEMIO_BOUNDARY - 0x10),
            ]
        );
    }

    #[test]
    fn test_plan_empty() {
        assert_eq!(plan_chunks(0, 0).count(), 0);
    }

    #[test]
    fn test_invalid_boundary() {
        assert!(TransferEngine::with_boundary(3000).is_err());
        assert!(TransferEngine::with_boundary(16).is_err());
        assert!(TransferEngine::with_boundary(4096).is_ok());
    }

    #[test]
    fn test_unaligned_round_trip() {
        let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
        let engine = TransferEngine::with_boundary(256).unwrap();
        let id = CppId::new(target::MU, ACTION_RW, 0);

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(engine.write(&mut windows, id, 0x7f3, &data).unwrap(), 1000);

        let mut back = vec![0u8; 1000];
        assert_eq!(engine.read(&mut windows, id, 0x7f3, &mut back).unwrap(), 1000);
        assert_eq!(back, data);
        assert_eq!(windows.open_areas(), 0);
    }
}
