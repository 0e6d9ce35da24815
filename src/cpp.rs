//! CPP bus addressing
//!
//! A CPP identifier packs target, token, action and island into 32 bits:
//!
//! ```text
//!  31      24 23     16 15      8 7       0
//! +----------+---------+---------+---------+
//! |  target  |  token  | action  | island  |
//! +----------+---------+---------+---------+
//! ```
//!
//! Intra-target addresses are 40 bits wide. READ/WRITE offsets carry the
//! upper 24 bits of the identifier above the address.

use std::fmt;

/// Width of an intra-target CPP address
pub const CPP_ADDRESS_BITS: u32 = 40;

/// Mask of the intra-target address bits
pub const CPP_ADDRESS_MASK: u64 = (1 << CPP_ADDRESS_BITS) - 1;

/// Hardware bursts never cross a multiple of this boundary
pub const MEMIO_BOUNDARY: u64 = 1 << 20;

/// Action selecting plain read or write by direction
pub const ACTION_RW: u8 = 32;

/// Well-known CPP targets
pub mod target {
    pub const NBI: u8 = 1;
    pub const QDR: u8 = 2;
    pub const ILA: u8 = 6;
    pub const MU: u8 = 7;
    pub const PCIE: u8 = 9;
    pub const ARM: u8 = 10;
    pub const CRYPTO: u8 = 12;
    pub const CT_XPB: u8 = 14;
    pub const CLS: u8 = 15;
}

/// Packed CPP identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CppId(u32);

impl CppId {
    /// Build an identifier from its parts (island 0)
    pub const fn new(target: u8, action: u8, token: u8) -> Self {
        Self(((target as u32 & 0x7f) << 24) | ((token as u32) << 16) | ((action as u32) << 8))
    }

    /// Build an identifier with an explicit island
    pub const fn with_island(target: u8, action: u8, token: u8, island: u8) -> Self {
        Self(Self::new(target, action, token).0 | island as u32)
    }

    /// Wrap a raw identifier word
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw identifier word
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn target(self) -> u8 {
        ((self.0 >> 24) & 0x7f) as u8
    }

    pub const fn token(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub const fn action(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub const fn island(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Whether the action is a plain read/write that bulk windows can route
    pub const fn is_bulk_action(self) -> bool {
        matches!(self.action(), 0 | 1 | ACTION_RW)
    }
}

impl fmt::Debug for CppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CppId({}:{}:{}@{})",
            self.target(),
            self.action(),
            self.token(),
            self.island()
        )
    }
}

impl fmt::Display for CppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Split a READ/WRITE file offset into CPP identifier and address
pub fn decode_offset(offset: u64) -> (CppId, u64) {
    let id = ((offset >> CPP_ADDRESS_BITS) << 8) as u32;
    (CppId::from_raw(id), offset & CPP_ADDRESS_MASK)
}

/// Inverse of [`decode_offset`]; the island byte is not representable
pub fn encode_offset(id: CppId, address: u64) -> u64 {
    (u64::from(id.raw() >> 8) << CPP_ADDRESS_BITS) | (address & CPP_ADDRESS_MASK)
}

/// Length of the next chunk starting at `address` with `remaining` bytes
/// left, clamped so it does not cross a `boundary` multiple
pub fn chunk_len(address: u64, remaining: u64, boundary: u64) -> u64 {
    debug_assert!(boundary.is_power_of_two());
    if remaining == 0 {
        return 0;
    }
    let mask = !(boundary - 1);
    let last = address.wrapping_add(remaining - 1);
    if last & mask != address & mask {
        boundary - (address & (boundary - 1))
    } else {
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpp_id_fields() {
        let id = CppId::with_island(target::MU, ACTION_RW, 2, 24);
        assert_eq!(id.target(), target::MU);
        assert_eq!(id.action(), ACTION_RW);
        assert_eq!(id.token(), 2);
        assert_eq!(id.island(), 24);
        assert!(id.is_bulk_action());
        assert!(!CppId::new(target::MU, 5, 0).is_bulk_action());
    }

    #[test]
    fn test_offset_decoding() {
        let id = CppId::new(target::CLS, 1, 3);
        let offset = encode_offset(id, 0x12_3456_7890);
        let (decoded, address) = decode_offset(offset);
        assert_eq!(decoded, id);
        assert_eq!(address, 0x12_3456_7890);
    }

    #[test]
    fn test_chunk_len_within_boundary() {
        assert_eq!(chunk_len(0, 4096, MEMIO_BOUNDARY), 4096);
        assert_eq!(chunk_len(0, MEMIO_BOUNDARY, MEMIO_BOUNDARY), MEMIO_BOUNDARY);
    }

    #[test]
    fn test_chunk_len_crossing_boundary() {
        let start = MEMIO_BOUNDARY - 16;
        assert_eq!(chunk_len(start, 64, MEMIO_BOUNDARY), 16);
        assert_eq!(chunk_len(MEMIO_BOUNDARY, 64, MEMIO_BOUNDARY), 64);
        assert_eq!(chunk_len(0, 0, MEMIO_BOUNDARY), 0);
    }
}
