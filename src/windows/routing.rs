//! Expansion window routing configuration word
//!
//! ```text
//!  31  29 28 27 26   23 22 21 20    16 15              0
//! +------+-----+-------+-----+--------+-----------------+
//! | map  | len |target |token| action |  base address   |
//! +------+-----+-------+-----+--------+-----------------+
//! ```
//!
//! The action field is only meaningful for the target map type; the base
//! address field holds `address >> size_class`.

use crate::cpp::{target, CppId};

const MAP_TYPE_SHIFT: u32 = 29;
const LENGTH_SHIFT: u32 = 27;
const TARGET_SHIFT: u32 = 23;
const TOKEN_SHIFT: u32 = 21;
const ACTION_SHIFT: u32 = 16;

/// Largest value the base address field can hold
pub const BASE_FIELD_MAX: u64 = 0xffff;

/// How a window maps host accesses onto the CPP bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    /// Read/write routed to a fixed target and token
    Bulk,
    /// Fixed target, token and action
    Target,
    /// Dedicated explicit-transaction window for group 0..3
    Explicit(u8),
}

impl MapType {
    fn code(self) -> u32 {
        match self {
            MapType::Bulk => 0,
            MapType::Target => 1,
            MapType::Explicit(group) => 4 + u32::from(group & 3),
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MapType::Bulk),
            1 => Some(MapType::Target),
            4..=7 => Some(MapType::Explicit((code - 4) as u8)),
            _ => None,
        }
    }
}

/// Width of the bus accesses issued through a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthSelect {
    Bits32,
    Bits64,
}

impl LengthSelect {
    fn code(self) -> u32 {
        match self {
            LengthSelect::Bits32 => 0,
            LengthSelect::Bits64 => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(LengthSelect::Bits32),
            1 => Some(LengthSelect::Bits64),
            _ => None,
        }
    }
}

/// Decoded routing configuration of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingConfig {
    pub map_type: MapType,
    pub length: LengthSelect,
    pub target: u8,
    pub token: u8,
    pub action: u8,
    pub base: u16,
}

impl RoutingConfig {
    /// Fixed routing code of explicit group `group`
    pub fn explicit(group: u8) -> Self {
        Self {
            map_type: MapType::Explicit(group),
            length: LengthSelect::Bits32,
            target: 0,
            token: 0,
            action: 0,
            base: 0,
        }
    }

    /// Routing that makes a window of `size_class` bits cover `address`
    /// for the CPP identifier `id`, or `None` if the fields cannot express it
    pub fn for_address(id: CppId, address: u64, size_class: u32) -> Option<Self> {
        let base = address >> size_class;
        if base > BASE_FIELD_MAX || id.target() > 0xf || id.token() > 0x3 {
            return None;
        }

        let (map_type, action) = if id.is_bulk_action() {
            (MapType::Bulk, 0)
        } else if id.action() <= 0x1f {
            (MapType::Target, id.action())
        } else {
            return None;
        };

        let length = match id.target() {
            target::MU | target::CLS => LengthSelect::Bits64,
            _ => LengthSelect::Bits32,
        };

        Some(Self {
            map_type,
            length,
            target: id.target(),
            token: id.token(),
            action,
            base: base as u16,
        })
    }

    /// Encode into the register word
    pub fn encode(&self) -> u32 {
        let mut word = (self.map_type.code() << MAP_TYPE_SHIFT)
            | (self.length.code() << LENGTH_SHIFT)
            | (u32::from(self.target & 0xf) << TARGET_SHIFT)
            | (u32::from(self.token & 0x3) << TOKEN_SHIFT)
            | u32::from(self.base);
        if self.map_type == MapType::Target {
            word |= u32::from(self.action & 0x1f) << ACTION_SHIFT;
        }
        word
    }

    /// Decode a register word
    pub fn decode(word: u32) -> Option<Self> {
        let map_type = MapType::from_code(word >> MAP_TYPE_SHIFT)?;
        let length = LengthSelect::from_code((word >> LENGTH_SHIFT) & 0x3)?;
        let action = match map_type {
            MapType::Target => ((word >> ACTION_SHIFT) & 0x1f) as u8,
            _ => 0,
        };
        Some(Self {
            map_type,
            length,
            target: ((word >> TARGET_SHIFT) & 0xf) as u8,
            token: ((word >> TOKEN_SHIFT) & 0x3) as u8,
            action,
            base: (word & 0xffff) as u16,
        })
    }

    /// CPP address reached at `window_offset` through a window of
    /// `size_class` bits programmed with this configuration
    pub fn cpp_address(&self, window_offset: u64, size_class: u32) -> u64 {
        (u64::from(self.base) << size_class) | window_offset
    }
}
