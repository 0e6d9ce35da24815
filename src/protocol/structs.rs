//! Ioctl request structures

use crate::{
    areas::AREA_AUTO,
    cpp::CppId,
    error::{ProxyError, Result},
    hardware::DeviceIdentity,
};

use super::{put_word, word_at, WORD};

/// Area request: used by area-request, area-release, area-map, area-unmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaRequest {
    /// Page-aligned offset, or [`AREA_AUTO`]
    pub offset: u64,
    pub cpp_id: CppId,
    pub address: u64,
    pub size: u64,
}

impl AreaRequest {
    pub const SIZE: usize = 4 * WORD;

    /// Request an area at the first free offset
    pub fn auto(cpp_id: CppId, address: u64, size: u64) -> Self {
        Self::at(AREA_AUTO, cpp_id, address, size)
    }

    /// Request an area at an explicit offset
    pub fn at(offset: u64, cpp_id: CppId, address: u64, size: u64) -> Self {
        Self {
            offset,
            cpp_id,
            address,
            size,
        }
    }

    /// Refer to an existing area by offset
    pub fn for_offset(offset: u64) -> Self {
        Self::at(offset, CppId::default(), 0, 0)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        check_len("area request", body, Self::SIZE)?;
        let cpp_id = word_at(body, 1);
        if cpp_id > u64::from(u32::MAX) {
            return Err(ProxyError::invalid_parameter(
                "cpp_id",
                format!("{:#x} wider than 32 bits", cpp_id),
            ));
        }
        Ok(Self {
            offset: word_at(body, 0),
            cpp_id: CppId::from_raw(cpp_id as u32),
            address: word_at(body, 2),
            size: word_at(body, 3),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_word(out, self.offset);
        put_word(out, u64::from(self.cpp_id.raw()));
        put_word(out, self.address);
        put_word(out, self.size);
    }
}

/// Identification query; an extensible structure whose `size` field tells
/// how many bytes the caller understands and, in the reply, how many the
/// server populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identification {
    pub size: u64,
    pub model: u64,
    pub interface: u64,
    pub serial_low: u64,
    pub serial_high: u64,
}

impl Identification {
    pub const SIZE: usize = 5 * WORD;

    /// Query understanding the first `size` bytes
    pub fn query(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        check_len("identification", body, Self::SIZE)?;
        Ok(Self {
            size: word_at(body, 0),
            model: word_at(body, 1),
            interface: word_at(body, 2),
            serial_low: word_at(body, 3),
            serial_high: word_at(body, 4),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_word(out, self.size);
        put_word(out, self.model);
        put_word(out, self.interface);
        put_word(out, self.serial_low);
        put_word(out, self.serial_high);
    }

    /// Fill in the fields covered by the caller's `size`; returns the
    /// number of bytes populated, which is also stored in `size`
    pub fn fill(&mut self, identity: &DeviceIdentity) -> Result<u64> {
        if self.size < WORD as u64 {
            return Err(ProxyError::invalid_parameter(
                "size",
                format!("identification size {} below {}", self.size, WORD),
            ));
        }
        let fields = (self.size.min(Self::SIZE as u64) / WORD as u64) as usize;
        let values = [
            u64::from(identity.model),
            u64::from(identity.interface),
            u64::from(identity.serial_low()),
            u64::from(identity.serial_high()),
        ];
        let slots = [
            &mut self.model,
            &mut self.interface,
            &mut self.serial_low,
            &mut self.serial_high,
        ];
        for (slot, value) in slots.into_iter().zip(values).take(fields - 1) {
            *slot = value;
        }
        self.size = (fields * WORD) as u64;
        Ok(self.size)
    }
}

/// Explicit transaction request; accepted on the wire, never executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExplicitRequest {
    pub cpp_id: u64,
    pub address: u64,
    pub in_len: u64,
    pub out_len: u64,
    pub data: [u64; 8],
}

impl ExplicitRequest {
    pub const SIZE: usize = 12 * WORD;

    pub fn decode(body: &[u8]) -> Result<Self> {
        check_len("explicit request", body, Self::SIZE)?;
        let mut data = [0u64; 8];
        for (i, word) in data.iter_mut().enumerate() {
            *word = word_at(body, 4 + i);
        }
        Ok(Self {
            cpp_id: word_at(body, 0),
            address: word_at(body, 1),
            in_len: word_at(body, 2),
            out_len: word_at(body, 3),
            data,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_word(out, self.cpp_id);
        put_word(out, self.address);
        put_word(out, self.in_len);
        put_word(out, self.out_len);
        for word in self.data {
            put_word(out, word);
        }
    }
}

fn check_len(what: &str, body: &[u8], expected: usize) -> Result<()> {
    if body.len() != expected {
        return Err(ProxyError::protocol(format!(
            "{} body is {} bytes, expected {}",
            what,
            body.len(),
            expected
        )));
    }
    Ok(())
}
