//! Wire protocol
//!
//! Every field is an 8-byte little-endian word. A command is an opcode word
//! followed by fixed operands:
//!
//! ```text
//! READ   : opcode=1 | count | offset                     -> status | payload
//! WRITE  : opcode=2 | count | offset | payload[count]    -> status
//! IOCTL  : opcode=3 | request | body[size(request)]      -> status | reply
//! ```
//!
//! Ioctl request codes use the Linux `_IOC` layout, so the body length of
//! any request - known or not - can be read from the code itself.

pub mod client;
pub mod dispatch;
pub mod frame;
pub mod structs;

pub use client::ProxyClient;
pub use dispatch::dispatch;
pub use frame::{Command, IoctlRequest};
pub use structs::{AreaRequest, ExplicitRequest, Identification};

/// Size of one protocol word
pub const WORD: usize = 8;

pub const OP_READ: u64 = 1;
pub const OP_WRITE: u64 = 2;
pub const OP_IOCTL: u64 = 3;

/// Largest ioctl body the proxy will buffer
pub const MAX_IOCTL_SIZE: usize = 1024;

const IOC_NRBITS: u64 = 8;
const IOC_TYPEBITS: u64 = 8;
const IOC_SIZEBITS: u64 = 14;
const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u64 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u64 = IOC_SIZESHIFT + IOC_SIZEBITS;

pub const IOC_WRITE: u64 = 1;
pub const IOC_READ: u64 = 2;

/// Ioctl type byte of the CPP device
pub const IOCTL_TYPE: u64 = b'n' as u64;

/// Build a request code
pub const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << IOC_DIRSHIFT) | (size << IOC_SIZESHIFT) | (IOCTL_TYPE << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

/// Body length encoded in a request code
pub const fn ioc_size(code: u64) -> usize {
    ((code >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize
}

pub const IOCTL_AREA_REQUEST: u64 = ioc(IOC_READ | IOC_WRITE, 0x81, AreaRequest::SIZE as u64);
pub const IOCTL_AREA_RELEASE: u64 = ioc(IOC_WRITE, 0x82, AreaRequest::SIZE as u64);
pub const IOCTL_EXPLICIT: u64 = ioc(IOC_WRITE, 0x83, ExplicitRequest::SIZE as u64);
pub const IOCTL_AREA_MAP: u64 = ioc(IOC_READ | IOC_WRITE, 0x84, AreaRequest::SIZE as u64);
pub const IOCTL_AREA_UNMAP: u64 = ioc(IOC_WRITE, 0x85, AreaRequest::SIZE as u64);
pub const IOCTL_IDENTIFICATION: u64 = ioc(IOC_READ | IOC_WRITE, 0x8f, Identification::SIZE as u64);

/// Append one word
pub fn put_word(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a signed status word
pub fn put_status(out: &mut Vec<u8>, status: i64) {
    out.extend_from_slice(&status.to_le_bytes());
}

/// Word at index `n` of `buf`; caller guarantees the length
pub(crate) fn word_at(buf: &[u8], n: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&buf[n * WORD..(n + 1) * WORD]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codes_carry_size() {
        assert_eq!(ioc_size(IOCTL_AREA_REQUEST), AreaRequest::SIZE);
        assert_eq!(ioc_size(IOCTL_EXPLICIT), ExplicitRequest::SIZE);
        assert_eq!(ioc_size(IOCTL_IDENTIFICATION), Identification::SIZE);
        assert_ne!(IOCTL_AREA_REQUEST, IOCTL_AREA_MAP);
    }

    #[test]
    fn test_words() {
        let mut out = Vec::new();
        put_word(&mut out, 0x0102);
        put_status(&mut out, -5);
        assert_eq!(word_at(&out, 0), 0x0102);
        assert_eq!(word_at(&out, 1) as i64, -5);
    }
}
