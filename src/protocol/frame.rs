//! Command framing
//!
//! A frame's total length is known once its leading words are present, so
//! a command is decoded in one step from the connection's buffer. Partial
//! frames stay buffered until the rest arrives.

use crate::error::{ProxyError, Result};

use super::{
    ioc_size, put_word, word_at,
    structs::{AreaRequest, ExplicitRequest, Identification},
    IOCTL_AREA_MAP, IOCTL_AREA_RELEASE, IOCTL_AREA_REQUEST, IOCTL_AREA_UNMAP, IOCTL_EXPLICIT,
    IOCTL_IDENTIFICATION, MAX_IOCTL_SIZE, OP_IOCTL, OP_READ, OP_WRITE, WORD,
};

/// Ioctl sub-requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlRequest {
    AreaRequest(AreaRequest),
    AreaRelease(AreaRequest),
    AreaMap(AreaRequest),
    AreaUnmap(AreaRequest),
    Explicit(ExplicitRequest),
    Identification(Identification),
    /// Well-formed request code the proxy does not serve
    Unknown { code: u64 },
}

impl IoctlRequest {
    /// Request code on the wire
    pub fn code(&self) -> u64 {
        match self {
            IoctlRequest::AreaRequest(_) => IOCTL_AREA_REQUEST,
            IoctlRequest::AreaRelease(_) => IOCTL_AREA_RELEASE,
            IoctlRequest::AreaMap(_) => IOCTL_AREA_MAP,
            IoctlRequest::AreaUnmap(_) => IOCTL_AREA_UNMAP,
            IoctlRequest::Explicit(_) => IOCTL_EXPLICIT,
            IoctlRequest::Identification(_) => IOCTL_IDENTIFICATION,
            IoctlRequest::Unknown { code } => *code,
        }
    }

    fn decode(code: u64, body: &[u8]) -> Result<Self> {
        Ok(match code {
            IOCTL_AREA_REQUEST => IoctlRequest::AreaRequest(AreaRequest::decode(body)?),
            IOCTL_AREA_RELEASE => IoctlRequest::AreaRelease(AreaRequest::decode(body)?),
            IOCTL_AREA_MAP => IoctlRequest::AreaMap(AreaRequest::decode(body)?),
            IOCTL_AREA_UNMAP => IoctlRequest::AreaUnmap(AreaRequest::decode(body)?),
            IOCTL_EXPLICIT => IoctlRequest::Explicit(ExplicitRequest::decode(body)?),
            IOCTL_IDENTIFICATION => IoctlRequest::Identification(Identification::decode(body)?),
            code => IoctlRequest::Unknown { code },
        })
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            IoctlRequest::AreaRequest(req)
            | IoctlRequest::AreaRelease(req)
            | IoctlRequest::AreaMap(req)
            | IoctlRequest::AreaUnmap(req) => req.encode(out),
            IoctlRequest::Explicit(req) => req.encode(out),
            IoctlRequest::Identification(ident) => ident.encode(out),
            IoctlRequest::Unknown { code } => out.resize(out.len() + ioc_size(*code), 0),
        }
    }
}

/// A fully framed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Device to client
    Read { count: u64, offset: i64 },
    /// Client to device
    Write { offset: i64, data: Vec<u8> },
    Ioctl(IoctlRequest),
}

impl Command {
    /// Decode the command at the front of `buf`
    ///
    /// Returns `Ok(None)` while the frame is incomplete, or the command and
    /// the number of bytes it occupied. Unknown opcodes and frames that
    /// could never be buffered are protocol errors.
    pub fn decode(buf: &[u8], max_transfer: u64) -> Result<Option<(Self, usize)>> {
        if buf.len() < WORD {
            return Ok(None);
        }

        match word_at(buf, 0) {
            OP_READ => {
                if buf.len() < 3 * WORD {
                    return Ok(None);
                }
                let count = word_at(buf, 1);
                let offset = word_at(buf, 2) as i64;
                Ok(Some((Command::Read { count, offset }, 3 * WORD)))
            }
            OP_WRITE => {
                if buf.len() < 3 * WORD {
                    return Ok(None);
                }
                let count = word_at(buf, 1);
                if count > max_transfer {
                    return Err(ProxyError::protocol(format!(
                        "WRITE of {} bytes exceeds limit {}",
                        count, max_transfer
                    )));
                }
                let total = 3 * WORD + count as usize;
                if buf.len() < total {
                    return Ok(None);
                }
                let offset = word_at(buf, 2) as i64;
                let data = buf[3 * WORD..total].to_vec();
                Ok(Some((Command::Write { offset, data }, total)))
            }
            OP_IOCTL => {
                if buf.len() < 2 * WORD {
                    return Ok(None);
                }
                let code = word_at(buf, 1);
                let size = ioc_size(code);
                if size > MAX_IOCTL_SIZE {
                    return Err(ProxyError::protocol(format!(
                        "ioctl {:#x} body of {} bytes exceeds {}",
                        code, size, MAX_IOCTL_SIZE
                    )));
                }
                let total = 2 * WORD + size;
                if buf.len() < total {
                    return Ok(None);
                }
                let request = IoctlRequest::decode(code, &buf[2 * WORD..total])?;
                Ok(Some((Command::Ioctl(request), total)))
            }
            opcode => Err(ProxyError::protocol(format!("unknown opcode {:#x}", opcode))),
        }
    }

    /// Append the wire form of the command
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Command::Read { count, offset } => {
                put_word(out, OP_READ);
                put_word(out, *count);
                put_word(out, *offset as u64);
            }
            Command::Write { offset, data } => {
                put_word(out, OP_WRITE);
                put_word(out, data.len() as u64);
                put_word(out, *offset as u64);
                out.extend_from_slice(data);
            }
            Command::Ioctl(request) => {
                put_word(out, OP_IOCTL);
                put_word(out, request.code());
                request.encode_body(out);
            }
        }
    }

    /// Wire form of the command
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpp::CppId;
    use crate::protocol::{ioc, IOC_WRITE};

    const LIMIT: u64 = 1 << 20;

    #[test]
    fn test_partial_frames_wait() {
        let bytes = Command::Write {
            offset: 0x40,
            data: vec![7; 100],
        }
        .to_bytes();
        for cut in [0, 7, 8, 23, 24, bytes.len() - 1] {
            assert_eq!(Command::decode(&bytes[..cut], LIMIT).unwrap(), None);
        }
        let (command, used) = Command::decode(&bytes, LIMIT).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert!(matches!(command, Command::Write { offset: 0x40, ref data } if data.len() == 100));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = Command::Read { count: 8, offset: 0 }.to_bytes();
        let ioctl = Command::Ioctl(IoctlRequest::AreaRelease(AreaRequest::for_offset(0x1000)));
        ioctl.encode(&mut bytes);

        let (first, used) = Command::decode(&bytes, LIMIT).unwrap().unwrap();
        assert_eq!(first, Command::Read { count: 8, offset: 0 });
        let (second, rest) = Command::decode(&bytes[used..], LIMIT).unwrap().unwrap();
        assert_eq!(second, ioctl);
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn test_unknown_opcode_is_protocol_error() {
        let mut bytes = Vec::new();
        put_word(&mut bytes, 0x99);
        let err = Command::decode(&bytes, LIMIT).unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_oversized_write_is_protocol_error() {
        let mut bytes = Vec::new();
        put_word(&mut bytes, OP_WRITE);
        put_word(&mut bytes, LIMIT + 1);
        put_word(&mut bytes, 0);
        assert!(Command::decode(&bytes, LIMIT).is_err());
    }

    #[test]
    fn test_unknown_ioctl_consumes_body() {
        let code = ioc(IOC_WRITE, 0x42, 16);
        let request = Command::Ioctl(IoctlRequest::Unknown { code });
        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), 32);
        let (decoded, used) = Command::decode(&bytes, LIMIT).unwrap().unwrap();
        assert_eq!(decoded, request);
        assert_eq!(used, 32);
    }

    #[test]
    fn test_area_request_frame() {
        let req = AreaRequest::auto(CppId::from_raw(0x0720_0000), 0, 4096);
        let bytes = Command::Ioctl(IoctlRequest::AreaRequest(req)).to_bytes();
        let (decoded, _) = Command::decode(&bytes, LIMIT).unwrap().unwrap();
        assert_eq!(decoded, Command::Ioctl(IoctlRequest::AreaRequest(req)));
    }
}
