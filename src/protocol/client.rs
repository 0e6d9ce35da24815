//! Blocking client for the proxy socket

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, Result};

use super::{
    word_at, AreaRequest, Command, ExplicitRequest, Identification, IoctlRequest, WORD,
};

/// One connection to a proxy server
///
/// Every call sends one command and waits for its reply. A negative status
/// comes back as [`ProxyError::Remote`].
#[derive(Debug)]
pub struct ProxyClient {
    stream: UnixStream,
}

impl ProxyClient {
    /// Connect to the server listening at `path`
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| {
            ProxyError::from_io(e, &format!("Failed to connect to {}", path.display()))
        })?;
        Ok(Self { stream })
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Bound how long a reply may take
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Read `buf.len()` bytes at a transfer offset (CPP id in the high
    /// bits, address in the low 40)
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<u64> {
        self.send(&Command::Read {
            count: buf.len() as u64,
            offset: offset as i64,
        })?;
        let moved = self.status()?;
        if moved as usize > buf.len() {
            return Err(ProxyError::protocol(format!(
                "server returned {} bytes for a {} byte READ",
                moved,
                buf.len()
            )));
        }
        self.recv_exact(&mut buf[..moved as usize])?;
        Ok(moved as u64)
    }

    /// Write `data` at a transfer offset
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<u64> {
        self.send(&Command::Write {
            offset: offset as i64,
            data: data.to_vec(),
        })?;
        Ok(self.status()? as u64)
    }

    /// Reserve an area; returns the request with the granted offset
    pub fn area_request(&mut self, request: AreaRequest) -> Result<AreaRequest> {
        self.send(&Command::Ioctl(IoctlRequest::AreaRequest(request)))?;
        self.status()?;
        let mut body = [0u8; AreaRequest::SIZE];
        self.recv_exact(&mut body)?;
        AreaRequest::decode(&body)
    }

    /// Release the area at `offset`
    pub fn area_release(&mut self, offset: u64) -> Result<()> {
        let request = AreaRequest::for_offset(offset);
        self.send(&Command::Ioctl(IoctlRequest::AreaRelease(request)))?;
        self.status().map(drop)
    }

    /// Route the area at `offset` through a window; returns the host
    /// physical address of its first byte
    pub fn area_map(&mut self, offset: u64) -> Result<u64> {
        let request = AreaRequest::for_offset(offset);
        self.send(&Command::Ioctl(IoctlRequest::AreaMap(request)))?;
        self.status()?;
        let mut word = [0u8; WORD];
        self.recv_exact(&mut word)?;
        Ok(word_at(&word, 0))
    }

    /// Drop one mapping of the area at `offset`
    pub fn area_unmap(&mut self, offset: u64) -> Result<()> {
        let request = AreaRequest::for_offset(offset);
        self.send(&Command::Ioctl(IoctlRequest::AreaUnmap(request)))?;
        self.status().map(drop)
    }

    /// Query identification, understanding the first `size` bytes
    pub fn identify(&mut self, size: u64) -> Result<Identification> {
        self.send(&Command::Ioctl(IoctlRequest::Identification(
            Identification::query(size),
        )))?;
        self.status()?;
        let mut body = [0u8; Identification::SIZE];
        self.recv_exact(&mut body)?;
        Identification::decode(&body)
    }

    /// Submit an explicit transaction
    pub fn explicit(&mut self, request: ExplicitRequest) -> Result<()> {
        self.send(&Command::Ioctl(IoctlRequest::Explicit(request)))?;
        self.status().map(drop)
    }

    /// Send arbitrary bytes, bypassing framing
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .map_err(|e| ProxyError::from_io(e, "Failed to send to proxy"))
    }

    /// Read one status word without interpreting it
    pub fn read_status(&mut self) -> Result<i64> {
        let mut word = [0u8; WORD];
        self.recv_exact(&mut word)?;
        Ok(word_at(&word, 0) as i64)
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        self.send_raw(&command.to_bytes())
    }

    fn status(&mut self) -> Result<i64> {
        match self.read_status()? {
            status if status < 0 => Err(ProxyError::remote(status)),
            status => Ok(status),
        }
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => ProxyError::transport("proxy closed the connection"),
            _ => ProxyError::from_io(e, "Failed to receive from proxy"),
        })
    }
}
