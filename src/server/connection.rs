//! One client connection and its buffers

use std::io::{ErrorKind, Read, Write};

use log::debug;
use mio::{net::UnixStream, Interest, Registry, Token};

use crate::{
    areas::OwnerId,
    error::{ProxyError, Result},
    protocol::Command,
};

const READ_CHUNK: usize = 16 * 1024;

/// Buffered, non-blocking client connection
///
/// Inbound bytes accumulate until a complete frame is present; replies are
/// queued and flushed as the socket accepts them. A new command is not
/// started while a reply is still queued.
#[derive(Debug)]
pub(crate) struct Connection {
    pub id: OwnerId,
    pub token: Token,
    stream: UnixStream,
    interest: Interest,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    /// Socket may hold unread bytes
    pub readable: bool,
    /// Inbound may hold a complete frame
    buffered: bool,
    /// Inbound reached its cap; reading waits for a frame to be consumed
    full: bool,
    peer_closed: bool,
    pub closed: bool,
}

impl Connection {
    pub fn new(id: OwnerId, token: Token, stream: UnixStream) -> Self {
        Self {
            id,
            token,
            stream,
            interest: Interest::READABLE,
            inbound: Vec::new(),
            outbound: Vec::new(),
            readable: true,
            buffered: false,
            full: false,
            peer_closed: false,
            closed: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Something can be done without waiting for readiness
    ///
    /// A queued reply blocks all progress until the socket turns writable,
    /// and a full inbound buffer only moves once a frame is consumed.
    pub fn has_pending_work(&self) -> bool {
        !self.closed && self.outbound.is_empty() && ((self.readable && !self.full) || self.buffered)
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Drain the socket into the inbound buffer, stopping at `cap` bytes
    pub fn fill(&mut self, cap: usize) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.inbound.len() < cap {
            let want = (cap - self.inbound.len()).min(READ_CHUNK);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.peer_closed = true;
                    self.readable = false;
                    return Ok(());
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    self.buffered = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.readable = false;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProxyError::transport(format!(
                        "read from connection {} failed: {}",
                        self.id, e
                    )))
                }
            }
        }
        // The rest stays in the socket until a frame is consumed
        self.full = true;
        Ok(())
    }

    /// Take the next complete command, unless a reply is still queued
    pub fn next_command(&mut self, max_transfer: u64) -> Result<Option<Command>> {
        if !self.outbound.is_empty() || !self.buffered {
            return Ok(None);
        }
        match Command::decode(&self.inbound, max_transfer)? {
            Some((command, used)) => {
                self.inbound.drain(..used);
                self.full = false;
                self.buffered = !self.inbound.is_empty();
                Ok(Some(command))
            }
            None => {
                self.buffered = false;
                Ok(None)
            }
        }
    }

    /// Reply buffer of the command being serviced
    pub fn outbound_mut(&mut self) -> &mut Vec<u8> {
        &mut self.outbound
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Write as much of the queued reply as the socket takes
    pub fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(ProxyError::transport(format!(
                        "connection {} stopped accepting data",
                        self.id
                    )))
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProxyError::transport(format!(
                        "write to connection {} failed: {}",
                        self.id, e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Ask for WRITABLE events only while a reply is queued
    pub fn update_interest(&mut self, registry: &Registry) -> Result<()> {
        let wanted = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != self.interest {
            debug!("connection {}: interest {:?}", self.id, wanted);
            registry.reregister(&mut self.stream, self.token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }
}
