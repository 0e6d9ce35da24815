//! Command dispatcher
//!
//! Runs one decoded command against the device state and appends the
//! reply. Every failure here is request-scoped: it becomes a negative
//! status word and the connection carries on.

use log::debug;

use crate::{
    areas::OwnerId,
    cpp::decode_offset,
    error::{ProxyError, Result},
    state::ProxyState,
    transfer::TransferError,
};

use super::{put_status, put_word, Command, IoctlRequest};

/// Execute `command` for connection `owner` and append its reply
///
/// Returns the status word that was sent.
pub fn dispatch(state: &mut ProxyState, owner: OwnerId, command: Command, reply: &mut Vec<u8>) -> i64 {
    let start = reply.len();
    let result = match command {
        Command::Read { count, offset } => read(state, count, offset, reply),
        Command::Write { offset, data } => write(state, offset, &data, reply),
        Command::Ioctl(request) => ioctl(state, owner, request, reply),
    };

    match result {
        Ok(status) => status,
        Err(e) => {
            debug!("connection {}: request failed: {}", owner, e);
            reply.truncate(start);
            let status = e.status();
            put_status(reply, status);
            status
        }
    }
}

fn transfer_offset(offset: i64) -> Result<u64> {
    if offset < 0 {
        return Err(ProxyError::invalid_parameter(
            "offset",
            format!("negative transfer offset {}", offset),
        ));
    }
    Ok(offset as u64)
}

fn stopped(e: TransferError) -> ProxyError {
    debug!("transfer moved {} bytes before failing", e.moved);
    e.source
}

fn read(state: &mut ProxyState, count: u64, offset: i64, reply: &mut Vec<u8>) -> Result<i64> {
    let (id, address) = decode_offset(transfer_offset(offset)?);
    if count > state.max_transfer {
        return Err(ProxyError::invalid_parameter(
            "count",
            format!("READ of {} bytes exceeds limit {}", count, state.max_transfer),
        ));
    }

    let mut buf = vec![0u8; count as usize];
    let moved = state
        .transfer
        .read(&mut state.windows, id, address, &mut buf)
        .map_err(stopped)?;

    put_status(reply, moved as i64);
    reply.extend_from_slice(&buf);
    Ok(moved as i64)
}

fn write(state: &mut ProxyState, offset: i64, data: &[u8], reply: &mut Vec<u8>) -> Result<i64> {
    let (id, address) = decode_offset(transfer_offset(offset)?);
    let moved = state
        .transfer
        .write(&mut state.windows, id, address, data)
        .map_err(stopped)?;

    put_status(reply, moved as i64);
    Ok(moved as i64)
}

fn ioctl(
    state: &mut ProxyState,
    owner: OwnerId,
    request: IoctlRequest,
    reply: &mut Vec<u8>,
) -> Result<i64> {
    match request {
        IoctlRequest::AreaRequest(mut req) => {
            req.offset = state.areas.request(
                &mut state.windows,
                req.offset,
                req.cpp_id,
                req.address,
                req.size,
                owner,
            )?;
            put_status(reply, 0);
            req.encode(reply);
            Ok(0)
        }
        IoctlRequest::AreaRelease(req) => {
            state.areas.release(&mut state.windows, req.offset)?;
            put_status(reply, 0);
            Ok(0)
        }
        IoctlRequest::AreaMap(req) => {
            let acquired = state.areas.map(&mut state.windows, req.offset, owner)?;
            put_status(reply, 0);
            put_word(reply, acquired.phys_addr);
            Ok(0)
        }
        IoctlRequest::AreaUnmap(req) => {
            state.areas.unmap(&mut state.windows, req.offset, owner)?;
            put_status(reply, 0);
            Ok(0)
        }
        IoctlRequest::Explicit(_) => Err(ProxyError::unsupported("explicit transaction")),
        IoctlRequest::Identification(mut ident) => {
            let populated = ident.fill(&state.windows.identity())? as i64;
            put_status(reply, populated);
            ident.encode(reply);
            Ok(populated)
        }
        IoctlRequest::Unknown { code } => Err(ProxyError::unknown_request(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        areas::AREA_AUTO,
        config::ProxyConfig,
        cpp::{encode_offset, target, CppId, ACTION_RW},
        hardware::SimulatedDevice,
        protocol::{word_at, AreaRequest, ExplicitRequest, Identification},
    };

    fn state() -> ProxyState {
        let config = ProxyConfig::default()
            .with_page_size(4096)
            .with_max_transfer(1 << 16);
        ProxyState::new(Box::new(SimulatedDevice::nfp6000()), &config).unwrap()
    }

    fn mu() -> CppId {
        CppId::new(target::MU, ACTION_RW, 0)
    }

    #[test]
    fn test_write_then_read() {
        let mut state = state();
        let offset = encode_offset(mu(), 0x1234) as i64;
        let mut reply = Vec::new();

        let status = dispatch(
            &mut state,
            1,
            Command::Write {
                offset,
                data: b"hello".to_vec(),
            },
            &mut reply,
        );
        assert_eq!(status, 5);
        assert_eq!(reply.len(), 8);

        reply.clear();
        assert_eq!(dispatch(&mut state, 1, Command::Read { count: 5, offset }, &mut reply), 5);
        assert_eq!(&reply[8..], b"hello");
        assert_eq!(state.windows.open_areas(), 0);
    }

    #[test]
    fn test_read_limits() {
        let mut state = state();
        let mut reply = Vec::new();
        let status = dispatch(&mut state, 1, Command::Read { count: 1 << 20, offset: 0 }, &mut reply);
        assert_eq!(status, -i64::from(libc::EINVAL));
        assert_eq!(reply.len(), 8);

        reply.clear();
        let status = dispatch(&mut state, 1, Command::Read { count: 8, offset: -8 }, &mut reply);
        assert_eq!(status, -i64::from(libc::EINVAL));
    }

    #[test]
    fn test_area_request_echoes_offset() {
        let mut state = state();
        let mut reply = Vec::new();
        let req = AreaRequest::auto(mu(), 0, 4096);
        let status = dispatch(
            &mut state,
            1,
            Command::Ioctl(IoctlRequest::AreaRequest(req)),
            &mut reply,
        );
        assert_eq!(status, 0);
        assert_eq!(reply.len(), 8 + AreaRequest::SIZE);
        let echoed = AreaRequest::decode(&reply[8..]).unwrap();
        assert_eq!(echoed.offset, 0);
        assert_ne!(echoed.offset, AREA_AUTO);
    }

    #[test]
    fn test_map_reports_physical_address() {
        let mut state = state();
        let offset = state
            .areas
            .request(&mut state.windows, AREA_AUTO, mu(), 0x2000, 4096, 1)
            .unwrap();
        let mut reply = Vec::new();
        let status = dispatch(
            &mut state,
            1,
            Command::Ioctl(IoctlRequest::AreaMap(AreaRequest::for_offset(offset))),
            &mut reply,
        );
        assert_eq!(status, 0);
        assert_eq!(reply.len(), 16);
        assert!(word_at(&reply, 1) >= crate::hardware::simulated::DEFAULT_PHYS_BASE);

        reply.clear();
        let release = Command::Ioctl(IoctlRequest::AreaRelease(AreaRequest::for_offset(offset)));
        assert_eq!(dispatch(&mut state, 1, release, &mut reply), -i64::from(libc::EBUSY));
    }

    #[test]
    fn test_explicit_and_unknown_rejected() {
        let mut state = state();
        let mut reply = Vec::new();
        let explicit = Command::Ioctl(IoctlRequest::Explicit(ExplicitRequest::default()));
        assert_eq!(dispatch(&mut state, 1, explicit, &mut reply), -i64::from(libc::EOPNOTSUPP));

        reply.clear();
        let unknown = Command::Ioctl(IoctlRequest::Unknown { code: 0x4010_6e42 });
        assert_eq!(dispatch(&mut state, 1, unknown, &mut reply), -i64::from(libc::ENOTTY));
        assert_eq!(reply.len(), 8);
    }

    #[test]
    fn test_identification_status_is_size() {
        let mut state = state();
        let mut reply = Vec::new();
        let query = Command::Ioctl(IoctlRequest::Identification(Identification::query(24)));
        assert_eq!(dispatch(&mut state, 1, query, &mut reply), 24);
        let ident = Identification::decode(&reply[8..]).unwrap();
        assert_eq!(ident.size, 24);
        assert_eq!(ident.model, 0x4001_0010);
        assert_eq!(ident.interface, 0x1000);
        assert_eq!(ident.serial_low, 0);
    }
}
