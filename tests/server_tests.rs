//! End-to-end tests over a real Unix socket

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use nfp_cpp_proxy::{
    cpp::{encode_offset, target, ACTION_RW, MEMIO_BOUNDARY},
    protocol::{put_word, ExplicitRequest, OP_READ, WORD},
    AreaRequest, Command, CppId, ProxyClient, ProxyConfig, ProxyError, Server, ShutdownHandle,
    SimulatedDevice,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Server>>,
}

impl Harness {
    fn start(config: impl FnOnce(ProxyConfig) -> ProxyConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.sock");
        let config = config(ProxyConfig::new(&path).with_page_size(4096));
        let mut server = Server::bind(config, Box::new(SimulatedDevice::nfp6000())).unwrap();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || {
            server.run().unwrap();
            server
        });
        Self {
            _dir: dir,
            path,
            shutdown,
            thread: Some(thread),
        }
    }

    fn client(&self) -> ProxyClient {
        let client = ProxyClient::connect(&self.path).unwrap();
        client.set_timeout(Some(TIMEOUT)).unwrap();
        client
    }

    fn stop(mut self) -> Server {
        self.shutdown.shutdown().unwrap();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.shutdown.shutdown();
            let _ = thread.join();
        }
    }
}

fn mu() -> CppId {
    CppId::new(target::MU, ACTION_RW, 0)
}

fn remote_status(err: ProxyError) -> i64 {
    match err {
        ProxyError::Remote { status } => status,
        other => panic!("expected a remote status, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let harness = Harness::start(|c| c);
        let mut client = harness.client();
        let offset = encode_offset(mu(), MEMIO_BOUNDARY - 0x20);
        let data: Vec<u8> = (0..200u8).collect();

        assert_eq!(client.write(offset, &data).unwrap(), 200);
        let mut back = vec![0u8; 200];
        assert_eq!(client.read(offset, &mut back).unwrap(), 200);
        assert_eq!(back, data);

        let server = harness.stop();
        assert_eq!(server.state().windows.open_areas(), 0);
    }

    #[test]
    fn test_area_lifecycle() {
        let harness = Harness::start(|c| c);
        let mut client = harness.client();

        let granted = client.area_request(AreaRequest::auto(mu(), 0x10000, 8192)).unwrap();
        assert_eq!(granted.offset, 0);
        assert_eq!(granted.size, 8192);

        let err = client
            .area_request(AreaRequest::at(4096, mu(), 0, 4096))
            .unwrap_err();
        assert_eq!(remote_status(err), -i64::from(libc::EEXIST));

        let phys = client.area_map(0).unwrap();
        assert_ne!(phys, 0);
        let err = client.area_release(0).unwrap_err();
        assert_eq!(remote_status(err), -i64::from(libc::EBUSY));

        client.area_unmap(0).unwrap();
        client.area_release(0).unwrap();
        let err = client.area_release(0).unwrap_err();
        assert_eq!(remote_status(err), -i64::from(libc::ENOENT));
    }

    #[test]
    fn test_identification_and_explicit() {
        let harness = Harness::start(|c| c);
        let mut client = harness.client();

        let ident = client.identify(40).unwrap();
        assert_eq!(ident.size, 40);
        assert_eq!(ident.model, 0x4001_0010);
        assert_eq!(ident.serial_high, 0x0015);

        let err = client.explicit(ExplicitRequest::default()).unwrap_err();
        assert_eq!(remote_status(err), -i64::from(libc::EOPNOTSUPP));

        // Connection survives request-scoped errors
        assert!(client.identify(8).is_ok());
    }

    #[test]
    fn test_pipelined_commands() {
        let harness = Harness::start(|c| c);
        let mut client = harness.client();
        let offset = encode_offset(mu(), 0x400);

        let mut bytes = Command::Write {
            offset: offset as i64,
            data: b"pipelined bytes!".to_vec(),
        }
        .to_bytes();
        Command::Read {
            count: 16,
            offset: offset as i64,
        }
        .encode(&mut bytes);
        client.send_raw(&bytes).unwrap();

        assert_eq!(client.read_status().unwrap(), 16);
        assert_eq!(client.read_status().unwrap(), 16);
        // The READ payload follows its status word
        let mut payload = Vec::new();
        for _ in 0..16 / WORD {
            payload.extend_from_slice(&client.read_status().unwrap().to_le_bytes());
        }
        assert_eq!(payload, b"pipelined bytes!".to_vec());
    }

    #[test]
    fn test_bad_opcode_closes_only_that_connection() {
        let harness = Harness::start(|c| c);
        let mut bad = harness.client();
        let mut good = harness.client();

        let mut bytes = Vec::new();
        put_word(&mut bytes, 0x99);
        bad.send_raw(&bytes).unwrap();
        assert!(bad.read_status().is_err());

        assert!(good.identify(40).is_ok());
    }

    #[test]
    fn test_oversized_read_rejected() {
        let harness = Harness::start(|c| c.with_max_transfer(4096));
        let mut client = harness.client();

        let mut bytes = Vec::new();
        put_word(&mut bytes, OP_READ);
        put_word(&mut bytes, 8192);
        put_word(&mut bytes, 0);
        client.send_raw(&bytes).unwrap();
        assert_eq!(client.read_status().unwrap(), -i64::from(libc::EINVAL));
        assert!(client.identify(40).is_ok());
    }

    #[test]
    fn test_over_capacity_client_closed() {
        let harness = Harness::start(|c| c.with_max_connections(1));
        let mut first = harness.client();
        assert!(first.identify(40).is_ok());

        let mut second = harness.client();
        assert!(second.identify(40).is_err());
        assert!(first.identify(40).is_ok());
    }

    #[test]
    fn test_disconnect_releases_areas() {
        let harness = Harness::start(|c| c);
        {
            let mut client = harness.client();
            client.area_request(AreaRequest::at(0, mu(), 0, 4096)).unwrap();
            client.area_map(0).unwrap();
        }

        let mut client = harness.client();
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match client.area_request(AreaRequest::at(0, mu(), 0, 4096)) {
                Ok(granted) => {
                    assert_eq!(granted.offset, 0);
                    break;
                }
                Err(e) => {
                    assert_eq!(remote_status(e), -i64::from(libc::EEXIST));
                    assert!(Instant::now() < deadline, "area never released");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        drop(client);

        let server = harness.stop();
        let windows = &server.state().windows;
        assert_eq!(windows.free_bulk_windows(), windows.bulk_windows());
    }
}
