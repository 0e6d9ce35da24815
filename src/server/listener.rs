//! Listening socket setup

use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use log::debug;
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use crate::error::{ProxyError, Result};

/// Remove a socket file left behind by an earlier run
///
/// Anything at `path` that is not a socket is left alone and reported.
pub(crate) fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(|e| {
                ProxyError::from_io(e, &format!("Failed to remove {}", path.display()))
            })
        }
        Ok(_) => Err(ProxyError::invalid_parameter(
            "socket_path",
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProxyError::from_io(
            e,
            &format!("Failed to inspect {}", path.display()),
        )),
    }
}

/// Bind a non-blocking Unix stream listener at `path` with the given
/// backlog
pub(crate) fn bind_listener(path: &Path, backlog: i32) -> Result<mio::net::UnixListener> {
    remove_stale(path)?;

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;

    let listener = std::os::unix::net::UnixListener::from(fd);
    Ok(mio::net::UnixListener::from_std(listener))
}
