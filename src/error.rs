//! Error types and handling for the CPP proxy

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error kinds raised by the proxy core
///
/// Transport and protocol errors are connection-scoped and close the
/// offending connection. Every other kind is request-scoped and is reported
/// to the client as a negative status word (see [`ProxyError::status`]).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// I/O related errors (socket, sysfs, mmap)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Peer closed the connection or a socket operation failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed frame or unknown opcode
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Alignment requirements not met
    #[error("Alignment error: value {value:#x} not aligned to {alignment:#x}")]
    Alignment { value: u64, alignment: u64 },

    /// Requested area overlaps a live area
    #[error("Area [{offset:#x}, +{size:#x}) overlaps live area at {existing:#x}")]
    Overlap { offset: u64, size: u64, existing: u64 },

    /// No area or handle with the given key
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Area still has outstanding client mappings
    #[error("Busy: {what}")]
    Busy { what: String },

    /// No bulk window can currently route the request
    #[error("No window available for {size:#x} bytes at {address:#x}")]
    NoWindow { address: u64, size: u64 },

    /// Operation intentionally not provided
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Ioctl request code not served by this proxy
    #[error("Unknown request code {code:#x}")]
    UnknownRequest { code: u64 },

    /// Negative status returned by a proxy server
    #[error("Proxy returned status {status}")]
    Remote { status: i64 },

    /// Failure reported by the hardware handle
    #[error("Hardware error: {message}")]
    Hardware { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl ProxyError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an alignment error
    pub fn alignment(value: u64, alignment: u64) -> Self {
        Self::Alignment { value, alignment }
    }

    /// Create an overlap error
    pub fn overlap(offset: u64, size: u64, existing: u64) -> Self {
        Self::Overlap {
            offset,
            size,
            existing,
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a busy error
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy { what: what.into() }
    }

    /// Create a no-window error
    pub fn no_window(address: u64, size: u64) -> Self {
        Self::NoWindow { address, size }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an unknown request error
    pub fn unknown_request(code: u64) -> Self {
        Self::UnknownRequest { code }
    }

    /// Wrap a negative status received from a server
    pub fn remote(status: i64) -> Self {
        Self::Remote { status }
    }

    /// Create a hardware error
    pub fn hardware(message: impl Into<String>) -> Self {
        Self::Hardware {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Negative errno reported to the client for this error
    pub fn status(&self) -> i64 {
        if let Self::Remote { status } = self {
            return *status;
        }
        let errno = match self {
            Self::InvalidParameter { .. } | Self::Alignment { .. } | Self::Config { .. } => {
                libc::EINVAL
            }
            Self::Overlap { .. } => libc::EEXIST,
            Self::NotFound { .. } => libc::ENOENT,
            Self::Busy { .. } => libc::EBUSY,
            Self::NoWindow { .. } => libc::EAGAIN,
            Self::Unsupported { .. } => libc::EOPNOTSUPP,
            Self::UnknownRequest { .. } => libc::ENOTTY,
            Self::Io { .. }
            | Self::Transport { .. }
            | Self::Protocol { .. }
            | Self::Hardware { .. }
            | Self::Platform { .. }
            | Self::Remote { .. } => libc::EIO,
        };
        -i64::from(errno)
    }

    /// Whether this error must close the connection it occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Protocol { .. } | Self::Io { .. }
        )
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::Error> for ProxyError {
    fn from(err: nix::Error) -> Self {
        Self::platform(err.desc())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("JSON error: {}", err))
    }
}
