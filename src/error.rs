//! Error types for static addressing and proxy lifecycle operations.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetkeeperError {
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Static IP configuration is not supported on {os}")]
    UnsupportedPlatform { os: &'static str },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CIDR address: {0}")]
    InvalidCidr(String),

    #[error("Interface {interface} has no IPv4 address to make static")]
    AddressUnavailable { interface: String },

    #[error("Invalid listen address {address:?}: {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Proxy on {addr} failed: {source}")]
    Proxy {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl NetkeeperError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when a proxy failed because its listen port is taken.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            Self::Proxy { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

pub type Result<T> = std::result::Result<T, NetkeeperError>;
