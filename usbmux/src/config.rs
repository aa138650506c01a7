//! Where usbmuxd lives and how the client identifies itself to it
// Jackson Coxson

use std::{
    net::{AddrParseError, SocketAddr},
    str::FromStr,
    time::Duration,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::{UsbmuxError, UsbmuxSocket};

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    /// Environment variable that overrides the default address
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Opens a new connection to the service
    ///
    /// # Errors
    /// Returns `UsbmuxError::Socket` if the transport cannot connect
    pub async fn to_socket(&self) -> Result<UsbmuxSocket, UsbmuxError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a UsbmuxAddr from environment variable
    ///
    /// Checks `USBMUXD_SOCKET_ADDRESS`, falls back to the platform default.
    /// On Unix a value containing `:` is a TCP address, anything else a socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::from_str(&var),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl FromStr for UsbmuxAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        #[cfg(unix)]
        if !s.contains(':') {
            return Ok(Self::UnixSocket(s.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(s)?))
    }
}

impl Default for UsbmuxAddr {
    /// Creates default usbmuxd address based on platform:
    /// - Unix: Uses default socket path
    /// - Non-Unix: Uses localhost TCP port
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Settings for a [`crate::UsbmuxClient`], fixed for the client's lifetime
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub addr: UsbmuxAddr,
    /// Sent as `ClientVersionString` in every request
    pub client_version: String,
    /// Sent as `ProgName` in every request
    pub prog_name: String,
    /// The `version` header field. Daemons in the wild accept 0; some
    /// documentation claims 1.
    pub header_version: u32,
    /// The `tag` header field, echoed back by the daemon
    pub tag: u32,
    /// Pause after the Listen handshake so already-attached devices land in
    /// the registry before the first snapshot is taken
    pub settle_delay: Duration,
    /// Upper bound for a single frame payload
    pub max_frame_len: usize,
    /// Sent as `Label` in lockdown requests
    pub label: String,
}

impl ClientOptions {
    pub const DEFAULT_CLIENT_NAME: &'static str = "usbmux-client";
    pub const DEFAULT_HEADER_VERSION: u32 = 0;
    pub const DEFAULT_TAG: u32 = 1;
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);
    pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

    /// Default options with the address taken from `USBMUXD_SOCKET_ADDRESS`
    pub fn from_env() -> Result<Self, AddrParseError> {
        Ok(Self::default().with_addr(UsbmuxAddr::from_env_var()?))
    }

    pub fn with_addr(mut self, addr: UsbmuxAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.client_version = name.clone();
        self.prog_name = name.clone();
        self.label = name;
        self
    }

    pub fn with_header_version(mut self, version: u32) -> Self {
        self.header_version = version;
        self
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: UsbmuxAddr::default(),
            client_version: Self::DEFAULT_CLIENT_NAME.to_string(),
            prog_name: Self::DEFAULT_CLIENT_NAME.to_string(),
            header_version: Self::DEFAULT_HEADER_VERSION,
            tag: Self::DEFAULT_TAG,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
            label: Self::DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}
