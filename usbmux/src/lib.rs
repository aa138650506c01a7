//! usbmuxd client
//!
//! Keeps a live view of the iOS devices attached to the local usbmuxd, opens
//! raw tunnels to ports on those devices, and reads device properties over
//! the lockdown service.
// Jackson Coxson

mod client;
pub mod codec;
pub mod config;
#[cfg(feature = "lockdown")]
pub mod lockdown;
mod monitor;
pub mod reader;
pub mod registry;
pub mod tunnel;

#[cfg(test)]
mod mock;

use std::{io, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use client::UsbmuxClient;
pub use config::{ClientOptions, UsbmuxAddr};
pub use registry::{Connection, DeviceRecord};
pub use tunnel::DeviceTunnel;
pub use plist_macro::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a usbmuxd socket
///
/// Tokio's TcpStream and UnixStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed usbmuxd sockets
pub type UsbmuxSocket = Box<dyn ReadWrite>;

/// Comprehensive error type for all usbmuxd and lockdown failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum UsbmuxError {
    #[error("usbmuxd socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -2,
    #[error("unexpected response from usbmuxd")]
    UnexpectedResponse = -3,
    #[error("expected a {expected} message, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String } = -4,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String) = -5,
    #[error("frame length {0} is malformed")]
    MalformedFrame(u32) = -6,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize) = -7,
    #[error("connection closed before a response was received")]
    ConnectionClosed = -8,

    #[error("bad command")]
    UsbBadCommand = -9,
    #[error("bad device")]
    UsbBadDevice = -10,
    #[error("device refused connection")]
    UsbConnectionRefused = -11,
    #[error("usb bad version")]
    UsbBadVersion = -12,
    #[error("unknown result code {0}")]
    UnknownResultCode(u64) = -13,

    #[error("this request was prohibited")]
    GetProhibited = -14,
    #[error("device does not have pairing file")]
    InvalidHostID = -15,
    #[error("no SSL session is active")]
    SessionInactive = -16,
    #[error("device locked")]
    DeviceLocked = -17,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String) = -18,
    #[error("unexpected lockdown service type `{0}`")]
    UnexpectedServiceType(String) = -19,

    #[error("client was closed")]
    ClientClosed = -20,
    #[error(transparent)]
    Monitor(Arc<UsbmuxError>) = -21,
}

impl UsbmuxError {
    /// Converts a lockdown `Error` string to a typed error
    ///
    /// Unrecognised strings are kept verbatim in `UnknownErrorType`.
    pub(crate) fn from_device_error_type(e: &str) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionInactive" => Self::SessionInactive,
            "DeviceLocked" => Self::DeviceLocked,
            _ => Self::UnknownErrorType(e.to_string()),
        }
    }

    /// Maps a usbmuxd `Result` number to an error, `None` meaning success
    pub(crate) fn from_result_code(number: u64) -> Option<Self> {
        match number {
            0 => None,
            1 => Some(Self::UsbBadCommand),
            2 => Some(Self::UsbBadDevice),
            3 => Some(Self::UsbConnectionRefused),
            6 => Some(Self::UsbBadVersion),
            n => Some(Self::UnknownResultCode(n)),
        }
    }

    /// The error that caused this one, looking through shared monitor failures
    pub fn root(&self) -> &UsbmuxError {
        match self {
            Self::Monitor(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether usbmuxd could not be reached or hung up before answering
    pub fn is_connection_failure(&self) -> bool {
        matches!(self.root(), Self::Socket(_) | Self::ConnectionClosed)
    }

    /// The error string reported by lockdown, if this is a lockdown error
    pub fn lockdown_error(&self) -> Option<&str> {
        match self.root() {
            Self::GetProhibited => Some("GetProhibited"),
            Self::InvalidHostID => Some("InvalidHostID"),
            Self::SessionInactive => Some("SessionInactive"),
            Self::DeviceLocked => Some("DeviceLocked"),
            Self::UnknownErrorType(e) => Some(e.as_str()),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            UsbmuxError::Socket(_) => -1,
            UsbmuxError::Plist(_) => -2,
            UsbmuxError::UnexpectedResponse => -3,
            UsbmuxError::UnexpectedMessage { .. } => -4,
            UsbmuxError::UnknownMessageType(_) => -5,
            UsbmuxError::MalformedFrame(_) => -6,
            UsbmuxError::NotEnoughBytes(_, _) => -7,
            UsbmuxError::ConnectionClosed => -8,
            UsbmuxError::UsbBadCommand => -9,
            UsbmuxError::UsbBadDevice => -10,
            UsbmuxError::UsbConnectionRefused => -11,
            UsbmuxError::UsbBadVersion => -12,
            UsbmuxError::UnknownResultCode(_) => -13,
            UsbmuxError::GetProhibited => -14,
            UsbmuxError::InvalidHostID => -15,
            UsbmuxError::SessionInactive => -16,
            UsbmuxError::DeviceLocked => -17,
            UsbmuxError::UnknownErrorType(_) => -18,
            UsbmuxError::UnexpectedServiceType(_) => -19,
            UsbmuxError::ClientClosed => -20,
            UsbmuxError::Monitor(_) => -21,
        }
    }
}
