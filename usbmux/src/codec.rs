//! Wire framing for usbmuxd and lockdown
//!
//! usbmuxd frames carry a 16 byte little-endian header (length, version, type,
//! tag) followed by a plist. Lockdown frames, which travel inside a tunnel,
//! are a big-endian u32 length followed by a plist.
// Jackson Coxson

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::{UsbmuxError, pretty_print_dictionary, reader::ExactReader, registry::DeviceRecord};

/// Size of the usbmuxd header
pub const MUX_HEADER_LEN: usize = 16;
/// Size of the lockdown length prefix
pub const LOCKDOWN_HEADER_LEN: usize = 4;

/// The `type` header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MuxPacketType {
    Result = 1,
    /// Legacy binary connect request
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    DevicePaired = 6,
    Plist = 8,
}

impl TryFrom<u32> for MuxPacketType {
    type Error = UsbmuxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Result,
            2 => Self::Connect,
            3 => Self::Listen,
            4 => Self::DeviceAdd,
            5 => Self::DeviceRemove,
            6 => Self::DevicePaired,
            8 => Self::Plist,
            _ => return Err(UsbmuxError::UnexpectedResponse),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    /// Header plus payload
    pub length: u32,
    pub version: u32,
    pub packet_type: u32,
    pub tag: u32,
}

impl MuxHeader {
    pub fn to_bytes(&self) -> [u8; MUX_HEADER_LEN] {
        let mut buf = [0u8; MUX_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.length);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.packet_type);
        LittleEndian::write_u32(&mut buf[12..16], self.tag);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UsbmuxError> {
        if buf.len() < MUX_HEADER_LEN {
            return Err(UsbmuxError::NotEnoughBytes(buf.len(), MUX_HEADER_LEN));
        }
        Ok(Self {
            length: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u32(&buf[4..8]),
            packet_type: LittleEndian::read_u32(&buf[8..12]),
            tag: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// Payload size implied by `length`
    ///
    /// # Errors
    /// `MalformedFrame` if `length` is smaller than the header itself
    pub fn payload_len(&self) -> Result<usize, UsbmuxError> {
        match (self.length as usize).checked_sub(MUX_HEADER_LEN) {
            Some(len) => Ok(len),
            None => Err(UsbmuxError::MalformedFrame(self.length)),
        }
    }
}

/// Request to receive Attached/Detached events on this connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenRequest {
    pub message_type: String,
    pub client_version_string: String,
    pub prog_name: String,
}

impl ListenRequest {
    pub fn new(client_version: impl Into<String>, prog_name: impl Into<String>) -> Self {
        Self {
            message_type: "Listen".to_string(),
            client_version_string: client_version.into(),
            prog_name: prog_name.into(),
        }
    }
}

/// Request to turn this connection into a tunnel to a device port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectRequest {
    pub message_type: String,
    pub client_version_string: String,
    pub prog_name: String,
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    /// Network byte order, see [`swap_port`]
    pub port_number: u16,
}

impl ConnectRequest {
    pub fn new(
        client_version: impl Into<String>,
        prog_name: impl Into<String>,
        device_id: u32,
        port: u16,
    ) -> Self {
        Self {
            message_type: "Connect".to_string(),
            client_version_string: client_version.into(),
            prog_name: prog_name.into(),
            device_id,
            port_number: swap_port(port),
        }
    }

    /// The target port in host order
    pub fn port(&self) -> u16 {
        swap_port(self.port_number)
    }
}

/// Swaps a port between host order and the order usbmuxd expects in `PortNumber`
///
/// The port is written little-endian and re-read big-endian, so applying it
/// twice yields the original port.
pub fn swap_port(port: u16) -> u16 {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, port);
    BigEndian::read_u16(&buf)
}

fn plist_to_xml<T: Serialize>(payload: &T) -> Result<Vec<u8>, UsbmuxError> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, payload)?;
    Ok(buf)
}

/// Builds a complete usbmuxd frame around an XML plist payload
pub fn encode_mux_frame<T: Serialize>(
    payload: &T,
    version: u32,
    packet_type: MuxPacketType,
    tag: u32,
) -> Result<Vec<u8>, UsbmuxError> {
    let payload = plist_to_xml(payload)?;
    let length = u32::try_from(MUX_HEADER_LEN + payload.len())
        .map_err(|_| UsbmuxError::MalformedFrame(u32::MAX))?;
    let header = MuxHeader {
        length,
        version,
        packet_type: packet_type as u32,
        tag,
    };

    let mut frame = Vec::with_capacity(length as usize);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one usbmuxd frame and parses its plist payload
///
/// # Returns
/// `None` if the stream ended before a complete frame arrived
///
/// # Errors
/// * `MalformedFrame` if the header length is below 16 or above `max_len`
/// * `Plist` if the payload does not parse
pub async fn read_mux_dictionary<R: AsyncRead + Unpin>(
    reader: &mut ExactReader<R>,
    max_len: usize,
) -> Result<Option<(MuxHeader, plist::Dictionary)>, UsbmuxError> {
    let header = match reader.read_exact(MUX_HEADER_LEN).await? {
        Some(h) => MuxHeader::from_bytes(&h)?,
        None => return Ok(None),
    };

    let payload_len = header.payload_len()?;
    if payload_len > max_len {
        warn!("Muxer announced a {payload_len} byte payload, refusing");
        return Err(UsbmuxError::MalformedFrame(header.length));
    }
    debug!("Reading {payload_len} bytes from muxer");

    let payload = match reader.read_exact(payload_len).await? {
        Some(p) => p,
        None => {
            warn!("Muxer hung up after a frame header");
            return Ok(None);
        }
    };

    let res: plist::Dictionary = plist::from_bytes(&payload)?;
    debug!("Read from muxer: {}", pretty_print_dictionary(&res));
    Ok(Some((header, res)))
}

/// A decoded usbmuxd message
#[derive(Debug, Clone, PartialEq)]
pub enum MuxMessage {
    Result { number: u64 },
    Attached(DeviceRecord),
    Detached { device_id: u32 },
    Paired { device_id: u32 },
}

fn device_id(dict: &plist::Dictionary) -> Result<u32, UsbmuxError> {
    dict.get("DeviceID")
        .and_then(|x| x.as_unsigned_integer())
        .and_then(|x| u32::try_from(x).ok())
        .ok_or(UsbmuxError::UnexpectedResponse)
}

impl MuxMessage {
    /// Maps a payload to a message by its `MessageType`
    ///
    /// # Errors
    /// * `UnknownMessageType` for discriminators this client does not model
    /// * `UnexpectedResponse` if the discriminator or a required field is missing
    pub fn from_dictionary(mut dict: plist::Dictionary) -> Result<Self, UsbmuxError> {
        let message_type = match dict.get("MessageType").and_then(|x| x.as_string()) {
            Some(m) => m.to_string(),
            None => {
                warn!("Received malformed message (no MessageType)");
                return Err(UsbmuxError::UnexpectedResponse);
            }
        };

        match message_type.as_str() {
            "Result" => match dict.get("Number").and_then(|x| x.as_unsigned_integer()) {
                Some(number) => Ok(Self::Result { number }),
                None => Err(UsbmuxError::UnexpectedResponse),
            },
            "Attached" => {
                let device_id = device_id(&dict)?;
                match dict.remove("Properties") {
                    Some(plist::Value::Dictionary(properties)) => {
                        Ok(Self::Attached(DeviceRecord::new(device_id, properties)))
                    }
                    _ => {
                        warn!("Attached message for {device_id} has no Properties");
                        Err(UsbmuxError::UnexpectedResponse)
                    }
                }
            }
            "Detached" => Ok(Self::Detached {
                device_id: device_id(&dict)?,
            }),
            "Paired" => Ok(Self::Paired {
                device_id: device_id(&dict)?,
            }),
            _ => Err(UsbmuxError::UnknownMessageType(message_type)),
        }
    }

    /// Builds the payload the daemon would send for this message
    pub fn to_dictionary(&self) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), self.message_type().into());
        match self {
            Self::Result { number } => {
                dict.insert("Number".into(), (*number).into());
            }
            Self::Attached(record) => {
                dict.insert("DeviceID".into(), record.device_id.into());
                dict.insert(
                    "Properties".into(),
                    plist::Value::Dictionary(record.properties.clone()),
                );
            }
            Self::Detached { device_id } | Self::Paired { device_id } => {
                dict.insert("DeviceID".into(), (*device_id).into());
            }
        }
        dict
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Result { .. } => "Result",
            Self::Attached(_) => "Attached",
            Self::Detached { .. } => "Detached",
            Self::Paired { .. } => "Paired",
        }
    }
}

/// Reads and decodes one usbmuxd message
pub async fn read_mux_message<R: AsyncRead + Unpin>(
    reader: &mut ExactReader<R>,
    max_len: usize,
) -> Result<Option<MuxMessage>, UsbmuxError> {
    match read_mux_dictionary(reader, max_len).await? {
        Some((_, dict)) => MuxMessage::from_dictionary(dict).map(Some),
        None => Ok(None),
    }
}

/// A request sent to lockdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockdownRequest {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
    pub request: String,
}

/// Builds a lockdown frame: big-endian payload length, then an XML plist
pub fn encode_lockdown_frame<T: Serialize>(payload: &T) -> Result<Vec<u8>, UsbmuxError> {
    let payload = plist_to_xml(payload)?;
    let length = u32::try_from(payload.len()).map_err(|_| UsbmuxError::MalformedFrame(u32::MAX))?;

    let mut frame = vec![0u8; LOCKDOWN_HEADER_LEN];
    BigEndian::write_u32(&mut frame, length);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one lockdown frame
///
/// # Errors
/// Fails with the typed lockdown error if the payload carries an `Error` key
pub async fn read_lockdown_dictionary<R: AsyncRead + Unpin>(
    reader: &mut ExactReader<R>,
    max_len: usize,
) -> Result<Option<plist::Dictionary>, UsbmuxError> {
    let len = match reader.read_exact(LOCKDOWN_HEADER_LEN).await? {
        Some(buf) => BigEndian::read_u32(&buf),
        None => return Ok(None),
    };
    if len as usize > max_len {
        warn!("Lockdown announced a {len} byte payload, refusing");
        return Err(UsbmuxError::MalformedFrame(len));
    }

    let payload = match reader.read_exact(len as usize).await? {
        Some(p) => p,
        None => return Ok(None),
    };
    let res: plist::Dictionary = plist::from_bytes(&payload)?;
    debug!("Received plist: {}", pretty_print_dictionary(&res));

    if let Some(e) = res.get("Error") {
        let e = match e.as_string() {
            Some(e) => e,
            None => return Err(UsbmuxError::UnexpectedResponse),
        };
        return Err(UsbmuxError::from_device_error_type(e));
    }
    Ok(Some(res))
}

/// A decoded lockdown response
#[derive(Debug, Clone, PartialEq)]
pub enum LockdownMessage {
    QueryTypeResult { service_type: String },
    GetValueResult { key: String, value: plist::Value },
    GetValuesResult { values: plist::Dictionary },
}

impl LockdownMessage {
    /// Maps a payload to a response by its `Request` field
    pub fn from_dictionary(mut dict: plist::Dictionary) -> Result<Self, UsbmuxError> {
        let request = match dict.get("Request").and_then(|x| x.as_string()) {
            Some(r) => r.to_string(),
            None => return Err(UsbmuxError::UnexpectedResponse),
        };

        match request.as_str() {
            "QueryType" => match dict.remove("Type") {
                Some(plist::Value::String(service_type)) => {
                    Ok(Self::QueryTypeResult { service_type })
                }
                _ => Err(UsbmuxError::UnexpectedResponse),
            },
            "GetValue" => {
                let value = match dict.remove("Value") {
                    Some(v) => v,
                    None => return Err(UsbmuxError::UnexpectedResponse),
                };
                match dict.remove("Key") {
                    Some(plist::Value::String(key)) => Ok(Self::GetValueResult { key, value }),
                    Some(_) => Err(UsbmuxError::UnexpectedResponse),
                    None => match value {
                        plist::Value::Dictionary(values) => Ok(Self::GetValuesResult { values }),
                        _ => Err(UsbmuxError::UnexpectedResponse),
                    },
                }
            }
            _ => Err(UsbmuxError::UnknownMessageType(request)),
        }
    }
}

/// Reads and decodes one lockdown response
pub async fn read_lockdown_message<R: AsyncRead + Unpin>(
    reader: &mut ExactReader<R>,
    max_len: usize,
) -> Result<Option<LockdownMessage>, UsbmuxError> {
    match read_lockdown_dictionary(reader, max_len).await? {
        Some(dict) => LockdownMessage::from_dictionary(dict).map(Some),
        None => Ok(None),
    }
}
