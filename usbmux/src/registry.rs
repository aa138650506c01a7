// Jackson Coxson

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// A device as reported by an Attached event
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// usbmuxd-assigned device ID
    pub device_id: u32,
    /// The `Properties` dictionary of the Attached event, untouched
    pub properties: plist::Dictionary,
}

impl DeviceRecord {
    pub fn new(device_id: u32, properties: plist::Dictionary) -> Self {
        Self {
            device_id,
            properties,
        }
    }

    /// Looks up a single property
    pub fn property(&self, key: &str) -> Option<&plist::Value> {
        self.properties.get(key)
    }

    /// The raw `ConnectionType` property, e.g. "USB" or "Network"
    pub fn connection_type(&self) -> Option<&str> {
        self.property("ConnectionType").and_then(|x| x.as_string())
    }

    /// The `SerialNumber` property, which is the device UDID
    pub fn serial_number(&self) -> Option<&str> {
        self.property("SerialNumber").and_then(|x| x.as_string())
    }

    /// Interprets the connection properties
    ///
    /// Network devices carry a raw sockaddr in `NetworkAddress`; it is decoded
    /// for IPv4 and both IPv6 layouts the daemon is known to send.
    pub fn connection(&self) -> Connection {
        let connection_type = match self.connection_type() {
            Some(c) => c,
            None => return Connection::Unknown(String::new()),
        };
        let connection = match connection_type {
            "USB" => Connection::Usb,
            "Network" => match self.property("NetworkAddress").and_then(|x| x.as_data()) {
                Some(addr) => decode_network_address(addr),
                None => {
                    warn!("Device is network attached, but has no network info");
                    Connection::Unknown(connection_type.to_string())
                }
            },
            other => Connection::Unknown(other.to_string()),
        };
        debug!("Connection type: {connection:?}");
        connection
    }
}

fn ipv6_at(addr: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

fn decode_network_address(addr: &[u8]) -> Connection {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Connection::Unknown("Network".to_string());
    }

    match addr[0] {
        0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        0x1E => {
            if addr.len() < 24 {
                warn!("IPv6 address is less than 24 bytes");
                return Connection::Unknown("Network".to_string());
            }
            Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
        }
        0x1C => {
            // sockaddr_in6 with a length prefix; the family follows it
            if addr.len() < 28 || addr[1] != 0x1E {
                warn!("Unexpected sockaddr_in6 layout (len {})", addr.len());
                return Connection::Unknown(format!("Network {:02X}", addr[1]));
            }
            Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
        }
        family => {
            warn!("Unknown IP address protocol: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    }
}

/// The live set of attached devices
///
/// Cloning yields another handle to the same set. Only the monitor's dispatch
/// loop writes to it; everyone else takes snapshots.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<u32, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or wholesale replaces a device record
    pub async fn attach(&self, record: DeviceRecord) {
        debug!("Device {} attached", record.device_id);
        self.devices.write().await.insert(record.device_id, record);
    }

    /// Removes a device record, if present
    pub async fn detach(&self, device_id: u32) {
        debug!("Device {device_id} detached");
        self.devices.write().await.remove(&device_id);
    }

    pub async fn clear(&self) {
        self.devices.write().await.clear();
    }

    /// A copy of the current set, keyed by the decimal device ID
    pub async fn snapshot(&self) -> HashMap<String, DeviceRecord> {
        self.devices
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.to_string(), record.clone()))
            .collect()
    }
}
