//! iOS Lockdown Service Client
//!
//! Reads device properties from the lockdown service, which every device
//! exposes on a fixed port reachable through a usbmuxd tunnel.
// Jackson Coxson

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{
    ClientOptions, DeviceTunnel, UsbmuxError,
    codec::{LockdownMessage, LockdownRequest, encode_lockdown_frame, read_lockdown_message},
    reader::ExactReader,
    tunnel::TunnelManager,
};

/// Client for interacting with the iOS lockdown service
///
/// Only the unauthenticated requests are supported: QueryType and GetValue.
#[derive(Debug)]
pub struct LockdownClient {
    reader: ExactReader<DeviceTunnel>,
    label: String,
    max_frame_len: usize,
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWND_PORT: u16 = 62078;
    /// What lockdown answers to QueryType
    pub const SERVICE_TYPE: &'static str = "com.apple.mobile.lockdown";

    /// Opens a tunnel to lockdown and checks that lockdown is what answers
    ///
    /// # Errors
    /// * any tunnel error from [`TunnelManager::create_tunnel`]
    /// * `UnexpectedServiceType` if QueryType reports another service
    pub async fn connect(
        tunnels: &TunnelManager,
        device_id: u32,
        options: &ClientOptions,
    ) -> Result<Self, UsbmuxError> {
        let tunnel = tunnels
            .create_tunnel(device_id, Self::LOCKDOWND_PORT)
            .await?;
        let mut client = Self::new(tunnel, options.label.clone(), options.max_frame_len);

        let service_type = client.query_type().await?;
        if service_type != Self::SERVICE_TYPE {
            warn!("Device {device_id} answered QueryType with {service_type}");
            client.close().await;
            return Err(UsbmuxError::UnexpectedServiceType(service_type));
        }
        Ok(client)
    }

    /// Wraps an already open tunnel to the lockdown port
    pub fn new(tunnel: DeviceTunnel, label: impl Into<String>, max_frame_len: usize) -> Self {
        Self {
            reader: ExactReader::new(tunnel),
            label: label.into(),
            max_frame_len,
        }
    }

    /// Asks the service on the other end of the tunnel to identify itself
    pub async fn query_type(&mut self) -> Result<String, UsbmuxError> {
        self.send_request("QueryType", None).await?;
        match self.read_response().await? {
            LockdownMessage::QueryTypeResult { service_type } => Ok(service_type),
            _ => Err(UsbmuxError::UnexpectedResponse),
        }
    }

    /// Retrieves a specific value from the device
    ///
    /// # Arguments
    /// * `key` - The name of the value to retrieve (e.g., "DeviceName")
    ///
    /// # Errors
    /// The device's lockdown error if it refuses, e.g. `GetProhibited`
    pub async fn get_value(&mut self, key: &str) -> Result<plist::Value, UsbmuxError> {
        self.send_request("GetValue", Some(key)).await?;
        match self.read_response().await? {
            LockdownMessage::GetValueResult { value, .. } => Ok(value),
            // Some devices leave out the Key when echoing the request
            LockdownMessage::GetValuesResult { values } => Ok(plist::Value::Dictionary(values)),
            _ => Err(UsbmuxError::UnexpectedResponse),
        }
    }

    /// Retrieves every value the device exposes without a session
    pub async fn get_values(&mut self) -> Result<plist::Dictionary, UsbmuxError> {
        self.send_request("GetValue", None).await?;
        match self.read_response().await? {
            LockdownMessage::GetValuesResult { values } => Ok(values),
            _ => Err(UsbmuxError::UnexpectedResponse),
        }
    }

    /// Shuts the tunnel down, ignoring a peer that is already gone
    pub async fn close(self) {
        let (mut tunnel, _) = self.reader.into_parts();
        if let Err(e) = tunnel.shutdown().await {
            debug!("Lockdown tunnel was already closed: {e}");
        }
    }

    async fn send_request(&mut self, request: &str, key: Option<&str>) -> Result<(), UsbmuxError> {
        let request = LockdownRequest {
            label: self.label.clone(),
            key: key.map(|k| k.to_string()),
            request: request.to_string(),
        };
        self.send_plist(&request).await
    }

    async fn send_plist<T: Serialize>(&mut self, message: &T) -> Result<(), UsbmuxError> {
        let frame = encode_lockdown_frame(message)?;
        let tunnel = self.reader.get_mut();
        tunnel.write_all(&frame).await?;
        tunnel.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<LockdownMessage, UsbmuxError> {
        match read_lockdown_message(&mut self.reader, self.max_frame_len).await? {
            Some(m) => Ok(m),
            None => Err(UsbmuxError::ConnectionClosed),
        }
    }
}
