// Jackson Coxson

use std::{collections::HashMap, net::AddrParseError, sync::Arc};

use tracing::debug;

use crate::{
    ClientOptions, DeviceRecord, DeviceTunnel, UsbmuxError, monitor::MonitorManager,
    registry::DeviceRegistry, tunnel::TunnelManager,
};

#[cfg(feature = "lockdown")]
use crate::lockdown::LockdownClient;

/// Client for a local usbmuxd
///
/// Connects lazily: the first call to [`UsbmuxClient::get_devices`] opens the
/// monitor connection, and after the daemon goes away the next call opens a
/// new one. Tunnels and lockdown queries use connections of their own and
/// never disturb the monitor.
pub struct UsbmuxClient {
    options: Arc<ClientOptions>,
    registry: DeviceRegistry,
    monitor: MonitorManager,
    tunnels: TunnelManager,
}

impl UsbmuxClient {
    pub fn new(options: ClientOptions) -> Self {
        let options = Arc::new(options);
        let registry = DeviceRegistry::new();
        Self {
            monitor: MonitorManager::new(options.clone(), registry.clone()),
            tunnels: TunnelManager::new(options.clone()),
            registry,
            options,
        }
    }

    /// Creates a client for the address in `USBMUXD_SOCKET_ADDRESS`, or the
    /// platform default
    pub fn from_env() -> Result<Self, AddrParseError> {
        Ok(Self::new(ClientOptions::from_env()?))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The attached devices, keyed by their decimal device ID
    ///
    /// # Errors
    /// Fails if the monitor connection cannot be established; every caller
    /// waiting on the same attempt receives the same failure.
    pub async fn get_devices(&self) -> Result<HashMap<String, DeviceRecord>, UsbmuxError> {
        self.monitor.ensure_connected().await?;
        Ok(self.registry.snapshot().await)
    }

    /// Whether the monitor connection is currently up
    pub async fn is_listening(&self) -> bool {
        self.monitor.is_listening().await
    }

    /// Opens a raw byte stream to a port on a device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port on the device (host byte order)
    pub async fn create_device_tunnel(
        &self,
        device_id: u32,
        port: u16,
    ) -> Result<DeviceTunnel, UsbmuxError> {
        self.tunnels.create_tunnel(device_id, port).await
    }

    /// Number of tunnels handed out that are still open
    pub fn open_tunnels(&self) -> usize {
        self.tunnels.open_count()
    }

    /// Reads one lockdown value, e.g. "DeviceName" or "ProductVersion"
    #[cfg(feature = "lockdown")]
    pub async fn query_device_value(
        &self,
        device_id: u32,
        key: &str,
    ) -> Result<plist::Value, UsbmuxError> {
        let mut lockdown = LockdownClient::connect(&self.tunnels, device_id, &self.options).await?;
        let res = lockdown.get_value(key).await;
        lockdown.close().await;
        res
    }

    /// Reads every lockdown value available without pairing
    #[cfg(feature = "lockdown")]
    pub async fn query_all_device_values(
        &self,
        device_id: u32,
    ) -> Result<plist::Dictionary, UsbmuxError> {
        let mut lockdown = LockdownClient::connect(&self.tunnels, device_id, &self.options).await?;
        let res = lockdown.get_values().await;
        lockdown.close().await;
        res
    }

    /// Closes the monitor connection and every open tunnel
    ///
    /// Never fails and may be called any number of times. The client stays
    /// usable; the next `get_devices` reconnects.
    pub async fn close(&self) {
        debug!("Closing usbmux client");
        tokio::join!(self.monitor.shutdown(), async { self.tunnels.close_all() });
    }
}

impl Default for UsbmuxClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}
