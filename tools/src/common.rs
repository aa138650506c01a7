// Jackson Coxson
// Common functions between tools

use std::{collections::HashMap, str::FromStr};

use clap::{Arg, ArgMatches, Command};
use tracing_subscriber::EnvFilter;
use usbmux::{ClientOptions, DeviceRecord, UsbmuxAddr, UsbmuxClient};

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Adds the arguments every tool shares
pub fn common_args(command: Command) -> Command {
    command.arg(
        Arg::new("socket")
            .long("socket")
            .value_name("ADDR")
            .help("usbmuxd address, a socket path or HOST:PORT (default from USBMUXD_SOCKET_ADDRESS)"),
    )
}

pub fn get_client(matches: &ArgMatches, name: &str) -> Result<UsbmuxClient, String> {
    let options = match matches.get_one::<String>("socket") {
        Some(addr) => ClientOptions::default().with_addr(
            UsbmuxAddr::from_str(addr).map_err(|e| format!("Invalid socket address: {e}"))?,
        ),
        None => ClientOptions::from_env()
            .map_err(|e| format!("Bad {}: {e}", UsbmuxAddr::ENV_VAR))?,
    };
    Ok(UsbmuxClient::new(options.with_client_name(name)))
}

/// Finds a device by its device ID or serial number
pub fn find_device(
    devices: &HashMap<String, DeviceRecord>,
    selector: Option<&String>,
) -> Result<DeviceRecord, String> {
    let Some(selector) = selector else {
        let mut all = devices.values().collect::<Vec<_>>();
        all.sort_by_key(|d| d.device_id);
        // USB first, like usbmuxd's own tools
        return all
            .iter()
            .find(|d| d.connection_type() == Some("USB"))
            .or_else(|| all.first())
            .map(|d| (*d).clone())
            .ok_or_else(|| "No connected devices found".to_string());
    };

    if let Some(device) = devices.get(selector.as_str()) {
        return Ok(device.clone());
    }
    devices
        .values()
        .find(|d| d.serial_number() == Some(selector.as_str()))
        .cloned()
        .ok_or_else(|| format!("Device not found: {selector}"))
}
