// Jackson Coxson
// Lists the devices known to usbmuxd

use std::{collections::HashMap, time::Duration};

use clap::{Arg, Command};
use usbmux::DeviceRecord;

mod common;

fn describe(device: &DeviceRecord) -> String {
    format!(
        "{} {} ({:?})",
        device.device_id,
        device.serial_number().unwrap_or("<no serial>"),
        device.connection()
    )
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::common_args(
        Command::new("usbmux_id")
            .about("List the devices attached to usbmuxd")
            .arg(
                Arg::new("listen")
                    .short('l')
                    .long("listen")
                    .action(clap::ArgAction::SetTrue)
                    .help("Keep running and print devices as they come and go"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Print every property usbmuxd reports"),
            ),
    )
    .get_matches();

    let client = match common::get_client(&matches, "usbmux_id") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let mut known = match client.get_devices().await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Unable to reach usbmuxd: {e}");
            return;
        }
    };
    let mut ids = known.values().collect::<Vec<_>>();
    ids.sort_by_key(|d| d.device_id);
    for device in ids {
        if matches.get_flag("verbose") {
            println!("{}", usbmux::pretty_print_dictionary(&device.properties));
        } else {
            println!("{}", describe(device));
        }
    }

    if !matches.get_flag("listen") {
        client.close().await;
        return;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let current: HashMap<String, DeviceRecord> = match client.get_devices().await {
            Ok(d) => d,
            Err(e) => {
                eprintln!("usbmuxd went away: {e}");
                HashMap::new()
            }
        };
        for (id, device) in &current {
            if !known.contains_key(id) {
                println!("+ {}", describe(device));
            }
        }
        for (id, device) in &known {
            if !current.contains_key(id) {
                println!("- {}", describe(device));
            }
        }
        known = current;
    }
    client.close().await;
}
