// Jackson Coxson
// Reads lockdown values from a device without pairing

use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::common_args(
        Command::new("usbmux_info")
            .about("Get information from a device through lockdown")
            .arg(
                Arg::new("udid")
                    .short('u')
                    .long("udid")
                    .value_name("UDID")
                    .help("Device ID or serial number (default: first USB device)"),
            )
            .arg(
                Arg::new("key")
                    .short('k')
                    .long("key")
                    .value_name("KEY")
                    .help("Only print this value, e.g. ProductVersion"),
            ),
    )
    .get_matches();

    let client = match common::get_client(&matches, "usbmux_info") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let devices = match client.get_devices().await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Unable to reach usbmuxd: {e}");
            return;
        }
    };
    let device = match common::find_device(&devices, matches.get_one::<String>("udid")) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            client.close().await;
            return;
        }
    };

    match matches.get_one::<String>("key") {
        Some(key) => match client.query_device_value(device.device_id, key).await {
            Ok(value) => println!("{}", usbmux::pretty_print_plist(&value)),
            Err(e) => eprintln!("Unable to read {key}: {e}"),
        },
        None => match client.query_all_device_values(device.device_id).await {
            Ok(values) => println!("{}", usbmux::pretty_print_dictionary(&values)),
            Err(e) => eprintln!("Unable to read device values: {e}"),
        },
    }

    client.close().await;
}
