// Jackson Coxson
// Forwards local TCP ports to ports on a device

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use clap::{Arg, Command};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use usbmux::UsbmuxClient;

mod common;

#[derive(Debug, Clone, Copy)]
struct PortPair {
    local_port: u16,
    device_port: u16,
}

fn parse_port_pair(arg: &str) -> Result<PortPair, String> {
    let Some((local, device)) = arg.split_once(':') else {
        return Err(format!("Invalid port pair format: {arg}"));
    };
    let local_port = local
        .parse::<u16>()
        .map_err(|_| format!("Invalid local port: {local}"))?;
    let device_port = device
        .parse::<u16>()
        .map_err(|_| format!("Invalid device port: {device}"))?;
    if local_port == 0 || device_port == 0 {
        return Err("Ports cannot be 0".into());
    }
    Ok(PortPair {
        local_port,
        device_port,
    })
}

async fn handle_client(
    mut stream: TcpStream,
    client: Arc<UsbmuxClient>,
    udid: Option<Arc<String>>,
    device_port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let peer = stream.peer_addr()?;
    info!("Accepted new connection from {peer}");

    let devices = client.get_devices().await?;
    let device = common::find_device(&devices, udid.as_deref())?;
    info!(
        "Requesting connection to device {} ({:?}), port {device_port}",
        device.device_id,
        device.connection()
    );
    let mut tunnel = client
        .create_device_tunnel(device.device_id, device_port)
        .await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut tunnel).await {
        Ok((up, down)) => debug!("{peer}: {up} bytes to device, {down} bytes back"),
        Err(e) => debug!("{peer}: forwarding stopped: {e}"),
    }
    info!("Connection {peer} closed");
    Ok(())
}

async fn start_listener(
    pair: PortPair,
    source: IpAddr,
    client: Arc<UsbmuxClient>,
    udid: Option<Arc<String>>,
) -> Result<(), String> {
    let listener = TcpListener::bind(SocketAddr::new(source, pair.local_port))
        .await
        .map_err(|e| format!("Unable to bind port {}: {e}", pair.local_port))?;
    info!(
        "Creating listening port {} for device port {}",
        pair.local_port, pair.device_port
    );

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let client = client.clone();
                let udid = udid.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client, udid, pair.device_port).await {
                        error!("Failed to handle client connection: {e}");
                    }
                });
            }
            Err(e) => error!("Failed to accept connection: {e}"),
        }
    }
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::common_args(
        Command::new("usbmux_proxy")
            .about("Bind local TCP ports and forward them to ports on a usbmux device")
            .arg(
                Arg::new("udid")
                    .short('u')
                    .long("udid")
                    .value_name("UDID")
                    .help("Device ID or serial number (default: first USB device)"),
            )
            .arg(
                Arg::new("source")
                    .short('s')
                    .long("source")
                    .value_name("ADDR")
                    .help("Source address for listening sockets (default 127.0.0.1)"),
            )
            .arg(
                Arg::new("port_pairs")
                    .value_name("LOCAL_PORT:DEVICE_PORT")
                    .required(true)
                    .num_args(1..),
            ),
    )
    .get_matches();

    let source = match matches.get_one::<String>("source") {
        Some(s) => match s.parse::<IpAddr>() {
            Ok(a) => a,
            Err(e) => {
                eprintln!("Invalid source address {s}: {e}");
                return;
            }
        },
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };

    let mut pairs = Vec::new();
    for arg in matches.get_many::<String>("port_pairs").into_iter().flatten() {
        match parse_port_pair(arg) {
            Ok(p) => pairs.push(p),
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        }
    }

    let client = match common::get_client(&matches, "usbmux_proxy") {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let udid = matches.get_one::<String>("udid").cloned().map(Arc::new);

    let mut tasks = Vec::new();
    for pair in pairs {
        tasks.push(tokio::spawn(start_listener(
            pair,
            source,
            client.clone(),
            udid.clone(),
        )));
    }
    info!("Waiting for connections...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = async {
            for task in tasks {
                match task.await {
                    Ok(Err(e)) => error!("{e}"),
                    Err(e) => error!("Listener task failed: {e}"),
                    Ok(Ok(())) => {}
                }
            }
        } => {}
    }
    client.close().await;
}
