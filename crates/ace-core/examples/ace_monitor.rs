//! ACE Hub Monitor
//!
//! Connects to an ACE hub, prints its identity and slot table, then keeps
//! printing status changes until interrupted.
//!
//! Usage:
//!   cargo run --example ace_monitor -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: auto-detect)
//!   --config FILE     JSON config file
//!   --list            List serial ports and exit
//!   --park SLOT       Park SLOT to the toolhead once it reports ready
//!
//! Set RUST_LOG=ace_core=debug to see frame traffic.

use std::time::Duration;

use ace_core::prelude::*;
use ace_core::protocol::serial::list_ports;
use ace_core::runtime;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ace_core=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port = None;
    let mut config_path = None;
    let mut park = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                port = args.get(i).cloned();
            }
            "--config" | "-c" => {
                i += 1;
                config_path = args.get(i).cloned();
            }
            "--park" => {
                i += 1;
                park = args.get(i).and_then(|s| s.parse::<u8>().ok());
            }
            "--list" | "-l" => {
                for info in list_ports() {
                    let marker = if info.is_ace() { "*" } else { " " };
                    println!(
                        "{} {} {}",
                        marker,
                        info.name,
                        info.product.as_deref().unwrap_or("")
                    );
                }
                return;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }

    if let Err(e) = run(port, config_path, park).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(
    port: Option<String>,
    config_path: Option<String>,
    park: Option<u8>,
) -> Result<(), AceError> {
    let mut config = match config_path {
        Some(path) => AceConfig::from_file(path)?,
        None => AceConfig::default(),
    };
    if port.is_some() {
        config.serial = port;
    }

    let transport = serial_transport(&config)?;
    let (tx, mut notifications) = mpsc::unbounded_channel();
    let device = AceDevice::new(
        config,
        Box::new(transport),
        Box::new(tx),
        TokioTimers::new(TokioClock),
    )?;
    let (ace, task) = runtime::spawn(device);

    let mut last: Option<DeviceStatus> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut parked = park.is_none();

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(n) => println!(">> {}", n),
                None => break,
            },
            _ = ticker.tick() => {
                let status = ace.status().await?;
                if last.as_ref() != Some(&status) {
                    print_status(&status);
                    last = Some(status.clone());
                }
                // slot table is only known after the first status poll
                if let Some(slot) = park.filter(|&slot| !parked && status.is_slot_ready(slot)) {
                    match ace.park_to_toolhead(slot).await {
                        Ok(_) => println!("Parking slot {}", slot),
                        Err(e) => eprintln!("Park of slot {} not started: {}", slot, e),
                    }
                    parked = true;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ace.shutdown().await?;
    let _ = task.await;
    Ok(())
}

fn print_status(status: &DeviceStatus) {
    println!(
        "status={:?} temp={:.1} assist={} dryer={}",
        status.status, status.temp, status.feed_assist_count, status.dryer.status
    );
    for slot in &status.slots {
        println!(
            "  [{}] {:<6} {:<4} {:<12} #{:02x}{:02x}{:02x}",
            slot.index,
            String::from(slot.status.clone()),
            slot.material,
            slot.sku,
            slot.color[0],
            slot.color[1],
            slot.color[2]
        );
    }
}
