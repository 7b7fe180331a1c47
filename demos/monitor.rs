//! Connect to an EVT800 logger and print every telemetry report.
//!
//! ```console
//! cargo run --example monitor -- 192.168.2.66 14889
//! ```

use std::sync::Arc;

use envertech_evt800::{Evt800Builder, ReportCallback, Result, TelemetryReport};
use simple_logger::init_with_level;

const DEFAULT_ADDR: &str = "192.168.2.66";
const DEFAULT_PORT: u16 = 14889;

/// Print one report as an aligned table.
fn print_table(report: &TelemetryReport) {
    println!("{:>20}{:>25}", "sw_version", report.sw_version);
    println!("{:>20}{:>25}", "received_at", report.received_at.to_string());
    for channel in &report.channels {
        println!("{:>20}{:>25}", "id", channel.id);
        println!("{:>20}{:>25.3}", "input_voltage", channel.input_voltage);
        println!("{:>20}{:>25.3}", "power", channel.power);
        println!("{:>20}{:>25.3}", "ac_voltage", channel.ac_voltage);
        println!("{:>20}{:>25.3}", "ac_frequency", channel.ac_frequency);
        println!("{:>20}{:>25.3}", "temperature", channel.temperature);
        println!("{:>20}{:>25.3}", "total_energy", channel.total_energy);
        println!("{:>20}{:>25.3}", "current", channel.current);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_with_level(log::Level::Debug).expect("Failed to set up the logger.");

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let port = args
        .next()
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let callback: ReportCallback = Arc::new(|report| print_table(&report));
    let mut device = Evt800Builder::new(&addr, port).on_report(callback).build();
    device.start();

    tokio::signal::ctrl_c().await?;
    device.stop().await?;

    if let Some(serial) = device.serial_number() {
        println!("Logger serial number: {}", serial);
    }
    Ok(())
}
