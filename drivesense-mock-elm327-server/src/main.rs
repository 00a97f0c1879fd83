//! Mock ELM327 adapter over TCP
//!
//! Usage: cargo run -p drivesense-mock-elm327-server -- [OPTIONS]
//! Then point the collector at 127.0.0.1:35000 (`"kind": "tcp"`).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use drivesense_elm327_lib::{CanAddressing, Elm327Emulator, SimulatedVehicle};
use log::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "drivesense-mock-elm327")]
#[command(about = "Emulate an ELM327 adapter connected to a running car")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    bind: String,

    /// Use 29-bit CAN identifiers (18 DA F1 58) in headers
    #[arg(short, long)]
    extended: bool,

    /// Only the engine ECU answers the supported-PID query
    #[arg(long)]
    no_secondary_ecu: bool,

    /// PIDs (hex) the engine ECU answers with NO DATA, e.g. `0D,46`
    #[arg(short, long, value_delimiter = ',', value_parser = parse_pid)]
    refuse: Vec<u8>,
}

fn parse_pid(s: &str) -> Result<u8, String> {
    let s = s.trim().trim_start_matches("0x");
    u8::from_str_radix(s, 16).map_err(|e| format!("invalid PID {s:?}: {e}"))
}

impl Args {
    fn vehicle(&self) -> SimulatedVehicle {
        SimulatedVehicle {
            addressing: if self.extended {
                CanAddressing::Extended
            } else {
                CanAddressing::Standard
            },
            secondary_ecu: !self.no_secondary_ecu,
            refused_pids: self.refuse.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let vehicle = args.vehicle();
    if !vehicle.refused_pids.is_empty() {
        info!("Refusing PIDs {}", hex::encode_upper(&vehicle.refused_pids));
    }

    let listener =
        TcpListener::bind(&args.bind).with_context(|| format!("Failed to bind {}", args.bind))?;
    info!("Mock ELM327 ready on {} ({:?} addressing)", args.bind, vehicle.addressing);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let emulator = Elm327Emulator::new(vehicle.clone());
                std::thread::spawn(move || handle_client(stream, emulator));
            }
            Err(e) => warn!("Connection error: {e}"),
        }
    }
    Ok(())
}

fn handle_client(mut stream: TcpStream, mut emulator: Elm327Emulator) {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    let start_time = Instant::now();

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => match byte[0] {
                b'\r' => {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();
                    buffer.clear();
                    if command.is_empty() {
                        continue;
                    }

                    debug!("RX: {command}");
                    let response = emulator.respond(&command, start_time.elapsed());
                    debug!("TX: {}", response.escape_debug());

                    if let Err(e) = stream.write_all(response.as_bytes()) {
                        warn!("Write error: {e}");
                        break;
                    }
                }
                // Linefeeds are ignored
                b'\n' => {}
                ch => buffer.push(ch),
            },
            Err(e) => {
                warn!("Read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("0D"), Ok(0x0D));
        assert_eq!(parse_pid("0x46"), Ok(0x46));
        assert!(parse_pid("XYZ").is_err());
    }

    #[test]
    fn test_args_build_vehicle() {
        let args = Args::parse_from(["drivesense-mock-elm327", "--extended", "--no-secondary-ecu", "-r", "0D,46"]);
        let vehicle = args.vehicle();
        assert_eq!(vehicle.addressing, CanAddressing::Extended);
        assert!(!vehicle.secondary_ecu);
        assert_eq!(vehicle.refused_pids, [0x0D, 0x46]);
    }
}
