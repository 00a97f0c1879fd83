//! ELM327 adapter emulation for exercising OBD-II clients without a car.
//!
//! [`ClientState`] tracks the per-connection AT settings (echo, linefeeds,
//! spaces, headers) and formats replies the way a real adapter does.
//! [`SimulatedVehicle`] answers mode 01 queries for an engine ECU and,
//! optionally, a second ECU that only answers the supported-PID query so
//! clients have to pick the right line out of a multi-ECU reply.

use std::fmt::Write as _;
use std::time::Duration;

/// CAN addressing used when headers are shown (ATH1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanAddressing {
    /// 11-bit identifiers, engine ECU replies as `7E8`
    #[default]
    Standard,
    /// 29-bit identifiers, engine ECU replies as `18 DA F1 58`
    Extended,
}

impl CanAddressing {
    /// Header bytes/nibbles of the engine ECU reply, already split into tokens
    fn engine_header(self) -> &'static [&'static str] {
        match self {
            Self::Standard => &["7E8"],
            Self::Extended => &["18", "DA", "F1", "58"],
        }
    }

    /// Header of the secondary (transmission) ECU reply
    fn secondary_header(self) -> &'static [&'static str] {
        match self {
            Self::Standard => &["7E9"],
            Self::Extended => &["18", "DA", "F1", "59"],
        }
    }
}

/// Per-connection client state (ELM327 settings)
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct ClientState {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show header bytes in responses (ATH0/ATH1)
    pub headers_enabled: bool,
    /// Whether a protocol has been selected (ATSPx)
    pub protocol_selected: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            protocol_selected: false,
        }
    }
}

impl ClientState {
    /// Create a new client state with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a line ending based on current settings
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Handle an AT command and return the response, including the prompt
    /// Mutates the state if the command changes settings
    pub fn handle_at_command(&mut self, command: &str) -> String {
        let cmd = command.trim().to_uppercase();
        let le = self.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" | "ATWS" => {
                *self = ClientState::default();
                let le = self.line_ending();
                return format!("{le}{le}ELM327 v1.5{le}{le}>");
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK"
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK"
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK"
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK"
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK"
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK"
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK"
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK"
            }
            _ if cmd.starts_with("ATSP") => {
                self.protocol_selected = true;
                "OK"
            }
            _ if cmd.starts_with("ATST") || cmd.starts_with("ATAT") => "OK",
            "ATI" => "ELM327 v1.5",
            "ATDP" => "AUTO, ISO 15765-4 (CAN 11/500)",
            _ => "?",
        };

        // Commands that change the linefeed setting answer with the OLD setting
        format!("{le}{response_text}{le}{le}>")
    }

    /// Format one ECU frame: optional header, PCI length byte, then payload
    fn format_frame(&self, header: &[&str], payload: &[u8]) -> String {
        let mut tokens: Vec<String> = Vec::with_capacity(header.len() + payload.len() + 1);
        if self.headers_enabled {
            tokens.extend(header.iter().map(ToString::to_string));
            tokens.push(format!("{:02X}", payload.len()));
        }
        tokens.extend(payload.iter().map(|b| format!("{b:02X}")));

        if self.spaces_enabled {
            tokens.join(" ")
        } else {
            tokens.concat()
        }
    }

    /// Handle any command (AT or OBD) against `vehicle` and return the full
    /// reply text ending in the `>` prompt. Echo is not included.
    pub fn handle_command(
        &mut self,
        command: &str,
        vehicle: &SimulatedVehicle,
        elapsed: Duration,
    ) -> String {
        let cmd = command.trim().to_uppercase();
        if cmd.starts_with("AT") {
            return self.handle_at_command(&cmd);
        }

        let le = self.line_ending();
        let Some((mode, pid)) = parse_mode01(&cmd) else {
            return format!("?{le}{le}>");
        };
        if mode != 0x01 {
            return format!("NO DATA{le}{le}>");
        }

        let mut reply = String::new();
        match vehicle.engine_data(pid, elapsed) {
            Some(data) => {
                let mut payload = vec![0x41, pid];
                payload.extend_from_slice(&data);
                let _ = write!(
                    reply,
                    "{}{le}",
                    self.format_frame(vehicle.addressing.engine_header(), &payload)
                );
            }
            None => return format!("NO DATA{le}{le}>"),
        }

        if let Some(data) = vehicle.secondary_data(pid) {
            let mut payload = vec![0x41, pid];
            payload.extend_from_slice(&data);
            let _ = write!(
                reply,
                "{}{le}",
                self.format_frame(vehicle.addressing.secondary_header(), &payload)
            );
        }

        format!("{reply}{le}>")
    }
}

/// Parse `01XX` into (mode, pid). Longer multi-PID requests are not emulated.
fn parse_mode01(cmd: &str) -> Option<(u8, u8)> {
    if cmd.len() != 4 {
        return None;
    }
    let bytes = hex::decode(cmd).ok()?;
    Some((bytes[0], bytes[1]))
}

/// A car with an engine ECU answering a fixed set of mode 01 PIDs.
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    /// CAN addressing shown in headers
    pub addressing: CanAddressing,
    /// Whether a transmission ECU also answers the 0100 query
    pub secondary_ecu: bool,
    /// PIDs the engine ECU refuses with `NO DATA` even though advertised
    pub refused_pids: Vec<u8>,
}

impl Default for SimulatedVehicle {
    fn default() -> Self {
        Self {
            addressing: CanAddressing::Standard,
            secondary_ecu: true,
            refused_pids: Vec::new(),
        }
    }
}

impl SimulatedVehicle {
    /// Engine ECU data bytes for `pid`, or `None` for `NO DATA`
    pub fn engine_data(&self, pid: u8, elapsed: Duration) -> Option<Vec<u8>> {
        if self.refused_pids.contains(&pid) {
            return None;
        }
        let data = match pid {
            0x00 => vec![0xBE, 0x3F, 0xA8, 0x13], // PIDs supported 01-20
            0x20 => vec![0x80, 0x00, 0x00, 0x01], // PIDs supported 21-40
            0x40 => vec![0x14, 0x00, 0x00, 0x05], // PIDs supported 41-60
            0x60 => vec![0x00, 0x00, 0x00, 0x01], // PIDs supported 61-80
            0x80 => vec![0x02, 0x00, 0x00, 0x00], // PIDs supported 81-A0
            0x0C => rpm_value(elapsed).to_be_bytes().to_vec(),
            0x0D => vec![0x28],       // Speed: 40 km/h
            0x0F => vec![0x38],       // Intake air temp: 16°C
            0x11 => vec![0x45],       // Throttle: 27%
            0x44 => vec![0x80, 0x00], // Commanded equivalence ratio: 1.0
            0x46 => vec![0x3C],       // Ambient air temp: 20°C
            0x5E => vec![0x00, 0x64], // Fuel rate: 5 L/h
            0x87 => vec![0x00, 0x65], // Intake manifold pressure
            _ => return None,
        };
        Some(data)
    }

    /// Transmission ECU data; it only answers the first supported-PID query
    fn secondary_data(&self, pid: u8) -> Option<Vec<u8>> {
        (self.secondary_ecu && pid == 0x00).then(|| vec![0x98, 0x18, 0x00, 0x01])
    }
}

/// Raw 010C value (RPM * 4) ramping between idle and 3500 RPM
pub fn rpm_value(elapsed: Duration) -> u16 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let phase = elapsed.as_secs_f32() % CYCLE_TIME;

    let rpm = if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // bounded by MAX_RPM * 4
    let raw = (rpm * 4.0) as u16;
    raw
}

/// Emulated adapter: AT state plus the vehicle behind it.
///
/// Commands arrive without the `\r` terminator; the reply includes the echo
/// when echo is enabled, exactly as the adapter would stream it.
#[derive(Debug, Clone, Default)]
pub struct Elm327Emulator {
    pub state: ClientState,
    pub vehicle: SimulatedVehicle,
}

impl Elm327Emulator {
    pub fn new(vehicle: SimulatedVehicle) -> Self {
        Self {
            state: ClientState::default(),
            vehicle,
        }
    }

    /// Produce the full byte stream the adapter sends back for `command`
    pub fn respond(&mut self, command: &str, elapsed: Duration) -> String {
        let command = command.trim_end_matches(['\r', '\n']);
        let echo = if self.state.echo_enabled {
            format!("{command}\r")
        } else {
            String::new()
        };
        let reply = self.state.handle_command(command, &self.vehicle, elapsed);
        log::debug!("emulator {command:?} -> {reply:?}");
        format!("{echo}{reply}")
    }
}
