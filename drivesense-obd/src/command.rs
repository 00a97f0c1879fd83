//! Static command vocabulary and the monitored-parameter table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decode::Formula;

/// PID-decimal value of commands that are not parameter queries
pub const NO_PID: i16 = -1;

/// An ASCII request understood by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    /// Text sent to the adapter, without the `\r` terminator
    pub code: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// PID in decimal, or [`NO_PID`] for AT commands
    pub pid: i16,
}

impl Command {
    const fn at(code: &'static str, name: &'static str) -> Self {
        Self {
            code,
            name,
            pid: NO_PID,
        }
    }

    const fn mode01(code: &'static str, name: &'static str, pid: i16) -> Self {
        Self { code, name, pid }
    }

    pub const RESET: Self = Self::at("ATZ", "Reset");
    pub const DISABLE_ECHO: Self = Self::at("ATE0", "DisableEcho");
    pub const AUTO_PROTOCOL: Self = Self::at("ATSP0", "AutoSelectProtocol");
    pub const HEADERS_ON: Self = Self::at("ATH1", "HeadOn");

    pub const SUPPORTED_01_20: Self = Self::mode01("0100", "Check1to32pid", 0);
    pub const SUPPORTED_21_40: Self = Self::mode01("0120", "Check33to64pid", 32);
    pub const SUPPORTED_41_60: Self = Self::mode01("0140", "Check65to96pid", 64);
    pub const SUPPORTED_61_80: Self = Self::mode01("0160", "Check97to128pid", 96);
    pub const SUPPORTED_81_A0: Self = Self::mode01("0180", "Check129to160pid", 128);
    pub const SUPPORTED_A1_C0: Self = Self::mode01("01A0", "Check161to192pid", 160);
    pub const SUPPORTED_C1_E0: Self = Self::mode01("01C0", "Check193to224pid", 192);

    /// Whether this is an AT (adapter control) command
    pub fn is_at(&self) -> bool {
        self.pid == NO_PID
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}

/// Range queries issued by availability discovery, in order
pub const RANGE_QUERIES: [Command; 5] = [
    Command::SUPPORTED_01_20,
    Command::SUPPORTED_21_40,
    Command::SUPPORTED_41_60,
    Command::SUPPORTED_61_80,
    Command::SUPPORTED_81_A0,
];

/// A vehicle parameter that can be monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    EngineSpeed,
    VehicleSpeed,
    IntakeAirTemperature,
    ThrottlePosition,
    CommandedAirFuelEqRatio,
    AmbientAirTemperature,
    EngineFuelRate,
    IntakeManifoldAbsolutePressure,
}

/// Row of the parameter table
#[derive(Debug, Clone, Copy)]
pub struct ParameterSpec {
    pub parameter: Parameter,
    pub command: Command,
    pub formula: Formula,
    pub unit: &'static str,
}

/// Every monitorable parameter with its query and decode rule
pub const PARAMETERS: [ParameterSpec; 8] = [
    ParameterSpec {
        parameter: Parameter::EngineSpeed,
        command: Command::mode01("010C", "EngineSpeed", 12),
        formula: Formula::EngineSpeed,
        unit: "rpm",
    },
    ParameterSpec {
        parameter: Parameter::VehicleSpeed,
        command: Command::mode01("010D", "VehicleSpeed", 13),
        formula: Formula::Normal,
        unit: "km/h",
    },
    ParameterSpec {
        parameter: Parameter::IntakeAirTemperature,
        command: Command::mode01("010F", "IntakeAirTemperature", 15),
        formula: Formula::Temperature,
        unit: "°C",
    },
    ParameterSpec {
        parameter: Parameter::ThrottlePosition,
        command: Command::mode01("0111", "ThrottlePosition", 17),
        formula: Formula::ThrottlePosition,
        unit: "%",
    },
    ParameterSpec {
        parameter: Parameter::CommandedAirFuelEqRatio,
        command: Command::mode01("0144", "CommandedAirFuelEqRatio", 68),
        formula: Formula::CommandedAirFuelRatio,
        unit: "ratio",
    },
    ParameterSpec {
        parameter: Parameter::AmbientAirTemperature,
        command: Command::mode01("0146", "AmbientAirTemperature", 70),
        formula: Formula::Temperature,
        unit: "°C",
    },
    ParameterSpec {
        parameter: Parameter::EngineFuelRate,
        command: Command::mode01("015E", "EngineFuelRate", 94),
        formula: Formula::EngineFuelRate,
        unit: "L/h",
    },
    ParameterSpec {
        parameter: Parameter::IntakeManifoldAbsolutePressure,
        command: Command::mode01("0187", "IntakeManifoldAbsolutePressure", 135),
        formula: Formula::NoFormula,
        unit: "kPa",
    },
];

impl Parameter {
    /// All parameters in table order
    pub fn all() -> impl Iterator<Item = Parameter> {
        PARAMETERS.iter().map(|spec| spec.parameter)
    }

    /// Table row for this parameter
    pub fn spec(self) -> &'static ParameterSpec {
        // Table order matches declaration order
        &PARAMETERS[self as usize]
    }

    pub fn command(self) -> Command {
        self.spec().command
    }

    pub fn formula(self) -> Formula {
        self.spec().formula
    }

    pub fn name(self) -> &'static str {
        self.spec().command.name
    }

    pub fn unit(self) -> &'static str {
        self.spec().unit
    }

    /// Look a parameter up by its name or request code (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        PARAMETERS
            .iter()
            .find(|spec| {
                spec.command.name.eq_ignore_ascii_case(name)
                    || spec.command.code.eq_ignore_ascii_case(name)
            })
            .map(|spec| spec.parameter)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
