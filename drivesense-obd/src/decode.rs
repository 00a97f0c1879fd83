//! Bit extraction from engine ECU replies and the per-parameter formulas.
//!
//! Replies are read with headers on (`ATH1`), so every data line starts
//! with the responding ECU's CAN identifier, then the PCI length byte, the
//! echoed mode + PID, and finally the data bytes:
//!
//! ```text
//! 7E8 04 41 0C 1A F8
//! 18 DA F1 58 04 41 0C 1A F8
//! ```

use log::{debug, warn};
use smallvec::SmallVec;

use crate::assembler::RawResponse;
use crate::command::Parameter;
use crate::store::UNAVAILABLE;

/// Header prefixes identifying the engine ECU, compared with whitespace removed
pub const ENGINE_ECU_HEADERS: [&str; 2] = ["18DAF158", "7E8"];

/// Mode 01 positive response byte
const MODE01_RESPONSE: u8 = 0x41;

/// Data bytes of one ECU line
pub type Payload = SmallVec<[u8; 8]>;

/// Flat, most-significant-bit-first bit sequence decoded from hex bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSequence(SmallVec<[bool; 32]>);

impl BitSequence {
    /// Expand each byte into 8 bits, most significant first
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(
            bytes
                .iter()
                .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bit at `index`, `None` past the end
    pub fn get(&self, index: usize) -> Option<bool> {
        self.0.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().copied()
    }

    /// Pack the bits back into bytes. A trailing partial byte is padded
    /// with zero bits on the right.
    pub fn to_bytes(&self) -> Payload {
        self.0
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &bit)| acc | (u8::from(bit) << (7 - i)))
            })
            .collect()
    }

    /// The whole sequence read as one unsigned big-endian integer.
    /// Only the last 64 bits count; no reply carries more.
    pub fn value(&self) -> u64 {
        self.iter()
            .fold(0u64, |acc, bit| acc.wrapping_shl(1) | u64::from(bit))
    }
}

/// Decode space-separated (or packed) hex bytes into bits
pub fn hex_to_bits(hex: &str) -> Option<BitSequence> {
    let packed: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    match hex::decode(&packed) {
        Ok(bytes) => Some(BitSequence::from_bytes(&bytes)),
        Err(e) => {
            warn!("Can't convert hex {hex:?} to bits: {e}");
            None
        }
    }
}

/// Inverse of [`hex_to_bits`]: uppercase hex bytes separated by spaces
pub fn bits_to_hex(bits: &BitSequence) -> String {
    bits.to_bytes()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Echoed PID and data bytes of a single line if it came from the engine ECU.
///
/// Strips the header, bounds the frame by its PCI length byte and splits off
/// the mode byte. Returns `None` for other ECUs and malformed lines.
pub fn engine_line_frame(line: &str) -> Option<(u8, Payload)> {
    let packed: String = line
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();

    let rest = ENGINE_ECU_HEADERS
        .iter()
        .find_map(|header| packed.strip_prefix(header))?;

    let bytes = match hex::decode(rest) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Malformed engine ECU line {line:?}: {e}");
            return None;
        }
    };

    let (&pci, frame) = bytes.split_first()?;
    let frame = if frame.len() >= usize::from(pci) {
        &frame[..usize::from(pci)]
    } else {
        warn!(
            "PCI byte mismatch: PCI={pci}, actual data bytes={}, line={line}",
            frame.len()
        );
        frame
    };

    match frame {
        [MODE01_RESPONSE, pid, data @ ..] => Some((*pid, data.iter().copied().collect())),
        _ => {
            warn!("Didn't find mode 01 response in {line:?}");
            None
        }
    }
}

/// Data bytes of a single line if it came from the engine ECU
pub fn engine_line_payload(line: &str) -> Option<Payload> {
    engine_line_frame(line).map(|(_, payload)| payload)
}

/// Offsets (in packed hex digits) at which a `41 <pid>` frame may start:
/// no header, 11-bit CAN header + PCI, 3-byte J1850/ISO header, 29-bit CAN
/// header + PCI
const FRAME_OFFSETS: [usize; 4] = [0, 5, 6, 10];

/// Whether any line of `response`, from any ECU, is a mode 01 reply for `pid`
pub fn echoes_pid(response: &RawResponse, pid: u8) -> bool {
    let frame = format!("41{pid:02X}");
    response.lines().iter().any(|line| {
        let packed: String = line
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        packed.chars().all(|c| c.is_ascii_hexdigit())
            && FRAME_OFFSETS
                .iter()
                .any(|&offset| packed.get(offset..offset + frame.len()) == Some(frame.as_str()))
    })
}

/// PID requested by a mode 01 command such as `010C`
pub fn requested_pid(command: &str) -> Option<u8> {
    match command.as_bytes() {
        [b'0', b'1', _, _] => u8::from_str_radix(&command[2..], 16).ok(),
        _ => None,
    }
}

/// Data bytes of the first engine ECU line in `response`
pub fn engine_payload(response: &RawResponse) -> Option<Payload> {
    response.lines().iter().find_map(|line| engine_line_payload(line))
}

/// Bits of the engine ECU's data; empty when no engine line is present
pub fn extract_bits(response: &RawResponse) -> BitSequence {
    engine_payload(response)
        .map(|payload| BitSequence::from_bytes(&payload))
        .unwrap_or_default()
}

/// Physical value of `parameter` in `response`, or [`UNAVAILABLE`] when the
/// engine ECU line is missing
pub fn decode_value(parameter: Parameter, response: &RawResponse) -> f64 {
    let bits = extract_bits(response);
    if bits.is_empty() {
        debug!("{parameter}: no engine ECU data in {:?}", response.lines());
        return UNAVAILABLE;
    }
    parameter.formula().apply(&bits)
}

/// Decode rule for a parameter, applied to the data bits as one unsigned
/// big-endian integer `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formula {
    /// `A`
    Normal,
    /// `A / 4`
    EngineSpeed,
    /// `100 / 255 * A`
    ThrottlePosition,
    /// `2 / 65536 * A`
    CommandedAirFuelRatio,
    /// `A / 20`
    EngineFuelRate,
    /// `A - 40`
    Temperature,
    /// Passed through unscaled
    NoFormula,
}

impl Formula {
    /// `(scale, offset)` such that value = scale * A + offset
    pub fn coefficients(self) -> (f64, f64) {
        match self {
            Self::Normal | Self::NoFormula => (1.0, 0.0),
            Self::EngineSpeed => (0.25, 0.0),
            Self::ThrottlePosition => (100.0 / 255.0, 0.0),
            Self::CommandedAirFuelRatio => (2.0 / 65536.0, 0.0),
            Self::EngineFuelRate => (0.05, 0.0),
            Self::Temperature => (1.0, -40.0),
        }
    }

    /// Physical value of `bits`. An empty sequence reads as `A = 0`.
    #[allow(clippy::cast_precision_loss)] // OBD payloads are at most 32 bits here
    pub fn apply(self, bits: &BitSequence) -> f64 {
        if self == Self::NoFormula {
            debug!("No formula for {} bits, passing through", bits.len());
        }
        let (scale, offset) = self.coefficients();
        scale * bits.value() as f64 + offset
    }
}
