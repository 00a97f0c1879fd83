//! Supported-PID discovery.
//!
//! Each range query (`0100`, `0120`, ...) answers with four bytes whose bits
//! flag the next 32 PIDs, most significant bit first: bit 0 of the `0100`
//! answer is PID 01, bit 31 is PID 20 (which also says whether `0120` is
//! worth asking).

use std::time::Duration;

use log::{debug, info, warn};
use num_integer::Integer;

use crate::assembler::RawResponse;
use crate::command::{Parameter, NO_PID, RANGE_QUERIES};
use crate::decode::{engine_payload, BitSequence};
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

/// PIDs covered by one range query
pub const PIDS_PER_RANGE: i16 = 32;

/// Data bytes of a range query answer
const RANGE_BYTES: usize = 4;

const RANGE_COUNT: usize = RANGE_QUERIES.len();

/// Support flags for PIDs 01-A0, one 32-bit range per query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityBitmap {
    ranges: [BitSequence; RANGE_COUNT],
}

impl AvailabilityBitmap {
    pub fn from_ranges(ranges: [BitSequence; RANGE_COUNT]) -> Self {
        Self { ranges }
    }

    /// Bits of range `index`; empty if the range was not answered
    pub fn range(&self, index: usize) -> Option<&BitSequence> {
        self.ranges.get(index)
    }

    /// Whether the engine ECU advertises `pid` (decimal).
    ///
    /// PID 0 and the [`NO_PID`] sentinel are never available. PIDs past the
    /// known ranges are looked up in the first range.
    pub fn is_pid_available(&self, pid: i16) -> bool {
        if pid == NO_PID || pid <= 0 {
            return false;
        }

        let (quotient, index) = (pid - 1).div_rem(&PIDS_PER_RANGE);
        let range = match usize::try_from(quotient) {
            Ok(q) if q < RANGE_COUNT => &self.ranges[q],
            _ => {
                warn!("PID {pid} is beyond the queried ranges, checking the first range");
                &self.ranges[0]
            }
        };

        usize::try_from(index)
            .ok()
            .and_then(|i| range.get(i))
            .unwrap_or(false)
    }

    pub fn is_available(&self, parameter: Parameter) -> bool {
        self.is_pid_available(parameter.command().pid)
    }

    /// Monitorable parameters the vehicle supports, in table order
    pub fn available_parameters(&self) -> Vec<Parameter> {
        Parameter::all().filter(|p| self.is_available(*p)).collect()
    }

    /// Every advertised PID
    pub fn supported_pids(&self) -> Vec<u8> {
        (1..=PIDS_PER_RANGE * RANGE_COUNT as i16)
            .filter(|&pid| self.is_pid_available(pid))
            .filter_map(|pid| u8::try_from(pid).ok())
            .collect()
    }
}

/// Bits of a range query answer; empty unless the engine line carries
/// exactly four data bytes
pub fn range_bits(response: &RawResponse) -> BitSequence {
    match engine_payload(response) {
        Some(payload) if payload.len() == RANGE_BYTES => BitSequence::from_bytes(&payload),
        Some(payload) => {
            warn!(
                "Expected {RANGE_BYTES} bytes in range answer, got {}: {:?}",
                payload.len(),
                response.lines()
            );
            BitSequence::default()
        }
        None => {
            warn!("No engine ECU line in range answer {:?}", response.lines());
            BitSequence::default()
        }
    }
}

/// Issue the five range queries in order and collect the bitmap.
///
/// A range answered with `NO DATA` is recorded as empty. Any other error
/// ends discovery.
pub async fn discover_availability(
    dispatcher: &Dispatcher,
    timeout: Duration,
) -> Result<AvailabilityBitmap, DispatchError> {
    let mut ranges: [BitSequence; RANGE_COUNT] = Default::default();

    for (slot, query) in ranges.iter_mut().zip(RANGE_QUERIES.iter()) {
        match dispatcher.send_with_timeout(query.code, timeout).await {
            Ok(response) => {
                *slot = range_bits(&response);
                debug!("{query}: {} bits", slot.len());
            }
            Err(DispatchError::NoData) => {
                debug!("{query}: no data");
            }
            Err(e) => {
                warn!("Availability discovery stopped at {query}: {e}");
                return Err(e);
            }
        }
    }

    let bitmap = AvailabilityBitmap::from_ranges(ranges);
    info!(
        "Vehicle supports {} PIDs, {} monitorable parameters",
        bitmap.supported_pids().len(),
        bitmap.available_parameters().len()
    );
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drivesense_elm327_lib::{Elm327Emulator, SimulatedVehicle};

    use super::*;
    use crate::decode::bits_to_hex;
    use crate::transport::{MockReply, MockTransport};

    fn bitmap_with_first_range(hex: &str) -> AvailabilityBitmap {
        let response = RawResponse::from_lines([format!("7E8 06 41 00 {hex}")]);
        let mut ranges: [BitSequence; RANGE_COUNT] = Default::default();
        ranges[0] = range_bits(&response);
        AvailabilityBitmap::from_ranges(ranges)
    }

    #[test]
    fn test_engine_speed_available_from_range_answer() {
        let bitmap = bitmap_with_first_range("BE 3C 00 00");
        let bits = bitmap.range(0).unwrap();
        assert_eq!(bits.len(), 32);

        // 12th bit of BE 3C 00 00
        assert_eq!(bits.get(11), Some(true));
        assert!(bitmap.is_available(Parameter::EngineSpeed));
        assert!(bitmap.is_pid_available(1));
        assert!(!bitmap.is_pid_available(2));
        assert!(!bitmap.is_pid_available(15));
        assert!(!bitmap.is_available(Parameter::ThrottlePosition));
    }

    #[test]
    fn test_range_boundaries() {
        let bitmap = bitmap_with_first_range("00 00 00 01");
        assert!(bitmap.is_pid_available(32));
        assert!(!bitmap.is_pid_available(31));
        assert!(!bitmap.is_pid_available(33));
    }

    #[test]
    fn test_bounds_never_panic() {
        let bitmap = bitmap_with_first_range("FF FF FF FF");
        for pid in 0..=255 {
            let _ = bitmap.is_pid_available(pid);
        }
        assert!(!bitmap.is_pid_available(NO_PID));
        assert!(!bitmap.is_pid_available(0));
        assert!(!bitmap.is_pid_available(i16::MIN));
        assert!(!AvailabilityBitmap::default().is_pid_available(12));
    }

    #[test]
    fn test_pid_past_known_ranges_uses_first_range() {
        let bitmap = bitmap_with_first_range("80 00 00 00");
        // (193 - 1) / 32 = 6, bit 0
        assert!(bitmap.is_pid_available(193));
        assert!(!bitmap.is_pid_available(194));
    }

    #[test]
    fn test_range_answer_must_have_four_bytes() {
        let short = RawResponse::from_lines(["7E8 05 41 00 BE 3C 00"]);
        assert!(range_bits(&short).is_empty());
        let missing = RawResponse::from_lines(["7E9 06 41 00 BE 3C 00 00"]);
        assert!(range_bits(&missing).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_against_emulator() {
        let mut emulator = Elm327Emulator::new(SimulatedVehicle::default());
        emulator.state.headers_enabled = true;
        emulator.state.echo_enabled = false;
        let transport = Arc::new(MockTransport::new(move |cmd| {
            MockReply::Respond(emulator.respond(cmd, Duration::ZERO))
        }));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();

        let bitmap = discover_availability(&dispatcher, Duration::from_secs(1)).await.unwrap();

        assert_eq!(transport.written(), ["0100", "0120", "0140", "0160", "0180"]);
        assert_eq!(bitmap.available_parameters(), Parameter::all().collect::<Vec<_>>());
        // 7E9 answers 98 18 00 01 to 0100 and must not be picked
        assert_eq!(bits_to_hex(bitmap.range(0).unwrap()), "BE 3F A8 13");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_range_is_empty() {
        let transport = Arc::new(MockTransport::new(|cmd| match cmd {
            "0100" => MockReply::Respond("7E8 06 41 00 BE 3C 00 01\r>".to_string()),
            _ => MockReply::Respond("NO DATA\r>".to_string()),
        }));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();

        let bitmap = discover_availability(&dispatcher, Duration::from_secs(1)).await.unwrap();

        assert_eq!(transport.written().len(), 5);
        assert!(bitmap.range(1).unwrap().is_empty());
        assert_eq!(
            bitmap.available_parameters(),
            [Parameter::EngineSpeed, Parameter::VehicleSpeed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_discovery() {
        let transport = Arc::new(MockTransport::new(|cmd| match cmd {
            "0100" => MockReply::Respond("7E8 06 41 00 BE 3C 00 01\r>".to_string()),
            _ => MockReply::Silent,
        }));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();

        let result = discover_availability(&dispatcher, Duration::from_secs(1)).await;

        assert_eq!(result, Err(DispatchError::Timeout));
        assert_eq!(transport.written(), ["0100", "0120"]);
    }
}
