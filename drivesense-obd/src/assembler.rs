//! Reassembly of notification chunks into complete adapter responses.
//!
//! The adapter streams its reply in arbitrary pieces and marks the end with
//! the `>` prompt. [`ResponseAssembler`] owns the byte buffer; nothing else
//! reads it.

use log::{debug, warn};
use smallvec::SmallVec;

/// Prompt byte the adapter sends when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Replies the adapter itself produces instead of ECU data
const ADAPTER_STATUSES: [&str; 12] = [
    "NO DATA",
    "?",
    "STOPPED",
    "ERROR",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "BUS INIT",
    "UNABLE TO CONNECT",
    "BUFFER FULL",
    "DATA ERROR",
    "FB ERROR",
];

/// Trimmed, non-empty lines of one reply, prompt line removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    lines: SmallVec<[String; 4]>,
}

impl RawResponse {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// First line reports `NO DATA` (any case)
    pub fn is_no_data(&self) -> bool {
        self.first_line()
            .is_some_and(|line| line.to_ascii_uppercase().contains("NO DATA"))
    }

    /// Some line is an adapter status such as `NO DATA`, `?` or
    /// `UNABLE TO CONNECT` rather than ECU data
    pub fn is_adapter_status(&self) -> bool {
        self.lines.iter().any(|line| {
            let line = line.to_ascii_uppercase();
            ADAPTER_STATUSES.iter().any(|status| line.starts_with(status))
        })
    }

    /// Some line is exactly `OK`
    pub fn contains_ok(&self) -> bool {
        self.lines.iter().any(|line| line.eq_ignore_ascii_case("OK"))
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into_vec()
    }
}

/// Accumulates chunks until the prompt arrives.
///
/// The buffer is tagged with the request generation its bytes belong to.
/// Retagging with a different generation drops whatever was buffered, so
/// a straggler from a timed-out request never prefixes the next reply.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buffer: Vec<u8>,
    generation: Option<u64>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation the buffered bytes belong to
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Bytes waiting for a prompt
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Attribute following chunks to `generation`
    pub fn retag(&mut self, generation: Option<u64>) {
        if self.generation != generation {
            if !self.buffer.is_empty() {
                debug!(
                    "Dropping {} stale bytes from generation {:?}",
                    self.buffer.len(),
                    self.generation
                );
            }
            self.buffer.clear();
            self.generation = generation;
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append `chunk`; return the completed response once the prompt is seen.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<RawResponse> {
        self.buffer.extend_from_slice(chunk);

        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text,
            // Incomplete sequence at the end: wait for the rest
            Err(e) if e.error_len().is_none() => return None,
            Err(e) => {
                warn!("Dropping {} undecodable response bytes: {e}", self.buffer.len());
                self.buffer.clear();
                return None;
            }
        };

        if !text.contains(char::from(PROMPT)) {
            return None;
        }

        let mut lines: SmallVec<[String; 4]> = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        // Last line is the prompt
        lines.pop();

        self.buffer.clear();
        debug!("Complete response: {lines:?}");
        Some(RawResponse { lines })
    }
}
