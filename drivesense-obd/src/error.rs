//! Error types for each layer of the OBD-II engine.
//!
//! Transport and dispatch errors travel one level up per call. Only the
//! polling loop swallows them (after logging), so a flaky PID never stops
//! collection.

use derive_more::{Display, Error, From};

/// Failures of the byte link to the adapter
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransportError {
    /// No device is bound, or the link has dropped
    #[display("Not connected to adapter")]
    NotConnected,
    /// The underlying adapter rejected the write
    #[display("Write rejected: {_0}")]
    WriteRejected(#[error(not(source))] String),
    /// Disconnect request failed
    #[display("Disconnect failed: {_0}")]
    Disconnect(#[error(not(source))] String),
}

/// Failures while establishing a link; terminal for that attempt
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ConnectionError {
    /// No Bluetooth adapter, or the radio is off/unauthorised
    #[display("Bluetooth unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The requested peripheral was not seen while scanning
    #[display("Peripheral not found: {_0}")]
    PeripheralNotFound(#[error(not(source))] String),
    /// Discovery finished without a matching write + notify pair
    #[display("No OBD-II write/notify characteristics on service {service}")]
    MissingCharacteristics { service: String },
    /// Connect, discovery or subscribe failed or timed out
    #[display("Connection failed: {_0}")]
    Failed(#[error(not(source))] String),
}

/// Outcome kinds of a single command round-trip other than success
#[derive(Debug, Clone, PartialEq, Eq, Display, Error, From)]
pub enum DispatchError {
    /// Another request is already in flight
    #[display("A command is already in progress")]
    Busy,
    /// No device or characteristics are bound
    #[display("Device not connected")]
    NotConnected,
    /// The transport refused the command bytes
    #[display("Write failed: {_0}")]
    #[from]
    Write(TransportError),
    /// No prompt arrived within the timeout
    #[display("Timed out waiting for response")]
    Timeout,
    /// The adapter reported `NO DATA` for the request
    #[display("No data")]
    NoData,
    /// The byte stream ended while the request was pending
    #[display("Adapter disconnected")]
    Disconnected,
}

impl DispatchError {
    /// Short label used in logs and statistics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::NotConnected => "not_connected",
            Self::Write(_) => "write",
            Self::Timeout => "timeout",
            Self::NoData => "no_data",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Why the initialisation handshake stopped
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum HandshakeError {
    /// A step's command failed at the dispatcher
    #[display("{step} failed: {source}")]
    Command {
        step: &'static str,
        source: DispatchError,
    },
    /// A step answered without the required `OK`
    #[display("{step} was not acknowledged: {lines:?}")]
    NotAcknowledged {
        step: &'static str,
        lines: Vec<String>,
    },
}

/// Configuration file problems
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("Config I/O error: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("Config parse error: {_0}")]
    #[from]
    Parse(serde_json::Error),
}

/// Failures of the connect → handshake → discovery sequence
#[derive(Debug, Clone, PartialEq, Eq, Display, Error, From)]
pub enum SessionError {
    #[display("{_0}")]
    #[from]
    Connection(ConnectionError),
    #[display("{_0}")]
    #[from]
    Dispatch(DispatchError),
    #[display("Handshake failed: {_0}")]
    #[from]
    Handshake(HandshakeError),
}
