//! OBD-II command/response engine for ELM327 adapters.
//!
//! Commands go down through [`Dispatcher`] to a [`Transport`]; replies come
//! back as byte chunks, are reassembled at the `>` prompt by the
//! [`ResponseAssembler`], and are decoded against the engine ECU's line.
//! [`Session`] runs the startup sequence (handshake, supported-PID
//! discovery) and hands out a [`Poller`] for continuous collection.

pub mod assembler;
pub mod availability;
pub mod command;
pub mod config;
pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod poller;
pub mod session;
pub mod store;
pub mod transport;

pub use assembler::{RawResponse, ResponseAssembler};
pub use availability::{discover_availability, AvailabilityBitmap};
pub use command::{Command, Parameter, PARAMETERS};
pub use config::{Config, LogLevel, TransportConfig};
pub use decode::{decode_value, extract_bits, BitSequence, Formula};
pub use dispatcher::Dispatcher;
pub use error::{
    ConfigError, ConnectionError, DispatchError, HandshakeError, SessionError, TransportError,
};
pub use handshake::{Handshake, HandshakeState};
pub use poller::{PollStats, Poller};
pub use session::{ConnectionStatus, Session};
pub use store::{CollectionFlag, MonitoredParameters, ValueSink, ValueStore, UNAVAILABLE};
pub use transport::Transport;
