//! Byte links to the adapter.
//!
//! A transport writes command bytes and hands out the stream of incoming
//! chunks exactly once. The stream ends when the link drops.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[cfg(feature = "ble")]
pub mod ble;
pub mod mock;
pub mod tcp;

#[cfg(feature = "ble")]
pub use ble::{BleProfile, BleTransport, DiscoveredPeripheral};
pub use mock::{MockReply, MockTransport};
pub use tcp::TcpTransport;

/// Incoming bytes, one item per notification or socket read
pub type ChunkReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the adapter
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Take the incoming chunk stream. Returns `None` after the first call.
    fn take_chunks(&self) -> Option<ChunkReceiver>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}
