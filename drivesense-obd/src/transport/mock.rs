//! In-process transport driven by a responder closure.
//!
//! Each `\r`-terminated command written is handed to the responder, whose
//! [`MockReply`] decides what comes back and when. Replies are split into
//! chunks of a configurable size so reassembly is exercised the same way a
//! BLE link does it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use super::{ChunkReceiver, Transport};
use crate::error::TransportError;

/// What the simulated adapter does with one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Send the text immediately
    Respond(String),
    /// Send nothing
    Silent,
    /// Send the text after a delay
    Delayed(Duration, String),
}

type Responder = Box<dyn FnMut(&str) -> MockReply + Send>;

pub struct MockTransport {
    responder: Mutex<Responder>,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    receiver: Mutex<Option<ChunkReceiver>>,
    connected: AtomicBool,
    chunk_size: usize,
    /// Bytes written since the last `\r`
    partial: Mutex<String>,
    written: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Default bytes per notification, the usual BLE payload size
    pub const DEFAULT_CHUNK_SIZE: usize = 20;

    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> MockReply + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            responder: Mutex::new(Box::new(responder)),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            connected: AtomicBool::new(true),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            partial: Mutex::new(String::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Split replies into chunks of `size` bytes (at least 1)
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Commands received so far, without terminators
    pub fn written(&self) -> Vec<String> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Push unsolicited bytes into the chunk stream
    pub fn inject(&self, bytes: &[u8]) {
        if let Ok(sender) = self.sender.lock() {
            if let Some(tx) = sender.as_ref() {
                let _ = tx.send(bytes.to_vec());
            }
        }
    }

    /// Simulate the link dropping: the chunk stream ends
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.sender.lock().ok().and_then(|s| s.clone())
    }

    fn reply(&self, command: &str) {
        let reply = match self.responder.lock() {
            Ok(mut responder) => responder(command),
            Err(_) => return,
        };
        let Some(tx) = self.sender() else {
            return;
        };
        let chunk_size = self.chunk_size;

        match reply {
            MockReply::Respond(text) => send_chunks(&tx, text.as_bytes(), chunk_size),
            MockReply::Silent => debug!("Mock adapter ignoring {command:?}"),
            MockReply::Delayed(delay, text) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_chunks(&tx, text.as_bytes(), chunk_size);
                });
            }
        }
    }
}

fn send_chunks(tx: &mpsc::UnboundedSender<Vec<u8>>, bytes: &[u8], chunk_size: usize) {
    for chunk in bytes.chunks(chunk_size) {
        if tx.send(chunk.to_vec()).is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let text = String::from_utf8_lossy(bytes);
        let mut commands = Vec::new();
        {
            let mut partial = self
                .partial
                .lock()
                .map_err(|e| TransportError::WriteRejected(e.to_string()))?;
            for ch in text.chars() {
                if ch == '\r' {
                    commands.push(std::mem::take(&mut *partial));
                } else {
                    partial.push(ch);
                }
            }
        }

        for command in commands {
            if let Ok(mut written) = self.written.lock() {
                written.push(command.clone());
            }
            self.reply(&command);
        }
        Ok(())
    }

    fn take_chunks(&self) -> Option<ChunkReceiver> {
        self.receiver.lock().ok().and_then(|mut r| r.take())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock adapter".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_is_chunked() {
        let transport = MockTransport::new(|cmd| MockReply::Respond(format!("{cmd} OK\r>")))
            .with_chunk_size(3);
        let mut chunks = transport.take_chunks().unwrap();
        assert!(transport.take_chunks().is_none());

        transport.write(b"ATE0\r").await.unwrap();
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(chunks.recv().await.unwrap());
        }
        assert_eq!(received, [b"ATE".to_vec(), b"0 O".to_vec(), b"K\r>".to_vec()]);
        assert_eq!(transport.written(), ["ATE0"]);
    }

    #[tokio::test]
    async fn test_command_split_across_writes() {
        let transport = MockTransport::new(|_| MockReply::Silent);
        transport.write(b"01").await.unwrap();
        assert!(transport.written().is_empty());
        transport.write(b"0C\r").await.unwrap();
        assert_eq!(transport.written(), ["010C"]);
    }

    #[tokio::test]
    async fn test_drop_link_ends_stream() {
        let transport = MockTransport::new(|_| MockReply::Silent);
        let mut chunks = transport.take_chunks().unwrap();
        transport.drop_link();
        assert!(chunks.recv().await.is_none());
        assert!(!transport.is_connected());
        assert_eq!(transport.write(b"ATZ\r").await, Err(TransportError::NotConnected));
    }
}
