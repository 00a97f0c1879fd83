//! TCP link to WiFi adapters (and the mock ELM327 server).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChunkReceiver, Transport};
use crate::error::{ConnectionError, TransportError};

const READ_BUFFER_SIZE: usize = 256;

pub struct TcpTransport {
    peer: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    receiver: Mutex<Option<ChunkReceiver>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `timeout`
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectionError> {
        let peer = format!("{host}:{port}");
        info!("Connecting to adapter at {peer}");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| ConnectionError::Failed(format!("connect to {peer} timed out")))?
            .map_err(|e| ConnectionError::Failed(format!("connect to {peer}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }

        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let reader_connected = connected.clone();
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        info!("Adapter at {reader_peer} closed the connection");
                        break;
                    }
                    Ok(n) => {
                        debug!("RX {n} bytes: {:?}", String::from_utf8_lossy(&buf[..n]));
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Read error from {reader_peer}: {e}");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        info!("Connected to adapter at {peer}");
        Ok(Self {
            peer,
            writer: tokio::sync::Mutex::new(write_half),
            receiver: Mutex::new(Some(rx)),
            connected,
            reader,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteRejected(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::WriteRejected(e.to_string()))
    }

    fn take_chunks(&self) -> Option<ChunkReceiver> {
        self.receiver.lock().ok().and_then(|mut r| r.take())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let result = self.writer.lock().await.shutdown().await;
        self.reader.abort();
        result.map_err(|e| TransportError::Disconnect(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ATZ\r");
            socket.write_all(b"ELM327 v1.5\r\r>").await.unwrap();
        });

        let transport = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        let mut chunks = transport.take_chunks().unwrap();
        transport.write(b"ATZ\r").await.unwrap();

        let mut received = Vec::new();
        while !received.ends_with(b">") {
            received.extend(chunks.recv().await.unwrap());
        }
        assert_eq!(received, b"ELM327 v1.5\r\r>");

        server.await.unwrap();
        // Server dropped the socket: the stream ends
        assert!(chunks.recv().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectionError::Failed(_))));
    }
}
