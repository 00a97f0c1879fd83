//! Single-flight command dispatch.
//!
//! At most one command is outstanding at a time. A reader task owns the
//! [`ResponseAssembler`] and completes the pending request when the prompt
//! arrives. Every request gets a fresh generation number; a reply is only
//! delivered to the request whose generation it was assembled under, so a
//! late reply to a timed-out command is dropped instead of answering the
//! next one. A mode 01 request is further only completed by a reply carrying
//! a `41 <pid>` frame for the requested PID, or by an adapter status such as
//! `NO DATA`; anything else (the tail of a late reply split across the next
//! write, or a whole late reply) is dropped and the request keeps waiting.
//! The write and the wait for the reply share one timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::assembler::{RawResponse, ResponseAssembler};
use crate::command::Command;
use crate::decode::{echoes_pid, requested_pid};
use crate::error::DispatchError;
use crate::transport::{ChunkReceiver, Transport};

/// Command timeout when none is configured
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

type Reply = Result<RawResponse, DispatchError>;

struct PendingRequest {
    generation: u64,
    command: String,
    expected_pid: Option<u8>,
    response_tx: oneshot::Sender<Reply>,
}

struct Shared {
    pending: Mutex<Option<PendingRequest>>,
    generation: AtomicU64,
    /// Flips to true once the chunk stream has ended
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed,
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation and expected PID of the outstanding request
    fn pending_snapshot(&self) -> Option<(u64, Option<u8>)> {
        self.lock_pending()
            .as_ref()
            .map(|p| (p.generation, p.expected_pid))
    }

    /// Deliver `reply` if `generation` is still the pending request
    fn complete(&self, generation: u64, reply: Reply) {
        let request = {
            let mut pending = self.lock_pending();
            match pending.as_ref() {
                Some(p) if p.generation == generation => pending.take(),
                _ => None,
            }
        };
        match request {
            Some(request) => {
                trace!("Completing {:?} (generation {generation})", request.command);
                // Receiver gone means the caller already gave up
                let _ = request.response_tx.send(reply);
            }
            None => debug!("Dropping reply for stale generation {generation}"),
        }
    }

    fn fail_pending(&self, error: DispatchError) {
        if let Some(request) = self.lock_pending().take() {
            debug!("Failing {:?}: {error}", request.command);
            let _ = request.response_tx.send(Err(error));
        }
    }
}

/// Clears the pending slot when a request ends, however it ends
struct PendingGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.shared.lock_pending();
        if pending.as_ref().is_some_and(|p| p.generation == self.generation) {
            pending.take();
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Dispatcher {
    /// Take over `transport`'s chunk stream and start the reader task.
    ///
    /// Fails with [`DispatchError::NotConnected`] if the stream was already
    /// taken by someone else.
    pub fn new(transport: Arc<dyn Transport>, command_timeout: Duration) -> Result<Self, DispatchError> {
        let chunks = transport.take_chunks().ok_or(DispatchError::NotConnected)?;
        let shared = Arc::new(Shared::new());
        let reader = tokio::spawn(read_loop(shared.clone(), chunks));
        Ok(Self {
            transport,
            shared,
            command_timeout,
            reader,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Whether a command is outstanding
    pub fn is_busy(&self) -> bool {
        self.shared.lock_pending().is_some()
    }

    pub fn is_connected(&self) -> bool {
        !*self.shared.closed.borrow() && self.transport.is_connected()
    }

    /// Resolves once the adapter's byte stream has ended
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // Sender lives in `shared`, so this only errors if it is dropped
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Send `command` with the configured timeout
    pub async fn send(&self, command: &str) -> Result<RawResponse, DispatchError> {
        self.send_with_timeout(command, self.command_timeout).await
    }

    pub async fn query(&self, command: &Command) -> Result<RawResponse, DispatchError> {
        self.send(command.code).await
    }

    /// Write `command` followed by `\r` and wait for the complete reply.
    pub async fn send_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, DispatchError> {
        let (response_tx, response_rx) = oneshot::channel();
        let generation = {
            let mut pending = self.shared.lock_pending();
            if pending.is_some() {
                return Err(DispatchError::Busy);
            }
            if !self.is_connected() {
                return Err(DispatchError::NotConnected);
            }
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *pending = Some(PendingRequest {
                generation,
                command: command.to_string(),
                expected_pid: requested_pid(command),
                response_tx,
            });
            generation
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            generation,
        };

        debug!("TX {command:?} (generation {generation})");
        let mut bytes = Vec::with_capacity(command.len() + 1);
        bytes.extend_from_slice(command.as_bytes());
        bytes.push(b'\r');
        let exchange = async {
            if let Err(e) = self.transport.write(&bytes).await {
                error!("Write of {command:?} failed: {e}");
                return Err(DispatchError::from(e));
            }
            response_rx.await.unwrap_or(Err(DispatchError::Disconnected))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!("{command:?} timed out after {} ms", timeout.as_millis());
                Err(DispatchError::Timeout)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(shared: Arc<Shared>, mut chunks: ChunkReceiver) {
    let mut assembler = ResponseAssembler::new();

    while let Some(chunk) = chunks.recv().await {
        let current = shared.pending_snapshot();
        assembler.retag(current.map(|(generation, _)| generation));

        let Some(response) = assembler.feed(&chunk) else {
            continue;
        };
        let Some((generation, expected_pid)) = current else {
            debug!("Discarding unsolicited response {:?}", response.lines());
            continue;
        };
        if let Some(expected) = expected_pid {
            if !response.is_adapter_status() && !echoes_pid(&response, expected) {
                debug!(
                    "Discarding {:?} while waiting for PID {expected:02X}",
                    response.lines()
                );
                continue;
            }
        }

        debug!("RX {:?} (generation {generation})", response.lines());
        let reply = if response.is_no_data() {
            Err(DispatchError::NoData)
        } else {
            Ok(response)
        };
        shared.complete(generation, reply);
    }

    debug!("Chunk stream ended");
    shared.closed.send_replace(true);
    shared.fail_pending(DispatchError::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::error::TransportError;
    use crate::transport::{MockReply, MockTransport};

    fn dispatcher_with<F>(responder: F) -> (Arc<MockTransport>, Arc<Dispatcher>)
    where
        F: FnMut(&str) -> MockReply + Send + 'static,
    {
        let transport = Arc::new(MockTransport::new(responder).with_chunk_size(4));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();
        (transport, Arc::new(dispatcher))
    }

    async fn wait_until_busy(dispatcher: &Dispatcher) {
        while !dispatcher.is_busy() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_is_delivered() {
        let (transport, dispatcher) =
            dispatcher_with(|_| MockReply::Respond("7E8 04 41 0C 1A F8\r\n\r\n>".to_string()));

        let response = dispatcher.send("010C").await.unwrap();
        assert_eq!(response.lines(), ["7E8 04 41 0C 1A F8"]);
        assert_eq!(transport.written(), ["010C"]);
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_command_is_busy() {
        let (_transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send("010C").await }
        });
        wait_until_busy(&dispatcher).await;

        assert_eq!(dispatcher.send("010D").await, Err(DispatchError::Busy));
        assert_eq!(first.await.unwrap(), Err(DispatchError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot() {
        let (_transport, dispatcher) = dispatcher_with(|cmd| match cmd {
            "010C" => MockReply::Silent,
            _ => MockReply::Respond("7E8 03 41 0D 28\r>".to_string()),
        });

        let started = tokio::time::Instant::now();
        assert_eq!(dispatcher.send("010C").await, Err(DispatchError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!dispatcher.is_busy());

        let response = dispatcher.send("010D").await.unwrap();
        assert_eq!(response.lines(), ["7E8 03 41 0D 28"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_delivered_to_next_command() {
        let (_transport, dispatcher) = dispatcher_with(|cmd| match cmd {
            "010C" => MockReply::Delayed(Duration::from_secs(2), "7E8 04 41 0C 1A F8\r>".to_string()),
            _ => MockReply::Delayed(Duration::from_secs(3), "7E8 03 41 0D 28\r>".to_string()),
        });

        assert_eq!(dispatcher.send("010C").await, Err(DispatchError::Timeout));

        let response = dispatcher
            .send_with_timeout("010D", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.lines(), ["7E8 03 41 0D 28"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_straggler_is_dropped() {
        let (transport, dispatcher) =
            dispatcher_with(|_| MockReply::Respond("7E8 03 41 0D 28\r>".to_string()));

        transport.inject(b"7E8 04 41 0C 1A");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = dispatcher.send("010D").await.unwrap();
        assert_eq!(response.lines(), ["7E8 03 41 0D 28"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_late_reply_tail_does_not_answer_next_command() {
        let (transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);
        assert_eq!(dispatcher.send("010C").await, Err(DispatchError::Timeout));

        // Head of the timed-out reply arrives while idle
        transport.inject(b"7E8 04 41 0C ");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let next = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send_with_timeout("010D", Duration::from_secs(5)).await }
        });
        wait_until_busy(&dispatcher).await;

        // Its tail arrives after the next write
        transport.inject(b"1A F8\r\r>");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dispatcher.is_busy());
        assert!(!next.is_finished());

        transport.inject(b"7E8 03 41 0D 28\r>");
        let response = next.await.unwrap().unwrap();
        assert_eq!(response.lines(), ["7E8 03 41 0D 28"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_status_completes_pid_request() {
        let (_transport, dispatcher) = dispatcher_with(|_| {
            MockReply::Respond("SEARCHING...\rUNABLE TO CONNECT\r\r>".to_string())
        });
        let response = dispatcher.send("010C").await.unwrap();
        assert!(response.is_adapter_status());
        assert!(!dispatcher.is_busy());
    }

    /// Link whose writes never complete
    struct StuckTransport {
        _chunk_tx: mpsc::UnboundedSender<Vec<u8>>,
        chunks: Mutex<Option<ChunkReceiver>>,
    }

    impl StuckTransport {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                _chunk_tx: tx,
                chunks: Mutex::new(Some(rx)),
            }
        }
    }

    #[async_trait]
    impl Transport for StuckTransport {
        async fn write(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            std::future::pending().await
        }

        fn take_chunks(&self) -> Option<ChunkReceiver> {
            self.chunks.lock().unwrap().take()
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "stuck".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let dispatcher = Dispatcher::new(Arc::new(StuckTransport::new()), Duration::from_secs(1)).unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(dispatcher.send("010C").await, Err(DispatchError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_any_case() {
        for text in ["NO DATA\r\r>", "no data\r\r>", "No Data\r>"] {
            let (_transport, dispatcher) = dispatcher_with(move |_| MockReply::Respond(text.to_string()));
            assert_eq!(dispatcher.send("0146").await, Err(DispatchError::NoData), "{text:?}");
            assert!(!dispatcher.is_busy());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected() {
        let (transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);
        transport.drop_link();
        assert_eq!(dispatcher.send("ATZ").await, Err(DispatchError::NotConnected));
        assert!(transport.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_fails_pending() {
        let (transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);

        let pending = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send_with_timeout("010C", Duration::from_secs(60)).await }
        });
        wait_until_busy(&dispatcher).await;

        transport.drop_link();
        assert_eq!(pending.await.unwrap(), Err(DispatchError::Disconnected));
        dispatcher.closed().await;
        assert!(!dispatcher.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_needs_chunk_stream() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let _first = Dispatcher::new(transport.clone(), DEFAULT_COMMAND_TIMEOUT).unwrap();
        assert!(matches!(
            Dispatcher::new(transport, DEFAULT_COMMAND_TIMEOUT),
            Err(DispatchError::NotConnected)
        ));
    }
}
