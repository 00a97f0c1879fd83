//! Adapter initialisation sequence.
//!
//! `ATZ` → `ATE0` → `ATSP0` → `ATH1`, each sent only after the previous one
//! answered. Protocol selection and headers-on must be acknowledged with
//! `OK`. The first failure ends the sequence; retrying is up to the caller.

use std::time::Duration;

use log::{debug, info, warn};

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crate::error::HandshakeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Reset,
    EchoDisabled,
    ProtocolSelected,
    HeadersOn,
    Ready,
    Failed(String),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

struct Step {
    command: Command,
    /// State entered once the command has been answered
    reached: HandshakeState,
    requires_ok: bool,
}

const STEPS: [Step; 4] = [
    Step {
        command: Command::RESET,
        reached: HandshakeState::Reset,
        requires_ok: false,
    },
    Step {
        command: Command::DISABLE_ECHO,
        reached: HandshakeState::EchoDisabled,
        requires_ok: false,
    },
    Step {
        command: Command::AUTO_PROTOCOL,
        reached: HandshakeState::ProtocolSelected,
        requires_ok: true,
    },
    Step {
        command: Command::HEADERS_ON,
        reached: HandshakeState::HeadersOn,
        requires_ok: true,
    },
];

pub struct Handshake<'a> {
    dispatcher: &'a Dispatcher,
    timeout: Duration,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self {
            dispatcher,
            timeout: dispatcher.command_timeout(),
            state: HandshakeState::Idle,
        }
    }

    /// Per-command timeout, instead of the dispatcher's
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!("Handshake {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Drive the sequence to `Ready`, returning the last step's lines.
    pub async fn run(&mut self) -> Result<Vec<String>, HandshakeError> {
        let mut last_lines = Vec::new();

        for step in &STEPS {
            let step_name = step.command.name;
            let response = match self
                .dispatcher
                .send_with_timeout(step.command.code, self.timeout)
                .await
            {
                Ok(response) => response,
                Err(source) => {
                    warn!("Handshake step {} failed: {source}", step.command);
                    self.transition(HandshakeState::Failed(source.to_string()));
                    return Err(HandshakeError::Command {
                        step: step_name,
                        source,
                    });
                }
            };

            if step.requires_ok && !response.contains_ok() {
                let lines = response.into_lines();
                warn!("Handshake step {} not acknowledged: {lines:?}", step.command);
                self.transition(HandshakeState::Failed(format!("{step_name} not acknowledged")));
                return Err(HandshakeError::NotAcknowledged {
                    step: step_name,
                    lines,
                });
            }

            self.transition(step.reached.clone());
            last_lines = response.into_lines();
        }

        self.transition(HandshakeState::Ready);
        info!("Adapter initialised");
        Ok(last_lines)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drivesense_elm327_lib::{Elm327Emulator, SimulatedVehicle};

    use super::*;
    use crate::error::DispatchError;
    use crate::transport::{MockReply, MockTransport};

    fn dispatcher_with<F>(responder: F) -> (Arc<MockTransport>, Dispatcher)
    where
        F: FnMut(&str) -> MockReply + Send + 'static,
    {
        let transport = Arc::new(MockTransport::new(responder));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();
        (transport, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_reaches_ready() {
        let mut emulator = Elm327Emulator::new(SimulatedVehicle::default());
        let (transport, dispatcher) =
            dispatcher_with(move |cmd| MockReply::Respond(emulator.respond(cmd, Duration::ZERO)));

        let mut handshake = Handshake::new(&dispatcher);
        let lines = handshake.run().await.unwrap();

        assert_eq!(lines, ["OK"]);
        assert_eq!(handshake.state(), &HandshakeState::Ready);
        assert_eq!(transport.written(), ["ATZ", "ATE0", "ATSP0", "ATH1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_not_acknowledged() {
        let (transport, dispatcher) = dispatcher_with(|cmd| match cmd {
            "ATSP0" => MockReply::Respond("?\r\r>".to_string()),
            _ => MockReply::Respond("OK\r\r>".to_string()),
        });

        let mut handshake = Handshake::new(&dispatcher);
        let err = handshake.run().await.unwrap_err();

        assert_eq!(
            err,
            HandshakeError::NotAcknowledged {
                step: "AutoSelectProtocol",
                lines: vec!["?".to_string()],
            }
        );
        assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
        // ATH1 is never sent
        assert_eq!(transport.written(), ["ATZ", "ATE0", "ATSP0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_not_acknowledged() {
        let (_transport, dispatcher) = dispatcher_with(|cmd| match cmd {
            "ATH1" => MockReply::Respond("ERROR\r>".to_string()),
            _ => MockReply::Respond("OK\r>".to_string()),
        });

        let err = Handshake::new(&dispatcher).run().await.unwrap_err();
        assert!(matches!(err, HandshakeError::NotAcknowledged { step: "HeadOn", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timeout_aborts() {
        let (transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);

        let mut handshake = Handshake::new(&dispatcher);
        let err = handshake.run().await.unwrap_err();

        assert_eq!(
            err,
            HandshakeError::Command {
                step: "Reset",
                source: DispatchError::Timeout,
            }
        );
        assert_eq!(handshake.state(), &HandshakeState::Failed("Timed out waiting for response".to_string()));
        assert!(handshake.state().is_terminal());
        assert_eq!(transport.written(), ["ATZ"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_overrides_dispatcher() {
        let (_transport, dispatcher) = dispatcher_with(|_| MockReply::Silent);

        let started = tokio::time::Instant::now();
        let result = Handshake::new(&dispatcher)
            .with_timeout(Duration::from_secs(5))
            .run()
            .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_echo_need_no_ok() {
        let (_transport, dispatcher) = dispatcher_with(|cmd| match cmd {
            "ATZ" => MockReply::Respond("\r\rELM327 v1.5\r\r>".to_string()),
            "ATE0" => MockReply::Respond("ATE0\r\r>".to_string()),
            _ => MockReply::Respond("ok\r>".to_string()),
        });

        let lines = Handshake::new(&dispatcher).run().await.unwrap();
        assert_eq!(lines, ["ok"]);
    }
}
