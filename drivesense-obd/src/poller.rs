//! Round-robin polling of the monitored parameters.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::command::Parameter;
use crate::decode::decode_value;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::store::{CollectionFlag, MonitoredParameters, ValueSink, UNAVAILABLE};

/// Sleep between checks while nothing is monitored
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Running totals of a polling session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollStats {
    pub cycles: u64,
    pub successes: u64,
    /// Successful replies without an engine ECU line
    pub unavailable: u64,
    /// Failures keyed by [`DispatchError::kind`]
    pub errors: IndexMap<&'static str, u64>,
    pub last_values: IndexMap<Parameter, f64>,
}

impl PollStats {
    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}

pub struct Poller {
    dispatcher: Arc<Dispatcher>,
    monitored: MonitoredParameters,
    active: CollectionFlag,
    sink: Arc<dyn ValueSink>,
    command_timeout: Duration,
    idle_interval: Duration,
    stats: Mutex<PollStats>,
}

impl Poller {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        monitored: MonitoredParameters,
        active: CollectionFlag,
        sink: Arc<dyn ValueSink>,
    ) -> Self {
        let command_timeout = dispatcher.command_timeout();
        Self {
            dispatcher,
            monitored,
            active,
            sink,
            command_timeout,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            stats: Mutex::new(PollStats::default()),
        }
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn stats(&self) -> PollStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record<F: FnOnce(&mut PollStats)>(&self, f: F) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Query one parameter and decode it. A reply without an engine ECU
    /// line decodes to [`UNAVAILABLE`].
    pub async fn poll_parameter(&self, parameter: Parameter) -> Result<f64, DispatchError> {
        let response = self
            .dispatcher
            .send_with_timeout(parameter.command().code, self.command_timeout)
            .await?;
        Ok(decode_value(parameter, &response))
    }

    /// Poll until collection stops or the adapter goes away.
    ///
    /// Each cycle works on a snapshot of the monitored list. A failed query
    /// is logged and skipped; the parameter keeps its previous value. A
    /// reply that arrives after collection stopped is dropped.
    pub async fn run(&self) -> PollStats {
        info!("Polling started");

        while self.active.is_active() {
            if !self.dispatcher.is_connected() {
                warn!("Adapter disconnected, polling stopped");
                break;
            }

            let parameters = self.monitored.snapshot();
            if parameters.is_empty() {
                tokio::time::sleep(self.idle_interval).await;
                continue;
            }

            for parameter in parameters {
                if !self.active.is_active() {
                    break;
                }
                let result = self.poll_parameter(parameter).await;
                if !self.active.is_active() {
                    debug!("Collection stopped, discarding {parameter} result");
                    break;
                }

                match result {
                    Ok(value) => {
                        debug!("{parameter} = {value} {}", parameter.unit());
                        self.sink.publish(parameter, value);
                        self.record(|stats| {
                            stats.successes += 1;
                            if value == UNAVAILABLE {
                                stats.unavailable += 1;
                            }
                            stats.last_values.insert(parameter, value);
                        });
                    }
                    Err(e) => {
                        // NO DATA is an answer, not a fault
                        if e == DispatchError::NoData {
                            debug!("{parameter}: {e}");
                        } else {
                            warn!("{parameter}: {e}");
                        }
                        self.record(|stats| *stats.errors.entry(e.kind()).or_default() += 1);
                    }
                }
            }

            self.record(|stats| stats.cycles += 1);
        }

        let stats = self.stats();
        info!(
            "Polling finished after {} cycles ({} values, {} errors)",
            stats.cycles,
            stats.successes,
            stats.total_errors()
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use drivesense_elm327_lib::{Elm327Emulator, SimulatedVehicle};

    use super::*;
    use crate::store::ValueStore;
    use crate::transport::{MockReply, MockTransport};

    struct Fixture {
        transport: Arc<MockTransport>,
        store: ValueStore,
        active: CollectionFlag,
        poller: Poller,
    }

    /// Poller over a mock adapter with collection already started.
    /// `responder` gets the command, how many commands came before it, and
    /// the collection flag.
    fn fixture<F>(monitored: &[Parameter], mut responder: F) -> Fixture
    where
        F: FnMut(&str, usize, &CollectionFlag) -> MockReply + Send + 'static,
    {
        let active = CollectionFlag::new();
        active.start();
        let count = AtomicUsize::new(0);
        let responder_flag = active.clone();
        let transport = Arc::new(MockTransport::new(move |cmd| {
            responder(cmd, count.fetch_add(1, Ordering::SeqCst), &responder_flag)
        }));
        let dispatcher = Dispatcher::new(transport.clone(), Duration::from_secs(1)).unwrap();
        let store = ValueStore::new();
        let poller = Poller::new(
            Arc::new(dispatcher),
            MonitoredParameters::new(monitored.iter().copied()),
            active.clone(),
            Arc::new(store.clone()),
        );
        Fixture {
            transport,
            store,
            active,
            poller,
        }
    }

    fn emulator() -> Elm327Emulator {
        let mut emulator = Elm327Emulator::new(SimulatedVehicle::default());
        emulator.state.echo_enabled = false;
        emulator.state.headers_enabled = true;
        emulator
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_publish_decoded_values() {
        let all: Vec<Parameter> = Parameter::all().collect();
        let cycle_len = all.len();
        let mut emulator = emulator();
        let f = fixture(&all, move |cmd, n, active| {
            if n + 1 == 2 * cycle_len {
                active.stop();
            }
            MockReply::Respond(emulator.respond(cmd, Duration::ZERO))
        });

        let stats = f.poller.run().await;

        let written = f.transport.written();
        assert_eq!(written.len(), 2 * cycle_len);
        assert_eq!(&written[..3], ["010C", "010D", "010F"]);
        // Last reply arrived after stop and was dropped
        assert_eq!(stats.successes as usize, 2 * cycle_len - 1);
        assert_eq!(stats.cycles, 2);

        let expected = [
            (Parameter::EngineSpeed, 800.0),
            (Parameter::VehicleSpeed, 40.0),
            (Parameter::IntakeAirTemperature, 16.0),
            (Parameter::ThrottlePosition, 69.0 * 100.0 / 255.0),
            (Parameter::CommandedAirFuelEqRatio, 1.0),
            (Parameter::AmbientAirTemperature, 20.0),
            (Parameter::EngineFuelRate, 5.0),
            (Parameter::IntakeManifoldAbsolutePressure, 101.0),
        ];
        for (parameter, value) in expected {
            let got = f.store.get(parameter).unwrap();
            assert!((got - value).abs() < 1e-9, "{parameter}: {got} != {value}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_previous_value() {
        let f = fixture(
            &[Parameter::VehicleSpeed, Parameter::EngineSpeed],
            |cmd, n, _| match (cmd, n) {
                ("010D", 0) => MockReply::Respond("7E8 03 41 0D 28\r>".to_string()),
                ("010C", 1) => MockReply::Respond("7E8 04 41 0C 0C 80\r>".to_string()),
                ("010D", 2) => MockReply::Respond("NO DATA\r>".to_string()),
                _ => MockReply::Silent,
            },
        );
        let active = f.active.clone();
        let store = f.store.clone();

        let run = tokio::spawn(async move { f.poller.run().await });
        // Second cycle: NO DATA, then a 1 s timeout, then stop mid-request
        tokio::time::sleep(Duration::from_millis(1500)).await;
        active.stop();
        let stats = run.await.unwrap();

        assert_eq!(store.get(Parameter::VehicleSpeed), Some(40.0));
        assert_eq!(store.get(Parameter::EngineSpeed), Some(800.0));
        assert_eq!(stats.errors.get("no_data"), Some(&1));
        assert_eq!(stats.errors.get("timeout"), Some(&1));
        assert_eq!(stats.successes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_engine_line_publishes_sentinel() {
        let f = fixture(&[Parameter::VehicleSpeed], |_, _, _| {
            MockReply::Respond("41 0D 28\r>".to_string())
        });
        assert_eq!(f.poller.poll_parameter(Parameter::VehicleSpeed).await, Ok(UNAVAILABLE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_result() {
        let f = fixture(&[Parameter::VehicleSpeed], |_, _, active| {
            active.stop();
            MockReply::Respond("7E8 03 41 0D 28\r>".to_string())
        });

        let stats = f.poller.run().await;

        assert_eq!(f.transport.written(), ["010D"]);
        assert_eq!(f.store.get(Parameter::VehicleSpeed), None);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_while_nothing_monitored() {
        let f = fixture(&[], |_, _, _| MockReply::Silent);
        let active = f.active.clone();
        let transport = f.transport.clone();

        let run = tokio::spawn(async move { f.poller.run().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        active.stop();
        let stats = run.await.unwrap();

        assert!(transport.written().is_empty());
        assert_eq!(stats.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitored_list_is_reread_each_cycle() {
        let monitored = MonitoredParameters::new([Parameter::VehicleSpeed]);
        let handle = monitored.clone();
        let mut emulator = emulator();
        let f = fixture(&[], move |cmd, _, active| {
            match cmd {
                // Switch to engine speed for the next cycle
                "010D" => handle.set([Parameter::EngineSpeed]),
                _ => active.stop(),
            }
            MockReply::Respond(emulator.respond(cmd, Duration::ZERO))
        });
        let poller = Poller::new(
            f.poller.dispatcher.clone(),
            monitored,
            f.active.clone(),
            Arc::new(f.store.clone()),
        );

        poller.run().await;

        assert_eq!(f.transport.written(), ["010D", "010C"]);
        assert_eq!(f.store.get(Parameter::VehicleSpeed), Some(40.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_polling() {
        let f = fixture(&[Parameter::VehicleSpeed], |_, _, _| MockReply::Silent);
        f.transport.drop_link();

        let stats = f.poller.run().await;
        assert!(f.transport.written().is_empty());
        assert_eq!(stats, PollStats::default());
        assert!(f.active.is_active());
    }
}
