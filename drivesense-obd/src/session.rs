//! One adapter connection from link-up to polling.
//!
//! A [`Session`] owns the transport and dispatcher for a single adapter and
//! runs the startup sequence: handshake, then supported-PID discovery.
//! Observers follow progress through [`ConnectionStatus`].

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::availability::{discover_availability, AvailabilityBitmap};
use crate::command::Parameter;
use crate::config::{Config, TransportConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{ConnectionError, DispatchError, HandshakeError, SessionError};
use crate::handshake::Handshake;
use crate::poller::Poller;
use crate::store::{CollectionFlag, MonitoredParameters, ValueSink};
use crate::transport::{TcpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Link to the adapter is up
    ConnectedToScanner,
    /// Adapter initialised and talking to the car
    ConnectedToVehicle,
}

/// Open the link described by `config`
pub async fn open_transport(config: &Config) -> Result<Arc<dyn Transport>, ConnectionError> {
    match &config.transport {
        TransportConfig::Tcp(tcp) => {
            let transport = TcpTransport::connect(&tcp.host, tcp.port, config.connect_timeout()).await?;
            Ok(Arc::new(transport))
        }
        #[cfg(feature = "ble")]
        TransportConfig::Ble(ble) => {
            let transport = crate::transport::BleTransport::connect(
                ble.target(),
                ble.profile(),
                std::time::Duration::from_millis(ble.scan_timeout_ms),
                config.connect_timeout(),
            )
            .await?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "ble"))]
        TransportConfig::Ble(_) => Err(ConnectionError::Unavailable(
            "built without Bluetooth support".to_string(),
        )),
    }
}

pub struct Session {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    availability: Option<AvailabilityBitmap>,
    link_watch: JoinHandle<()>,
}

impl Session {
    /// Connect using the configured transport
    pub async fn connect(config: Config) -> Result<Self, SessionError> {
        let transport = open_transport(&config).await?;
        Ok(Self::with_transport(transport, config)?)
    }

    /// Start a session over an already open transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: Config) -> Result<Self, DispatchError> {
        info!("Session on {}", transport.describe());
        let dispatcher = Arc::new(Dispatcher::new(transport, config.poll_timeout())?);
        let (status, _) = watch::channel(ConnectionStatus::ConnectedToScanner);
        let status = Arc::new(status);

        let link_watch = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let status = status.clone();
            async move {
                dispatcher.closed().await;
                warn!("Adapter link lost");
                status.send_replace(ConnectionStatus::Disconnected);
            }
        });

        Ok(Self {
            config,
            dispatcher,
            status,
            availability: None,
            link_watch,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!("Connection status {previous:?} -> {status:?}");
        }
    }

    /// Run the adapter handshake
    pub async fn initialize(&self) -> Result<Vec<String>, HandshakeError> {
        let result = Handshake::new(&self.dispatcher)
            .with_timeout(self.config.handshake_timeout())
            .run()
            .await;
        if result.is_ok() {
            self.set_status(ConnectionStatus::ConnectedToVehicle);
        }
        result
    }

    /// Query the supported-PID ranges and keep the result
    pub async fn discover(&mut self) -> Result<&AvailabilityBitmap, DispatchError> {
        let bitmap = discover_availability(&self.dispatcher, self.config.discovery_timeout()).await?;
        Ok(self.availability.insert(bitmap))
    }

    pub fn availability(&self) -> Option<&AvailabilityBitmap> {
        self.availability.as_ref()
    }

    /// Parameters the car supports; empty before discovery
    pub fn available_parameters(&self) -> Vec<Parameter> {
        self.availability
            .as_ref()
            .map(AvailabilityBitmap::available_parameters)
            .unwrap_or_default()
    }

    /// Handshake followed by discovery
    pub async fn start(&mut self) -> Result<Vec<Parameter>, SessionError> {
        self.initialize().await?;
        self.discover().await?;
        let available = self.available_parameters();
        info!(
            "Available parameters: {}",
            available.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(available)
    }

    /// Polling loop over this session's adapter
    pub fn poller(
        &self,
        monitored: MonitoredParameters,
        active: CollectionFlag,
        sink: Arc<dyn ValueSink>,
    ) -> Poller {
        Poller::new(self.dispatcher.clone(), monitored, active, sink)
            .with_command_timeout(self.config.poll_timeout())
            .with_idle_interval(self.config.idle_interval())
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.dispatcher.transport().disconnect().await {
            warn!("Disconnect failed: {e}");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.link_watch.abort();
    }
}
