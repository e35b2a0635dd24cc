//! Process-wide component wiring.
//!
//! [`Services`] builds every component from a [`Config`] in dependency order
//! and owns them until [`Services::shutdown`]. Nothing here is global; tests
//! and the CLI construct their own instance.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::chat::ChatClient;
use crate::core::clock::{system_clock, Clock};
use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::core::connectivity::ConnectivitySignal;
use crate::core::errors::{ErrorReporter, JsonLinesSink};
use crate::core::health::HealthMonitor;
use crate::core::lock;
use crate::core::observers::Subscription;
use crate::core::recovery::RecoveryService;
use crate::core::requests::RequestManager;
use crate::core::transport::{HttpTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("could not build HTTP client: {0}")]
    Transport(#[from] TransportError),
    #[error("could not open error log {}: {source}", path_display(.path))]
    ErrorLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct Services {
    pub base_url: String,
    pub clock: Arc<dyn Clock>,
    pub connectivity: ConnectivitySignal,
    pub requests: RequestManager,
    pub reporter: ErrorReporter,
    pub health: HealthMonitor,
    pub recovery: RecoveryService,
    pub chat: ChatClient,
    links: Mutex<Vec<Subscription>>,
}

impl Services {
    /// Wires the production stack: system clock and HTTP transport.
    pub fn from_config(config: &Config) -> Result<Self, ServicesError> {
        let transport = HttpTransport::new(config.connect_timeout())?;
        Self::build(config, Arc::new(transport), system_clock())
    }

    pub fn build(
        config: &Config,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServicesError> {
        let base_url = config.base_url();
        let connectivity = ConnectivitySignal::online();

        let reporter = match &config.errors.log_file {
            Some(path) => {
                let sink = JsonLinesSink::open(path).map_err(|source| ServicesError::ErrorLog {
                    path: path.clone(),
                    source,
                })?;
                ErrorReporter::with_sink(config.reporter_config(), clock.clone(), Box::new(sink))
            }
            None => ErrorReporter::new(config.reporter_config(), clock.clone()),
        };
        let requests = RequestManager::new(transport, clock.clone(), config.request_config());
        let health = HealthMonitor::new(
            requests.clone(),
            connectivity.clone(),
            clock.clone(),
            config.health_config(&base_url),
        );
        let recovery = RecoveryService::new(config.recovery_config(), clock.clone());
        let chat = ChatClient::new(
            base_url.clone(),
            requests.clone(),
            recovery.clone(),
            reporter.clone(),
        );

        debug!(base_url = %base_url, "services wired");
        Ok(Self {
            base_url,
            clock,
            connectivity,
            requests,
            reporter,
            health,
            recovery,
            chat,
            links: Mutex::new(Vec::new()),
        })
    }

    /// Connects recovery to health and platform connectivity, then starts
    /// background polling. Must run inside a tokio runtime.
    pub fn start(&self) {
        {
            let mut links = lock(&self.links);
            if links.is_empty() {
                links.push(self.recovery.attach(&self.health));
                self.recovery.watch_connectivity(&self.connectivity);
            }
        }
        self.health.start();
        info!(base_url = %self.base_url, "services started");
    }

    /// Stops polling, cancels outstanding requests and detaches every
    /// listener. Safe to call more than once.
    pub fn shutdown(&self) {
        self.health.stop();
        let cancelled = self.requests.cancel_all();
        self.recovery.shutdown();
        lock(&self.links).clear();
        info!(cancelled, "services shut down");
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.health.stop();
        self.recovery.shutdown();
    }
}
