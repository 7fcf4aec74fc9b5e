use crate::config::{Config, ConfigError, DriverKind};
use crate::driver::{DriverConnector, MemoryConnector};
use crate::models::SetMessage;
use crate::mqtt_service::{BrokerError, BrokerEvent, BrokerSession};
use crate::registry::{ApplianceRegistry, RegistryError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SET_QUEUE: usize = 32;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that keeps the bridge from reaching `Running`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no device driver configured, set general.driver")]
    NoDriver,
    #[error("appliances: {0}")]
    Registry(#[from] RegistryError),
    #[error("broker unreachable: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initializing,
    Running,
    Stopped,
}

/// The connector named by `general.driver`. Unset is a startup error.
pub fn select_connector(config: &Config) -> Result<Arc<dyn DriverConnector>, StartupError> {
    match config.general.driver {
        Some(DriverKind::Memory) => {
            warn!("general.driver is 'memory': appliances are simulated, no hardware is contacted");
            Ok(Arc::new(MemoryConnector::default()))
        }
        None => Err(StartupError::NoDriver),
    }
}

pub struct Bridge {
    state: BridgeState,
    registry: Arc<ApplianceRegistry>,
    session: Arc<BrokerSession>,
    connector: Arc<dyn DriverConnector>,
    refresh_interval: Duration,
    dispatch: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(
        registry: Arc<ApplianceRegistry>,
        session: Arc<BrokerSession>,
        connector: Arc<dyn DriverConnector>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            state: BridgeState::Initializing,
            registry,
            session,
            connector,
            refresh_interval,
            dispatch: None,
            router: None,
        }
    }

    /// Registry, broker session, appliances; fails fast on the first startup error.
    pub async fn start(
        config: &Config,
        connector: Arc<dyn DriverConnector>,
    ) -> Result<Self, StartupError> {
        let registry = Arc::new(ApplianceRegistry::build(
            &config.mqtt.basetopic,
            &config.appliances(),
        )?);

        let (session, events) = BrokerSession::connect(&config.mqtt).await?;
        let mut bridge = Self::new(registry, session, connector, config.refresh_interval());
        bridge.attach_broker_events(events);

        if let Err(e) = bridge.connect_appliances().await {
            bridge.stop().await;
            return Err(e);
        }
        Ok(bridge)
    }

    /// Spawn the broker event dispatch and the set-message router.
    pub fn attach_broker_events(&mut self, events: mpsc::Receiver<BrokerEvent>) {
        let (set_tx, set_rx) = mpsc::channel::<SetMessage>(SET_QUEUE);

        self.dispatch = Some(tokio::spawn(self.session.clone().run(
            self.registry.clone(),
            events,
            set_tx,
        )));
        self.router = Some(tokio::spawn(route_set_messages(
            self.registry.clone(),
            self.session.clone(),
            set_rx,
        )));
    }

    /// Connect every appliance and publish its first snapshot.
    pub async fn connect_appliances(&self) -> Result<usize, StartupError> {
        let report = self.registry.connect_all(self.connector.as_ref()).await?;
        for (topic, payload) in report.snapshots {
            self.session.publish(&topic, payload).await;
        }
        Ok(report.online)
    }

    /// One pass over the registry: refresh and publish each appliance.
    pub async fn poll_once(&self) {
        for (topic, appliance) in self.registry.iter() {
            let refreshed = {
                let mut proxy = appliance.lock().await;
                if !proxy.is_connected() {
                    if let Err(e) = proxy.connect(self.connector.as_ref()).await {
                        warn!("{} still unreachable: {}", topic, e);
                        continue;
                    }
                }
                proxy.refresh().await
            };

            match refreshed {
                Ok(payload) => self.session.publish(topic, payload).await,
                Err(e) => error!("Refresh failed: {}", e),
            }
        }
    }

    /// Poll until `shutdown` flips to true (or its sender goes away), then stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.state = BridgeState::Running;
        info!(
            "init complete: poll and publish every {} seconds",
            self.refresh_interval.as_secs()
        );

        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already published a snapshot.
        ticker.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// Stop taking broker events, let queued set requests finish, then
    /// release the broker session.
    pub async fn stop(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        self.state = BridgeState::Stopped;

        // Dropping the dispatch task closes the set channel, which ends the router.
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        if let Some(mut router) = self.router.take() {
            if timeout(DRAIN_TIMEOUT, &mut router).await.is_err() {
                warn!("Pending set requests did not finish in {:?}", DRAIN_TIMEOUT);
                router.abort();
            }
        }

        self.session.close().await;
        info!("main loop stopped");
    }
}

/// Hand set-messages to one worker per appliance, so each appliance applies
/// its requests in arrival order while different appliances proceed in
/// parallel. Returns once `set_messages` is closed and every queued request
/// has been handled.
async fn route_set_messages(
    registry: Arc<ApplianceRegistry>,
    session: Arc<BrokerSession>,
    mut set_messages: mpsc::Receiver<SetMessage>,
) {
    let mut queues: HashMap<String, mpsc::Sender<SetMessage>> = HashMap::new();
    let mut workers = Vec::new();

    while let Some(message) = set_messages.recv().await {
        let queue = queues.entry(message.topic.clone()).or_insert_with(|| {
            let (queue_tx, mut queue_rx) = mpsc::channel::<SetMessage>(SET_QUEUE);
            let registry = registry.clone();
            let session = session.clone();
            workers.push(tokio::spawn(async move {
                while let Some(message) = queue_rx.recv().await {
                    handle_set_message(&registry, &session, message).await;
                }
            }));
            queue_tx
        });

        if let Err(e) = queue.send(message).await {
            error!("Set queue for {} is closed, dropping request", e.0.topic);
        }
    }

    drop(queues);
    join_all(workers).await;
    debug!("Set-message router stopped.");
}

/// Apply a routed set-message and publish a fresh snapshot if anything changed.
pub async fn handle_set_message(
    registry: &ApplianceRegistry,
    session: &BrokerSession,
    message: SetMessage,
) {
    let Some(appliance) = registry.lookup(&message.topic) else {
        warn!("no midea appliance named {}", message.topic);
        return;
    };

    let refreshed = {
        let mut proxy = appliance.lock().await;
        match proxy.apply_set_payload(&message.payload).await {
            Ok(outcome) if outcome.applied() => proxy.refresh().await.map(Some),
            Ok(outcome) => {
                debug!("{}: set request finished as {:?}", message.topic, outcome);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    };

    match refreshed {
        Ok(Some(payload)) => session.publish(&message.topic, payload).await,
        Ok(None) => {}
        Err(e) => error!("Set request failed: {}", e),
    }
}
