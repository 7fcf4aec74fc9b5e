use crate::config::MqttConfig;
use crate::models::SetMessage;
use crate::registry::ApplianceRegistry;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const SET_SUFFIX: &str = "/set";
const EVENT_QUEUE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("timed out: {0}")]
    Timeout(String),
}

/// What the transport reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

/// The operations the session needs from a broker client.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl BrokerClient for AsyncClient {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        timeout(
            REQUEST_TIMEOUT,
            AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| BrokerError::Timeout(format!("publish to '{}'", topic)))??;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        timeout(
            REQUEST_TIMEOUT,
            AsyncClient::subscribe(self, topic, QoS::AtLeastOnce),
        )
        .await
        .map_err(|_| BrokerError::Timeout(format!("subscribe to '{}'", topic)))??;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        timeout(REQUEST_TIMEOUT, AsyncClient::disconnect(self))
            .await
            .map_err(|_| BrokerError::Timeout("disconnect".to_string()))??;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    subscriptions: BTreeSet<String>,
}

pub struct BrokerSession {
    client: Arc<dyn BrokerClient>,
    client_id: String,
    basetopic: String,
    state: Mutex<SessionState>,
    transport: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSession {
    pub fn new(client: Arc<dyn BrokerClient>, client_id: &str, basetopic: &str) -> Arc<Self> {
        Arc::new(Self {
            client,
            client_id: client_id.to_string(),
            basetopic: basetopic.to_string(),
            state: Mutex::new(SessionState::default()),
            transport: Mutex::new(None),
        })
    }

    /// Connect to the broker and wait for the first CONNACK, then hand the
    /// event loop to a background transport task.
    pub async fn connect(
        config: &MqttConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<BrokerEvent>), BrokerError> {
        info!("Connecting to MQTT broker at {}:{}...", config.broker, config.port);

        let mut mqtt_options = MqttOptions::new(&config.clientid, &config.broker, config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);

        if !config.username.is_empty() && !config.password.is_empty() {
            mqtt_options.set_credentials(&config.username, &config.password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        wait_for_connack(&mut eventloop).await?;
        info!("Connected to '{}':{}", config.broker, config.port);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        // The CONNACK consumed above still has to trigger the subscriptions.
        let _ = events_tx.send(BrokerEvent::Connected).await;

        let session = Self::new(Arc::new(client), &config.clientid, &config.basetopic);
        let transport = tokio::spawn(run_transport(eventloop, events_tx));
        *session.transport.lock().await = Some(transport);

        Ok((session, events_rx))
    }

    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Topics currently believed to be subscribed.
    #[cfg(test)]
    pub async fn subscriptions(&self) -> BTreeSet<String> {
        self.state.lock().await.subscriptions.clone()
    }

    /// `basetopic/set` followed by `topic/set` for every registered appliance.
    pub fn subscription_topics(&self, registry: &ApplianceRegistry) -> Vec<String> {
        std::iter::once(self.basetopic.as_str())
            .chain(registry.topics())
            .map(|topic| format!("{}{}", topic, SET_SUFFIX))
            .collect()
    }

    /// (Re)build every subscription. Broker sessions are not assumed to keep them.
    pub async fn on_connect(&self, registry: &ApplianceRegistry) {
        info!("(re)connected as '{}', renewing subscriptions", self.client_id);
        {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.subscriptions.clear();
        }

        for topic in self.subscription_topics(registry) {
            match self.client.subscribe(&topic).await {
                Ok(()) => {
                    info!("Successfully subscribed to topic '{}'.", topic);
                    self.state.lock().await.subscriptions.insert(topic);
                }
                Err(e) => warn!("Unable to subscribe to topic '{}': {}", topic, e),
            }
        }
    }

    pub async fn on_disconnect(&self, reason: &str) {
        warn!("Lost connection to MQTT broker: {}", reason);
        let mut state = self.state.lock().await;
        state.connected = false;
        state.subscriptions.clear();
    }

    /// Map an inbound `.../set` message to the appliance it addresses.
    pub fn route(
        &self,
        registry: &ApplianceRegistry,
        topic: &str,
        payload: Vec<u8>,
    ) -> Option<SetMessage> {
        debug!("{}: {}", topic, String::from_utf8_lossy(&payload));
        let Some(target) = topic.strip_suffix(SET_SUFFIX) else {
            warn!("Unknown topic received: {}", topic);
            return None;
        };

        if registry.lookup(target).is_none() {
            warn!("no midea appliance named {}", target);
            return None;
        }

        Some(SetMessage {
            topic: target.to_string(),
            payload,
        })
    }

    /// Best-effort publish; failures are only logged.
    pub async fn publish(&self, topic: &str, payload: String) {
        match self.client.publish(topic, payload).await {
            Ok(()) => debug!("Message published to '{}'", topic),
            Err(e) => error!("Failed to publish message to '{}': {}", topic, e),
        }
    }

    /// Consume transport events until the transport or the bridge goes away.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<ApplianceRegistry>,
        mut events: mpsc::Receiver<BrokerEvent>,
        set_messages: mpsc::Sender<SetMessage>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Connected => self.on_connect(&registry).await,
                BrokerEvent::Disconnected(reason) => self.on_disconnect(&reason).await,
                BrokerEvent::Message { topic, payload } => {
                    if let Some(message) = self.route(&registry, &topic, payload) {
                        if set_messages.send(message).await.is_err() {
                            debug!("Set-message consumer is gone, stopping dispatch.");
                            break;
                        }
                    }
                }
            }
        }
        debug!("Broker event dispatch stopped.");
    }

    /// Disconnect from the broker and stop the transport task.
    pub async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect cleanly: {}", e);
        }
        self.state.lock().await.connected = false;

        if let Some(mut transport) = self.transport.lock().await.take() {
            if timeout(REQUEST_TIMEOUT, &mut transport).await.is_err() {
                transport.abort();
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    timeout(CONNECT_TIMEOUT, read_connack(eventloop))
        .await
        .map_err(|_| BrokerError::Timeout("waiting for CONNACK".to_string()))?
}

/// A refused CONNACK surfaces as `ConnectionError::ConnectionRefused` from `poll`.
async fn read_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
            event => debug!("Waiting for CONNACK, got {:?}", event),
        }
    }
}

#[derive(Debug, PartialEq)]
enum TransportStep {
    Forward(BrokerEvent),
    Skip,
    Stop,
}

fn classify(event: Event) -> TransportStep {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => TransportStep::Forward(BrokerEvent::Connected),
        Event::Incoming(Packet::Publish(publish)) => TransportStep::Forward(BrokerEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Event::Outgoing(Outgoing::Disconnect) => TransportStep::Stop,
        event => {
            debug!("Unhandled event: {:?}", event);
            TransportStep::Skip
        }
    }
}

/// Drive the rumqttc event loop. Connection errors back off exponentially;
/// the next poll reconnects and a fresh CONNACK triggers resubscription.
async fn run_transport(mut eventloop: EventLoop, events: mpsc::Sender<BrokerEvent>) {
    let mut retry_interval = INITIAL_RETRY_INTERVAL;

    loop {
        let event = match eventloop.poll().await {
            Ok(event) => match classify(event) {
                TransportStep::Forward(event) => event,
                TransportStep::Skip => continue,
                TransportStep::Stop => {
                    info!("Disconnected from MQTT broker.");
                    break;
                }
            },
            Err(e) => {
                error!("Error in MQTT event loop: {:?}", e);
                if events.send(BrokerEvent::Disconnected(e.to_string())).await.is_err() {
                    break;
                }
                warn!("Retrying in {:?}...", retry_interval);
                sleep(retry_interval).await;
                retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
                continue;
            }
        };

        if event == BrokerEvent::Connected {
            retry_interval = INITIAL_RETRY_INTERVAL;
        }
        if events.send(event).await.is_err() {
            break;
        }
    }
}
