use crate::config::ApplianceConfig;
use crate::driver::{ApplianceDriver, DriverConnector, DriverError};
use crate::models::{Attribute, AttributeError, Snapshot};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ApplianceError {
    #[error("{0}: appliance is not connected")]
    NotConnected(String),
    #[error("{topic}: {source}")]
    Driver {
        topic: String,
        #[source]
        source: DriverError,
    },
    #[error("{topic}: {source}")]
    Attribute {
        topic: String,
        #[source]
        source: AttributeError,
    },
    #[error("{topic}: unable to serialize snapshot: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of applying an inbound set payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Changes were written to the appliance.
    Applied,
    /// The payload matched the current state; nothing was sent.
    Unchanged,
    /// The appliance is not reachable; the payload was dropped.
    Offline,
    /// The payload was not a JSON object; dropped.
    Malformed,
}

impl SetOutcome {
    pub fn applied(self) -> bool {
        self == SetOutcome::Applied
    }
}

/// One appliance: its credentials, its driver session and its last snapshot.
pub struct ApplianceProxy {
    topic: String,
    address: String,
    token: String,
    key: String,
    driver: Option<Box<dyn ApplianceDriver>>,
    last_snapshot: Option<Snapshot>,
    online: bool,
}

impl ApplianceProxy {
    /// `topic` is the fully-qualified topic (`basetopic/topic`).
    pub fn new(topic: String, config: &ApplianceConfig) -> Self {
        Self {
            topic,
            address: config.address.clone(),
            token: config.token.clone(),
            key: config.key.clone(),
            driver: None,
            last_snapshot: None,
            online: false,
        }
    }

    #[cfg(test)]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    #[cfg(test)]
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// Open a driver session, retrying a couple of times with backoff.
    pub async fn connect(&mut self, connector: &dyn DriverConnector) -> Result<(), ApplianceError> {
        let retry = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(CONNECT_ATTEMPTS - 1);

        let (address, token, key) = (&self.address, &self.token, &self.key);
        let driver = Retry::spawn(retry, || connector.connect(address, token, key))
            .await
            .map_err(|source| ApplianceError::Driver {
                topic: self.topic.clone(),
                source,
            })?;
        self.online = driver.is_online();
        self.driver = Some(driver);
        info!("connected device {}", self.topic);
        Ok(())
    }

    /// Refresh the driver state and return the snapshot as a JSON payload.
    pub async fn refresh(&mut self) -> Result<String, ApplianceError> {
        let topic = &self.topic;
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| ApplianceError::NotConnected(topic.clone()))?;

        driver
            .refresh()
            .await
            .map_err(|source| ApplianceError::Driver {
                topic: topic.clone(),
                source,
            })?;
        self.online = driver.is_online();

        let snapshot = Snapshot::project(|attribute| driver.attribute(attribute.name()))
            .map_err(|source| ApplianceError::Attribute {
                topic: topic.clone(),
                source,
            })?;
        let payload = snapshot
            .to_payload()
            .map_err(|source| ApplianceError::Serialize {
                topic: topic.clone(),
                source,
            })?;
        debug!("{}: {}", topic, payload);

        self.last_snapshot = Some(snapshot);
        Ok(payload)
    }

    /// Stage the attributes of a set payload on the driver and apply them if needed.
    pub async fn apply_set_payload(&mut self, payload: &[u8]) -> Result<SetOutcome, ApplianceError> {
        let topic = &self.topic;
        let driver = match self.driver.as_mut() {
            Some(driver) if driver.is_online() => driver,
            _ => {
                info!("{}: offline, ignoring set request", topic);
                return Ok(SetOutcome::Offline);
            }
        };

        let changes: Map<String, Value> = match serde_json::from_slice(payload) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(
                    "{}: unable to parse set payload '{}': {}",
                    topic,
                    String::from_utf8_lossy(payload),
                    e
                );
                return Ok(SetOutcome::Malformed);
            }
        };

        for (name, value) in changes {
            match name.parse::<Attribute>() {
                Ok(attribute) if !attribute.accepts(&value) => {
                    warn!("{}: ignoring {} = {}, wrong value type", topic, attribute, value);
                    continue;
                }
                Ok(_) => {}
                Err(_) => debug!("{}: passing unknown attribute '{}' to the driver", topic, name),
            }

            if let Err(e) = driver.set_attribute(&name, value) {
                warn!("{}: {}", topic, e);
            }
        }

        if !driver.needs_apply() {
            return Ok(SetOutcome::Unchanged);
        }

        driver
            .apply()
            .await
            .map_err(|source| ApplianceError::Driver {
                topic: topic.clone(),
                source,
            })?;
        Ok(SetOutcome::Applied)
    }
}

impl fmt::Debug for ApplianceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplianceProxy")
            .field("topic", &self.topic)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("online", &self.online)
            .finish()
    }
}
