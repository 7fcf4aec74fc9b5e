//! Device-driver seam.
//!
//! The low-level appliance protocol lives behind [`DriverConnector`] and
//! [`ApplianceDriver`]. The bridge only ever talks to these traits, so a LAN
//! driver can be dropped in without touching the registry or the broker side.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("appliance at {0} is unreachable")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("attribute '{attribute}' rejected: {reason}")]
    Rejected { attribute: String, reason: String },
}

/// A connected driver session for one appliance.
#[async_trait]
pub trait ApplianceDriver: Send + Sync {
    /// Pull the latest state from the appliance.
    async fn refresh(&mut self) -> Result<(), DriverError>;

    /// Push pending attribute changes to the appliance.
    async fn apply(&mut self) -> Result<(), DriverError>;

    fn is_online(&self) -> bool;

    /// Current value of a state attribute, `None` if the driver does not know it.
    fn attribute(&self, name: &str) -> Option<Value>;

    /// Stage a new value on the pending state.
    fn set_attribute(&mut self, name: &str, value: Value) -> Result<(), DriverError>;

    /// Whether staged changes require a round-trip to the hardware.
    fn needs_apply(&self) -> bool;
}

#[async_trait]
pub trait DriverConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        token: &str,
        key: &str,
    ) -> Result<Box<dyn ApplianceDriver>, DriverError>;
}

/// Numbers compare by value so that `21` and `21.0` count as the same setting.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Driver that keeps the appliance state in memory.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Map<String, Value>,
    pending: Map<String, Value>,
}

impl MemoryDriver {
    pub fn new(state: Map<String, Value>) -> Self {
        Self {
            state,
            pending: Map::new(),
        }
    }
}

#[async_trait]
impl ApplianceDriver for MemoryDriver {
    async fn refresh(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn apply(&mut self) -> Result<(), DriverError> {
        let pending = std::mem::take(&mut self.pending);
        debug!("Applying {} pending attribute(s)", pending.len());
        self.state.extend(pending);
        Ok(())
    }

    fn is_online(&self) -> bool {
        true
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        self.pending
            .get(name)
            .or_else(|| self.state.get(name))
            .cloned()
    }

    fn set_attribute(&mut self, name: &str, value: Value) -> Result<(), DriverError> {
        if value.is_null() {
            return Err(DriverError::Rejected {
                attribute: name.to_string(),
                reason: "null is not a settable value".to_string(),
            });
        }
        match self.state.get(name) {
            Some(current) if same_value(current, &value) => {
                self.pending.remove(name);
            }
            _ => {
                self.pending.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn needs_apply(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Hands out a fresh [`MemoryDriver`] per appliance, seeded with a dehumidifier state.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    seed: Map<String, Value>,
}

impl MemoryConnector {
    #[cfg(test)]
    pub fn new(seed: Map<String, Value>) -> Self {
        Self { seed }
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        let mut seed = Map::new();
        seed.insert("running".into(), Value::Bool(false));
        seed.insert("fan_speed".into(), Value::from(40));
        seed.insert("target_humidity".into(), Value::from(50));
        seed.insert("ion_mode".into(), Value::Bool(false));
        seed.insert("mode".into(), Value::from(1));
        seed.insert("current_humidity".into(), Value::from(50));
        seed.insert("current_temperature".into(), Value::from(20.0));
        seed.insert("tank_level".into(), Value::from(0));
        seed.insert("tank_full".into(), Value::Bool(false));
        seed.insert("model".into(), Value::from("memory"));
        seed.insert("type".into(), Value::from("0xa1"));
        seed.insert("name".into(), Value::from("Dehumidifier"));
        Self { seed }
    }
}

#[async_trait]
impl DriverConnector for MemoryConnector {
    async fn connect(
        &self,
        address: &str,
        _token: &str,
        _key: &str,
    ) -> Result<Box<dyn ApplianceDriver>, DriverError> {
        if address.is_empty() {
            return Err(DriverError::Unreachable(address.to_string()));
        }
        Ok(Box::new(MemoryDriver::new(self.seed.clone())))
    }
}
