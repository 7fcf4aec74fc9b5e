//! Fakes for the driver and broker seams, shared by the unit tests.

use crate::driver::{ApplianceDriver, DriverConnector, DriverError, MemoryDriver};
use crate::models::sample_state;
use crate::mqtt_service::{BrokerClient, BrokerError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Default, Clone)]
pub struct DriverRecord {
    sets: Arc<Mutex<Vec<(String, String, Value)>>>,
    applies: Arc<AtomicUsize>,
}

impl DriverRecord {
    /// `(address, attribute, value)` for every staged attribute.
    pub fn sets(&self) -> Vec<(String, String, Value)> {
        self.sets.lock().unwrap().clone()
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeConnector {
    offline: HashSet<String>,
    failing_refresh: HashSet<String>,
    refused: HashSet<String>,
    record: DriverRecord,
}

impl FakeConnector {
    pub fn offline(mut self, address: &str) -> Self {
        self.offline.insert(address.to_string());
        self
    }

    pub fn failing_refresh(mut self, address: &str) -> Self {
        self.failing_refresh.insert(address.to_string());
        self
    }

    pub fn refusing(mut self, address: &str) -> Self {
        self.refused.insert(address.to_string());
        self
    }

    pub fn record(&self) -> DriverRecord {
        self.record.clone()
    }
}

#[async_trait]
impl DriverConnector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
        _token: &str,
        _key: &str,
    ) -> Result<Box<dyn ApplianceDriver>, DriverError> {
        if self.refused.contains(address) {
            return Err(DriverError::Unreachable(address.to_string()));
        }
        Ok(Box::new(FakeDriver {
            address: address.to_string(),
            inner: MemoryDriver::new(sample_state()),
            online: !self.offline.contains(address),
            fail_refresh: self.failing_refresh.contains(address),
            record: self.record.clone(),
        }))
    }
}

struct FakeDriver {
    address: String,
    inner: MemoryDriver,
    online: bool,
    fail_refresh: bool,
    record: DriverRecord,
}

#[async_trait]
impl ApplianceDriver for FakeDriver {
    async fn refresh(&mut self) -> Result<(), DriverError> {
        if self.fail_refresh {
            return Err(DriverError::Protocol("no response".to_string()));
        }
        self.inner.refresh().await
    }

    async fn apply(&mut self) -> Result<(), DriverError> {
        self.record.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply().await
    }

    fn is_online(&self) -> bool {
        self.online
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        self.inner.attribute(name)
    }

    fn set_attribute(&mut self, name: &str, value: Value) -> Result<(), DriverError> {
        self.record
            .sets
            .lock()
            .unwrap()
            .push((self.address.clone(), name.to_string(), value.clone()));
        self.inner.set_attribute(name, value)
    }

    fn needs_apply(&self) -> bool {
        self.inner.needs_apply()
    }
}

/// Broker client that records traffic instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingClient {
    published: Mutex<Vec<(String, String)>>,
    subscribed: Mutex<Vec<String>>,
    failing_topics: HashSet<String>,
    disconnects: AtomicUsize,
}

impl RecordingClient {
    /// Subscribing to or publishing on `topic` fails.
    pub fn failing_on(mut self, topic: &str) -> Self {
        self.failing_topics.insert(topic.to_string());
        self
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for RecordingClient {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        if self.failing_topics.contains(topic) {
            return Err(BrokerError::Timeout(topic.to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if self.failing_topics.contains(topic) {
            return Err(BrokerError::Timeout(topic.to_string()));
        }
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Shared buffer usable as a `tracing_subscriber` writer.
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedOutput {
    type Writer = CapturedOutput;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
