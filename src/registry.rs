use crate::appliance::ApplianceProxy;
use crate::config::ApplianceConfig;
use crate::driver::DriverConnector;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub type SharedAppliance = Arc<Mutex<ApplianceProxy>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no valid appliances configured")]
    NoValidAppliances,
    #[error("none of the {0} configured appliances came online")]
    NoOnlineAppliances(usize),
}

/// Outcome of connecting every appliance at startup.
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub online: usize,
    /// `(topic, payload)` for every appliance whose first refresh succeeded.
    pub snapshots: Vec<(String, String)>,
}

/// Fully-qualified topic to appliance. Immutable once built; each appliance
/// carries its own lock.
#[derive(Debug)]
pub struct ApplianceRegistry {
    order: Vec<String>,
    appliances: HashMap<String, SharedAppliance>,
}

pub fn qualify(basetopic: &str, topic: &str) -> String {
    format!("{}/{}", basetopic, topic)
}

impl ApplianceRegistry {
    pub fn build(basetopic: &str, entries: &[ApplianceConfig]) -> Result<Self, RegistryError> {
        let mut order = Vec::new();
        let mut appliances = HashMap::new();

        for entry in entries {
            if [&entry.topic, &entry.address, &entry.token, &entry.key]
                .iter()
                .any(|field| field.is_empty())
            {
                warn!("Skipping appliance with incomplete configuration: {:?}", entry.topic);
                continue;
            }

            let topic = qualify(basetopic, &entry.topic);
            let proxy = Arc::new(Mutex::new(ApplianceProxy::new(topic.clone(), entry)));
            if appliances.insert(topic.clone(), proxy).is_some() {
                warn!("Duplicate appliance topic '{}', the later entry wins", topic);
            } else {
                order.push(topic);
            }
        }

        if appliances.is_empty() {
            return Err(RegistryError::NoValidAppliances);
        }

        Ok(Self {
            order,
            appliances,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn lookup(&self, topic: &str) -> Option<SharedAppliance> {
        self.appliances.get(topic).cloned()
    }

    /// Topics in registry order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SharedAppliance)> {
        self.order
            .iter()
            .filter_map(|topic| self.appliances.get(topic).map(|a| (topic.as_str(), a)))
    }

    /// Connect every appliance and take its first snapshot. Individual failures
    /// are logged; only a registry with nothing online is an error.
    pub async fn connect_all(
        &self,
        connector: &dyn DriverConnector,
    ) -> Result<ConnectReport, RegistryError> {
        let attempts = self.iter().map(|(topic, appliance)| async move {
            let mut proxy = appliance.lock().await;
            if let Err(e) = proxy.connect(connector).await {
                error!("Unable to connect {}: {}", topic, e);
                return (false, None);
            }
            if !proxy.is_online() {
                warn!("{} connected but reports itself offline", topic);
                return (false, None);
            }
            let snapshot = match proxy.refresh().await {
                Ok(payload) => Some((topic.to_string(), payload)),
                Err(e) => {
                    error!("Initial refresh of {} failed: {}", topic, e);
                    None
                }
            };
            (proxy.is_online(), snapshot)
        });

        let mut report = ConnectReport::default();
        for (online, snapshot) in join_all(attempts).await {
            if online {
                report.online += 1;
            }
            report.snapshots.extend(snapshot);
        }

        info!("{} of {} appliance(s) online", report.online, self.len());
        if report.online == 0 {
            return Err(RegistryError::NoOnlineAppliances(self.len()));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;

    fn entry(topic: &str, address: &str) -> ApplianceConfig {
        ApplianceConfig {
            topic: topic.to_string(),
            address: address.to_string(),
            token: "token".to_string(),
            key: "key".to_string(),
        }
    }

    #[test]
    fn topics_are_namespaced_under_basetopic() {
        let registry = ApplianceRegistry::build(
            "midea",
            &[entry("living-room", "10.0.0.1"), entry("cellar", "10.0.0.2")],
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.topics().collect::<Vec<_>>(),
            vec!["midea/living-room", "midea/cellar"]
        );
        assert!(registry.lookup("midea/cellar").is_some());
        assert!(registry.lookup("cellar").is_none());
    }

    #[tokio::test]
    async fn duplicate_topic_keeps_the_last_entry() {
        let registry = ApplianceRegistry::build(
            "midea",
            &[
                entry("cellar", "10.0.0.1"),
                entry("attic", "10.0.0.3"),
                entry("cellar", "10.0.0.2"),
            ],
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let cellar = registry.lookup("midea/cellar").unwrap();
        assert_eq!(cellar.lock().await.address(), "10.0.0.2");
        assert_eq!(
            registry.topics().collect::<Vec<_>>(),
            vec!["midea/cellar", "midea/attic"]
        );
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(matches!(
            ApplianceRegistry::build("midea", &[]),
            Err(RegistryError::NoValidAppliances)
        ));

        let mut incomplete = entry("cellar", "10.0.0.1");
        incomplete.key.clear();
        assert!(matches!(
            ApplianceRegistry::build("midea", &[incomplete]),
            Err(RegistryError::NoValidAppliances)
        ));
    }

    #[tokio::test]
    async fn connect_all_tolerates_partial_failure() {
        let registry = ApplianceRegistry::build(
            "midea",
            &[entry("cellar", "10.0.0.1"), entry("attic", "10.0.0.2")],
        )
        .unwrap();
        let connector = FakeConnector::default().refusing("10.0.0.1");

        let report = registry.connect_all(&connector).await.unwrap();
        assert_eq!(report.online, 1);
        assert_eq!(report.snapshots.len(), 1);
        assert_eq!(report.snapshots[0].0, "midea/attic");
        assert!(!registry.lookup("midea/cellar").unwrap().lock().await.is_connected());
    }

    #[tokio::test]
    async fn connect_all_counts_appliances_whose_first_refresh_fails() {
        let registry = ApplianceRegistry::build("midea", &[entry("cellar", "10.0.0.1")]).unwrap();
        let connector = FakeConnector::default().failing_refresh("10.0.0.1");

        let report = registry.connect_all(&connector).await.unwrap();
        assert_eq!(report.online, 1);
        assert!(report.snapshots.is_empty());
    }

    #[tokio::test]
    async fn connected_but_offline_appliances_are_not_counted() {
        let registry = ApplianceRegistry::build(
            "midea",
            &[entry("cellar", "10.0.0.1"), entry("attic", "10.0.0.2")],
        )
        .unwrap();
        let connector = FakeConnector::default().offline("10.0.0.1");

        let report = registry.connect_all(&connector).await.unwrap();
        assert_eq!(report.online, 1);
        assert_eq!(report.snapshots.len(), 1);
        assert_eq!(report.snapshots[0].0, "midea/attic");
        assert!(registry.lookup("midea/cellar").unwrap().lock().await.is_connected());
    }

    #[tokio::test]
    async fn all_offline_is_nothing_online() {
        let registry = ApplianceRegistry::build("midea", &[entry("cellar", "10.0.0.1")]).unwrap();
        let connector = FakeConnector::default().offline("10.0.0.1");

        assert!(matches!(
            registry.connect_all(&connector).await,
            Err(RegistryError::NoOnlineAppliances(1))
        ));
    }

    #[tokio::test]
    async fn connect_all_fails_when_nothing_comes_online() {
        let registry = ApplianceRegistry::build("midea", &[entry("cellar", "10.0.0.1")]).unwrap();
        let connector = FakeConnector::default().refusing("10.0.0.1");

        assert!(matches!(
            registry.connect_all(&connector).await,
            Err(RegistryError::NoOnlineAppliances(1))
        ));
    }
}
