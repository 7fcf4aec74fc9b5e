use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The fixed set of attributes exchanged between the bridge and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Running,
    FanSpeed,
    TargetHumidity,
    IonMode,
    Mode,
    CurrentHumidity,
    CurrentTemperature,
    TankLevel,
    TankFull,
    Model,
    Type,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Bool,
    Integer,
    Number,
    Text,
}

#[derive(Debug, Error, PartialEq)]
pub enum AttributeError {
    #[error("attribute '{0}' is missing from the appliance state")]
    Missing(Attribute),
    #[error("attribute '{attribute}' has an unexpected value: {value}")]
    Invalid { attribute: Attribute, value: Value },
    #[error("unknown attribute '{0}'")]
    Unknown(String),
}

impl Attribute {
    /// Publish order.
    pub const ALL: [Attribute; 12] = [
        Attribute::Running,
        Attribute::FanSpeed,
        Attribute::TargetHumidity,
        Attribute::IonMode,
        Attribute::Mode,
        Attribute::CurrentHumidity,
        Attribute::CurrentTemperature,
        Attribute::TankLevel,
        Attribute::TankFull,
        Attribute::Model,
        Attribute::Type,
        Attribute::Name,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Running => "running",
            Attribute::FanSpeed => "fan_speed",
            Attribute::TargetHumidity => "target_humidity",
            Attribute::IonMode => "ion_mode",
            Attribute::Mode => "mode",
            Attribute::CurrentHumidity => "current_humidity",
            Attribute::CurrentTemperature => "current_temperature",
            Attribute::TankLevel => "tank_level",
            Attribute::TankFull => "tank_full",
            Attribute::Model => "model",
            Attribute::Type => "type",
            Attribute::Name => "name",
        }
    }

    pub fn kind(self) -> AttributeKind {
        match self {
            Attribute::Running | Attribute::IonMode | Attribute::TankFull => AttributeKind::Bool,
            Attribute::FanSpeed
            | Attribute::TargetHumidity
            | Attribute::Mode
            | Attribute::CurrentHumidity
            | Attribute::TankLevel => AttributeKind::Integer,
            Attribute::CurrentTemperature => AttributeKind::Number,
            Attribute::Model | Attribute::Type | Attribute::Name => AttributeKind::Text,
        }
    }

    /// Whether `value` has the JSON shape this attribute is stored as.
    pub fn accepts(self, value: &Value) -> bool {
        match self.kind() {
            AttributeKind::Bool => value.is_boolean(),
            AttributeKind::Integer => value.is_i64() || value.is_u64(),
            AttributeKind::Number => value.is_number(),
            AttributeKind::Text => value.is_string(),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Attribute::ALL
            .into_iter()
            .find(|attribute| attribute.name() == s)
            .ok_or_else(|| AttributeError::Unknown(s.to_string()))
    }
}

/// Last successfully read state of an appliance, restricted to the fixed attribute set.
///
/// Field order matches [`Attribute::ALL`], which is also the key order of the
/// published JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub running: bool,
    pub fan_speed: i64,
    pub target_humidity: i64,
    pub ion_mode: bool,
    pub mode: i64,
    pub current_humidity: i64,
    pub current_temperature: f64,
    pub tank_level: i64,
    pub tank_full: bool,
    pub model: String,
    #[serde(rename = "type")]
    pub appliance_type: String,
    pub name: String,
}

impl Snapshot {
    /// Build a snapshot by reading each attribute through `lookup`.
    pub fn project<F>(lookup: F) -> Result<Self, AttributeError>
    where
        F: Fn(Attribute) -> Option<Value>,
    {
        fn read<T: DeserializeOwned>(
            lookup: &impl Fn(Attribute) -> Option<Value>,
            attribute: Attribute,
        ) -> Result<T, AttributeError> {
            let value = lookup(attribute).ok_or(AttributeError::Missing(attribute))?;
            if !attribute.accepts(&value) {
                return Err(AttributeError::Invalid { attribute, value });
            }
            serde_json::from_value(value.clone())
                .map_err(|_| AttributeError::Invalid { attribute, value })
        }

        Ok(Self {
            running: read(&lookup, Attribute::Running)?,
            fan_speed: read(&lookup, Attribute::FanSpeed)?,
            target_humidity: read(&lookup, Attribute::TargetHumidity)?,
            ion_mode: read(&lookup, Attribute::IonMode)?,
            mode: read(&lookup, Attribute::Mode)?,
            current_humidity: read(&lookup, Attribute::CurrentHumidity)?,
            current_temperature: read(&lookup, Attribute::CurrentTemperature)?,
            tank_level: read(&lookup, Attribute::TankLevel)?,
            tank_full: read(&lookup, Attribute::TankFull)?,
            model: read(&lookup, Attribute::Model)?,
            appliance_type: read(&lookup, Attribute::Type)?,
            name: read(&lookup, Attribute::Name)?,
        })
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An inbound set request routed to one appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMessage {
    /// Fully-qualified appliance topic, without the `/set` suffix.
    pub topic: String,
    pub payload: Vec<u8>,
}

#[cfg(test)]
pub(crate) fn sample_state() -> serde_json::Map<String, Value> {
    let value = serde_json::json!({
        "running": true,
        "fan_speed": 60,
        "target_humidity": 50,
        "ion_mode": false,
        "mode": 1,
        "current_humidity": 58,
        "current_temperature": 21.5,
        "tank_level": 20,
        "tank_full": false,
        "model": "MDK",
        "type": "0xa1",
        "name": "Dehumidifier",
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for attribute in Attribute::ALL {
            assert_eq!(attribute.name().parse::<Attribute>(), Ok(attribute));
        }
        assert_eq!(
            "beeper".parse::<Attribute>(),
            Err(AttributeError::Unknown("beeper".to_string()))
        );
    }

    #[test]
    fn payload_has_exactly_the_fixed_keys_in_order() {
        let state = sample_state();
        let snapshot = Snapshot::project(|a| state.get(a.name()).cloned()).unwrap();
        let payload = snapshot.to_payload().unwrap();

        let parsed: serde_json::Map<String, Value> = serde_json::from_str(&payload).unwrap();
        let expected: Vec<&str> = Attribute::ALL.iter().map(|a| a.name()).collect();
        assert_eq!(parsed.len(), 12);
        for name in &expected {
            assert!(parsed.contains_key(*name));
        }

        let positions: Vec<usize> = expected
            .iter()
            .map(|name| payload.find(&format!("\"{}\":", name)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn missing_attribute_fails_projection() {
        let mut state = sample_state();
        state.remove("tank_level");
        assert_eq!(
            Snapshot::project(|a| state.get(a.name()).cloned()),
            Err(AttributeError::Missing(Attribute::TankLevel))
        );
    }

    #[test]
    fn ill_typed_attribute_fails_projection() {
        let mut state = sample_state();
        state.insert("running".to_string(), Value::from("yes"));
        assert!(matches!(
            Snapshot::project(|a| state.get(a.name()).cloned()),
            Err(AttributeError::Invalid { attribute: Attribute::Running, .. })
        ));
    }

    #[test]
    fn kinds_accept_matching_values() {
        assert!(Attribute::TargetHumidity.accepts(&Value::from(55)));
        assert!(!Attribute::TargetHumidity.accepts(&Value::from(55.5)));
        assert!(Attribute::CurrentTemperature.accepts(&Value::from(21)));
        assert!(Attribute::IonMode.accepts(&Value::Bool(true)));
        assert!(!Attribute::Name.accepts(&Value::Null));
    }
}
