//! Real-time notification fan-out
//!
//! Every state change (lease transitions, evictions, reservation decisions,
//! policy edits) becomes an [`Event`] published through the
//! [`NotificationHub`] to subscribers filtered by key and group.

mod hub;
mod transport;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Device;

pub use hub::{NotificationHub, PublishReport, SubscriptionStats};
pub use transport::{ChannelTransport, Transport};

/// Kind of notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A device changed state or holder
    DeviceStatus,
    /// Something went wrong (node unhealthy, device offline)
    Alert,
    /// Reservation, grant or sharing policy changed
    ConfigChange,
}

/// Wire payload delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Routing key, usually a device id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Routing group, usually the device's owning group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub data: serde_json::Value,
    /// RFC 3339 with millisecond precision
    #[serde(serialize_with = "serialize_millis")]
    pub timestamp: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(
    at: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl Event {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn new(
        event_type: EventType,
        key: Option<String>,
        group: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            key,
            group,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Snapshot of a device's state, keyed by device and routed to its group
    #[must_use]
    pub fn device_status(device: &Device) -> Self {
        Self::new(
            EventType::DeviceStatus,
            Some(device.id.clone()),
            Some(device.owning_group.clone()),
            serde_json::json!({
                "device_id": device.id,
                "state": device.state,
                "holder": device.current_holder,
            }),
        )
    }

    /// Alert with a human-readable message
    #[must_use]
    pub fn alert(
        key: impl Into<String>,
        group: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            EventType::Alert,
            Some(key.into()),
            group,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Policy or booking change
    #[must_use]
    pub fn config_change(
        key: impl Into<String>,
        group: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(EventType::ConfigChange, Some(key.into()), group, data)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::DeviceState;

    #[test]
    fn wire_format_uses_type_tag_and_rfc3339() {
        let event = Event::alert("d1", Some("lab".to_string()), "device offline");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "alert");
        assert_eq!(json["key"], "d1");
        assert_eq!(json["group"], "lab");
        assert_eq!(json["data"]["message"], "device offline");

        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let mut event = Event::alert("d1", None, "late");
        event.timestamp = Utc.with_ymd_and_hms(2030, 1, 1, 10, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp"], "2030-01-01T10:00:00.123Z");
    }

    #[test]
    fn device_status_carries_state() {
        let now = Utc::now();
        let device = Device {
            id: "d1".to_string(),
            node_id: None,
            display_name: "Dongle".to_string(),
            owning_group: "lab".to_string(),
            current_holder: Some("alice".to_string()),
            state: DeviceState::Leased,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(Event::device_status(&device)).unwrap();
        assert_eq!(json["type"], "device_status");
        assert_eq!(json["data"]["state"], "leased");
        assert_eq!(json["data"]["holder"], "alice");
    }

    #[test]
    fn absent_routing_fields_are_omitted() {
        let event = Event::new(EventType::ConfigChange, None, None, serde_json::json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("key").is_none());
        assert!(json.get("group").is_none());
    }
}
