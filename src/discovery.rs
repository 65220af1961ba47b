use log::error;
use serde::Serialize;

use crate::transport::{Outbox, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::zone::{Category, OutputKind, RoleClass, Zone, on_off};

pub const ZONE_PLACEHOLDER: &str = "-- Select Zone --";
pub const CLASS_PLACEHOLDER: &str = "-- Select Class --";

const MANUFACTURER: &str = "Raspberry Pi";

/// Topic names derived from the discovery prefix and the device id.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    device: String,
}

/// Inbound topics the bridge acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    SwitchCommand(String),
    ZoneSelect,
    ClassSelect,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.device)
    }

    pub fn input_state(&self, zone: &str) -> String {
        format!("{}_{zone}/state", self.device)
    }

    pub fn output_state(&self, zone: &str) -> String {
        format!("{}_{zone}/switch/state", self.device)
    }

    pub fn output_command(&self, zone: &str) -> String {
        format!("{}_{zone}/switch/set", self.device)
    }

    pub fn discovery(&self, zone: &str, category: Category) -> String {
        let component = match category {
            Category::Input => "binary_sensor",
            Category::Output => "switch",
        };
        format!("{}/{component}/{}/{zone}/config", self.prefix, self.device)
    }

    pub fn state(&self, zone: &str, class: RoleClass) -> String {
        match class.category() {
            Category::Input => self.input_state(zone),
            Category::Output => self.output_state(zone),
        }
    }

    pub fn zone_select_discovery(&self) -> String {
        format!("{}/select/{}/zone_select/config", self.prefix, self.device)
    }

    pub fn class_select_discovery(&self) -> String {
        format!("{}/select/{}/class_select/config", self.prefix, self.device)
    }

    pub fn zone_select_set(&self) -> String {
        format!("{}/zone_select/set", self.device)
    }

    pub fn zone_select_state(&self) -> String {
        format!("{}/zone_select/state", self.device)
    }

    pub fn class_select_set(&self) -> String {
        format!("{}/class_select/set", self.device)
    }

    pub fn class_select_state(&self) -> String {
        format!("{}/class_select/state", self.device)
    }

    pub fn parse_inbound(&self, topic: &str) -> Option<Inbound> {
        let topic = topic.trim();
        if topic == self.zone_select_set() {
            return Some(Inbound::ZoneSelect);
        }
        if topic == self.class_select_set() {
            return Some(Inbound::ClassSelect);
        }

        let zone = topic
            .strip_prefix(self.device.as_str())?
            .strip_prefix('_')?
            .strip_suffix("/switch/set")?;
        if zone.is_empty() || zone.contains('/') {
            return None;
        }
        Some(Inbound::SwitchCommand(zone.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    pub name: String,
    pub identifiers: Vec<String>,
    pub manufacturer: &'static str,
    pub model: String,
}

/// Discovery payload. Optional fields are left out of the JSON when unset.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub device: DeviceBlock,
}

fn output_icon(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::Toggle => "mdi:toggle-switch",
        OutputKind::Momentary => "mdi:gesture-tap-button",
    }
}

/// Renders descriptors and pushes them, retained, through the outbox.
pub struct DiscoveryPublisher {
    topics: Topics,
    zone_keys: Vec<String>,
    outbox: Outbox,
}

impl DiscoveryPublisher {
    pub fn new(topics: Topics, zone_keys: Vec<String>, outbox: Outbox) -> Self {
        Self {
            topics,
            zone_keys,
            outbox,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn device_block(&self) -> DeviceBlock {
        let device = self.topics.device();
        DeviceBlock {
            name: device.to_string(),
            identifiers: vec![device.to_string()],
            manufacturer: MANUFACTURER,
            model: format!("GPIO IO ({device})"),
        }
    }

    fn base(&self, name: String, unique_id: String, state_topic: String) -> Descriptor {
        Descriptor {
            name,
            unique_id,
            state_topic,
            command_topic: None,
            availability_topic: self.topics.availability(),
            payload_available: PAYLOAD_ONLINE,
            payload_not_available: PAYLOAD_OFFLINE,
            payload_on: None,
            payload_off: None,
            state_on: None,
            state_off: None,
            device_class: None,
            icon: None,
            options: None,
            device: self.device_block(),
        }
    }

    pub fn entity_descriptor(&self, zone: &Zone) -> Descriptor {
        let device = self.topics.device();
        match zone.class {
            RoleClass::Input(_) => Descriptor {
                payload_on: Some("ON"),
                payload_off: Some("OFF"),
                device_class: Some(zone.class.as_str()),
                ..self.base(
                    zone.name.clone(),
                    format!("{device}_{}_bin", zone.key),
                    self.topics.input_state(&zone.key),
                )
            },
            RoleClass::Output(kind) => Descriptor {
                command_topic: Some(self.topics.output_command(&zone.key)),
                payload_on: Some("ON"),
                payload_off: Some("OFF"),
                state_on: Some("ON"),
                state_off: Some("OFF"),
                icon: Some(output_icon(kind)),
                ..self.base(
                    zone.name.clone(),
                    format!("{device}_{}_sw", zone.key),
                    self.topics.output_state(&zone.key),
                )
            },
        }
    }

    pub fn zone_select_descriptor(&self) -> Descriptor {
        let device = self.topics.device();
        let options = std::iter::once(ZONE_PLACEHOLDER.to_string())
            .chain(self.zone_keys.iter().cloned())
            .collect();
        Descriptor {
            command_topic: Some(self.topics.zone_select_set()),
            icon: Some("mdi:format-list-bulleted"),
            options: Some(options),
            ..self.base(
                format!("{device} Zone Select"),
                format!("{device}_zone_select"),
                self.topics.zone_select_state(),
            )
        }
    }

    pub fn class_select_descriptor(&self) -> Descriptor {
        let device = self.topics.device();
        let options = std::iter::once(CLASS_PLACEHOLDER.to_string())
            .chain(RoleClass::ALL.iter().map(|class| class.as_str().to_string()))
            .collect();
        Descriptor {
            command_topic: Some(self.topics.class_select_set()),
            icon: Some("mdi:tag-outline"),
            options: Some(options),
            ..self.base(
                format!("{device} Class Select"),
                format!("{device}_class_select"),
                self.topics.class_select_state(),
            )
        }
    }

    async fn publish_descriptor(&self, topic: &str, descriptor: &Descriptor) -> bool {
        match serde_json::to_string(descriptor) {
            Ok(body) => self.outbox.publish_retained(topic, &body).await,
            Err(e) => {
                error!("encode descriptor for {topic}: {e}");
                false
            }
        }
    }

    pub async fn publish_entity(&self, zone: &Zone) -> bool {
        let topic = self.topics.discovery(&zone.key, zone.class.category());
        self.publish_descriptor(&topic, &self.entity_descriptor(zone))
            .await
    }

    /// An empty retained payload removes the entity on the remote side.
    pub async fn delete_entity(&self, zone: &str, category: Category) -> bool {
        let topic = self.topics.discovery(zone, category);
        self.outbox.publish_retained(&topic, "").await
    }

    pub async fn publish_state(&self, zone: &Zone) -> bool {
        let topic = self.topics.state(&zone.key, zone.class);
        self.outbox
            .publish_retained(&topic, on_off(zone.state))
            .await
    }

    pub async fn publish_output_state(&self, zone: &str, on: bool) -> bool {
        self.outbox
            .publish_retained(&self.topics.output_state(zone), on_off(on))
            .await
    }

    /// Publishes both selector descriptors. Callers reset the selection and
    /// bounce both dropdowns afterwards.
    pub async fn publish_selectors(&self) {
        self.publish_descriptor(
            &self.topics.zone_select_discovery(),
            &self.zone_select_descriptor(),
        )
        .await;
        self.publish_descriptor(
            &self.topics.class_select_discovery(),
            &self.class_select_descriptor(),
        )
        .await;
    }

    pub async fn bounce_zone(&self) -> bool {
        self.outbox
            .publish_retained(&self.topics.zone_select_state(), ZONE_PLACEHOLDER)
            .await
    }

    pub async fn bounce_class(&self) -> bool {
        self.outbox
            .publish_retained(&self.topics.class_select_state(), CLASS_PLACEHOLDER)
            .await
    }

    pub async fn publish_availability(&self, online: bool) -> bool {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.outbox
            .publish_retained(&self.topics.availability(), payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinConfig;
    use crate::error::AppError;
    use crate::zone::InputKind;

    fn topics() -> Topics {
        Topics::new("homeassistant", "pi-hall")
    }

    #[test]
    fn topic_layout() {
        let t = topics();
        assert_eq!(t.availability(), "pi-hall/availability");
        assert_eq!(t.input_state("zone1"), "pi-hall_zone1/state");
        assert_eq!(t.output_command("zone1"), "pi-hall_zone1/switch/set");
        assert_eq!(
            t.discovery("zone4", Category::Input),
            "homeassistant/binary_sensor/pi-hall/zone4/config"
        );
        assert_eq!(
            t.discovery("zone4", Category::Output),
            "homeassistant/switch/pi-hall/zone4/config"
        );
        assert_eq!(
            t.class_select_discovery(),
            "homeassistant/select/pi-hall/class_select/config"
        );
    }

    #[test]
    fn parses_inbound_topics() {
        let t = topics();
        assert_eq!(
            t.parse_inbound("pi-hall_zone7/switch/set"),
            Some(Inbound::SwitchCommand("zone7".into()))
        );
        assert_eq!(t.parse_inbound("pi-hall/zone_select/set"), Some(Inbound::ZoneSelect));
        assert_eq!(t.parse_inbound("pi-hall/class_select/set"), Some(Inbound::ClassSelect));
        assert_eq!(t.parse_inbound("other_zone7/switch/set"), None);
        assert_eq!(t.parse_inbound("pi-hall_/switch/set"), None);
        assert_eq!(t.parse_inbound("pi-hall_zone7/switch/state"), None);
    }

    #[test]
    fn descriptors_follow_role() {
        let outbox = Outbox::new(
            std::sync::Arc::new(NullTransport),
            std::sync::Arc::new(crate::faults::ErrorBus::default()),
        );
        let publisher = DiscoveryPublisher::new(topics(), vec!["zone1".into()], outbox);
        let pin = PinConfig {
            chip: "/dev/gpiochip0".into(),
            line: 22,
        };

        let door = Zone::new(
            "zone1".into(),
            "Hall".into(),
            pin.clone(),
            RoleClass::Input(InputKind::Door),
        );
        let json = serde_json::to_value(publisher.entity_descriptor(&door)).unwrap();
        assert_eq!(json["unique_id"], "pi-hall_zone1_bin");
        assert_eq!(json["device_class"], "door");
        assert!(json.get("command_topic").is_none());
        assert_eq!(json["device"]["model"], "GPIO IO (pi-hall)");

        let tap = Zone::new(
            "zone1".into(),
            "Hall".into(),
            pin,
            RoleClass::Output(OutputKind::Momentary),
        );
        let json = serde_json::to_value(publisher.entity_descriptor(&tap)).unwrap();
        assert_eq!(json["unique_id"], "pi-hall_zone1_sw");
        assert_eq!(json["command_topic"], "pi-hall_zone1/switch/set");
        assert_eq!(json["icon"], "mdi:gesture-tap-button");
        assert_eq!(json["state_off"], "OFF");

        let classes = serde_json::to_value(publisher.class_select_descriptor()).unwrap();
        assert_eq!(classes["options"][0], CLASS_PLACEHOLDER);
        assert_eq!(classes["options"][5], "output_tap");
    }

    struct NullTransport;

    #[async_trait::async_trait]
    impl crate::transport::Transport for NullTransport {
        async fn publish(&self, _: &str, _: &str, _: bool) -> Result<(), AppError> {
            Ok(())
        }
        async fn subscribe(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), AppError> {
            Ok(())
        }
    }
}
