#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use zonebridge::config::{PinConfig, TimingConfig, ZoneConfig};
use zonebridge::discovery::Topics;
use zonebridge::faults::{ErrorBus, FaultLog, FaultRecord};
use zonebridge::{
    AppError, Bridge, ClassificationMap, GpioBackend, GpioEngine, MockGpioBackend, Outbox,
    PersistenceStore, RoleClass, Transport, TransportEvent, ZoneRegistry,
};

pub const DEVICE: &str = "pi";
pub const PREFIX: &str = "homeassistant";

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Default)]
pub struct RecordingTransport {
    pub published: Mutex<Vec<Published>>,
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub fail_publish: AtomicBool,
    /// Publishes and disconnects never complete while set.
    pub stall: AtomicBool,
    pub disconnected: AtomicBool,
}

impl RecordingTransport {
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn last(&self, topic: &str) -> Option<String> {
        self.payloads(topic).pop()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.subscribed.lock().clear();
        self.unsubscribed.lock().clear();
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), AppError> {
        if self.stall.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(AppError::Transport("broker unreachable".into()));
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), AppError> {
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), AppError> {
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        if self.stall.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.disconnected.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub map: Mutex<ClassificationMap>,
    pub fail_load: AtomicBool,
    pub fail_save: AtomicBool,
    pub saves: Mutex<u32>,
}

impl PersistenceStore for MemoryStore {
    fn load(&self) -> Result<ClassificationMap, AppError> {
        if self.fail_load.load(Ordering::Relaxed) {
            return Err(AppError::Persistence("unreadable".into()));
        }
        Ok(self.map.lock().clone())
    }

    fn save(&self, map: &ClassificationMap) -> Result<(), AppError> {
        if self.fail_save.load(Ordering::Relaxed) {
            return Err(AppError::Persistence("disk full".into()));
        }
        *self.map.lock() = map.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLog {
    pub records: Mutex<Vec<FaultRecord>>,
}

impl FaultLog for RecordingLog {
    fn record(&self, record: &FaultRecord) {
        self.records.lock().push(record.clone());
    }
}

pub fn pin(line: u32) -> PinConfig {
    PinConfig {
        chip: "/dev/gpiochip0".into(),
        line,
    }
}

/// zone1 door, zone2 tap output, zone3 opening, zone4 toggle output.
pub fn zone_configs() -> Vec<ZoneConfig> {
    [
        ("zone1", "Front Door", 22, "door"),
        ("zone2", "Garage Opener", 25, "output_tap"),
        ("zone3", "Kitchen Window", 5, "opening"),
        ("zone4", "Porch Light", 6, "output_toggle"),
    ]
    .into_iter()
    .map(|(key, name, line, class)| ZoneConfig {
        key: key.into(),
        name: name.into(),
        pin: pin(line),
        class: class.parse::<RoleClass>().unwrap(),
    })
    .collect()
}

pub struct Harness {
    pub backend: Arc<MockGpioBackend>,
    pub registry: Arc<ZoneRegistry>,
    pub faults: Arc<ErrorBus>,
    pub log: Arc<RecordingLog>,
    pub engine: Arc<GpioEngine>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
    pub topics: Topics,
    pub bridge: Arc<Bridge>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(MockGpioBackend::default())
    }

    pub fn with_backend(backend: MockGpioBackend) -> Self {
        Self::with_engine(backend, TimingConfig::default().debounce(), 64)
    }

    pub fn with_engine(backend: MockGpioBackend, debounce: Duration, capacity: usize) -> Self {
        let backend = Arc::new(backend);
        let registry = Arc::new(ZoneRegistry::new(&zone_configs(), &ClassificationMap::new()));
        let log = Arc::new(RecordingLog::default());
        let faults = Arc::new(ErrorBus::new(log.clone()));
        let timing = TimingConfig::default();

        let engine = Arc::new(GpioEngine::new(
            backend.clone() as Arc<dyn GpioBackend>,
            registry.clone(),
            faults.clone(),
            debounce,
            capacity,
        ));
        engine.setup_all().unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryStore::default());
        let outbox = Outbox::new(transport.clone(), faults.clone());
        let topics = Topics::new(PREFIX, DEVICE);

        let bridge = Arc::new(Bridge::new(
            registry.clone(),
            engine.clone(),
            faults.clone(),
            store.clone(),
            outbox,
            topics.clone(),
            timing,
        ));

        Self {
            backend,
            registry,
            faults,
            log,
            engine,
            transport,
            store,
            topics,
            bridge,
        }
    }

    pub async fn send(&self, topic: &str, payload: &str) {
        self.bridge
            .handle_event(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .await;
    }

    pub async fn select(&self, zone: &str, class: &str) {
        self.send(&self.topics.zone_select_set(), zone).await;
        self.send(&self.topics.class_select_set(), class).await;
    }
}
