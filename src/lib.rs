pub mod backend;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod faults;
pub mod gpio;
pub mod persistence;
pub mod reconfig;
pub mod registry;
pub mod routes;
pub mod selection;
pub mod transport;
pub mod zone;

pub use bridge::Bridge;
pub use config::{AppConfig, HttpConfig, MqttConfig, PinConfig, TimingConfig, ZoneConfig};
pub use error::AppError;
pub use faults::{ErrorBus, ErrorItem, FaultLog, LogRouter, Priority};
pub use gpio::{EdgeEvent, EventHandler, GpioBackend, GpioEngine, ZoneEvent};
pub use persistence::{ClassificationMap, JsonFileStore, PersistenceStore};
pub use registry::ZoneRegistry;
pub use routes::AppState;
pub use transport::{MqttTransport, Outbox, Transport, TransportEvent};
pub use zone::{InputKind, OutputKind, RoleClass, Zone};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
