use std::sync::Arc;

use chrono::{DateTime, Local};
use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

/// Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGH: Priority = Priority(10);
    pub const MEDIUM_HIGH: Priority = Priority(30);
    pub const MEDIUM: Priority = Priority(60);
    /// State notices; never rendered as a fault.
    pub const LOW: Priority = Priority(90);
}

/// Fault keys, namespaced by subsystem.
pub mod keys {
    pub const MQTT_CONNECT: &str = "mqtt.connect";
    pub const MQTT_DOWN: &str = "mqtt.down";
    pub const MQTT_PUBLISH: &str = "mqtt.publish";
    pub const GPIO_INIT: &str = "gpio.init";
    pub const GPIO_MODE: &str = "gpio.mode";
    pub const GPIO_INPUT: &str = "gpio.input";
    pub const GPIO_OUTPUT: &str = "gpio.output";
    pub const STORE_WRITE: &str = "store.write";
    pub const ZONES_OPEN: &str = "zones.open";
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorItem {
    pub key: String,
    pub message: String,
    pub priority: Priority,
    pub since: DateTime<Local>,
    pub last_update: DateTime<Local>,
    pub count: u64,
    pub meta: Option<Value>,
    #[serde(skip)]
    seq: u64,
}

impl ErrorItem {
    fn order_key(&self) -> (Priority, DateTime<Local>, u64) {
        (self.priority, self.since, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaultRecord {
    Raised {
        key: String,
        priority: Priority,
        message: String,
    },
    Cleared {
        key: String,
        priority: Priority,
        message: String,
    },
}

impl FaultRecord {
    pub fn key(&self) -> &str {
        match self {
            FaultRecord::Raised { key, .. } | FaultRecord::Cleared { key, .. } => key,
        }
    }
}

/// Destination for fault log records.
pub trait FaultLog: Send + Sync {
    fn record(&self, record: &FaultRecord);
}

/// Routes fault records to `log` targets by key prefix.
pub struct LogRouter {
    routes: Vec<(String, &'static str)>,
    default_target: &'static str,
}

impl Default for LogRouter {
    fn default() -> Self {
        Self {
            routes: vec![
                ("cpu.".to_string(), "zonebridge::core"),
                ("throttle.".to_string(), "zonebridge::core"),
                ("zones.".to_string(), "zonebridge::state"),
            ],
            default_target: "zonebridge::service",
        }
    }
}

impl LogRouter {
    pub fn new(default_target: &'static str) -> Self {
        Self {
            routes: Vec::new(),
            default_target,
        }
    }

    pub fn route(mut self, prefix: impl Into<String>, target: &'static str) -> Self {
        self.routes.push((prefix.into(), target));
        self
    }

    pub fn target(&self, key: &str) -> &'static str {
        self.routes
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, target)| *target)
            .unwrap_or(self.default_target)
    }
}

impl FaultLog for LogRouter {
    fn record(&self, record: &FaultRecord) {
        let target = self.target(record.key());
        match record {
            FaultRecord::Raised {
                key,
                priority,
                message,
            } => info!(target: target, "[RAISE] {key} prio={} msg={message}", priority.0),
            FaultRecord::Cleared {
                key,
                priority,
                message,
            } => info!(
                target: target,
                "[CLEAR] {key} resolved (was prio={} msg={message})",
                priority.0
            ),
        }
    }
}

type Fingerprint = (Priority, String, Option<String>);

fn fingerprint(priority: Priority, message: &str, meta: Option<&Value>) -> Fingerprint {
    // serde_json maps are key-sorted, so this is canonical
    (priority, message.to_string(), meta.map(Value::to_string))
}

struct BusInner {
    items: FxHashMap<String, ErrorItem>,
    logged: FxHashMap<String, Fingerprint>,
    dirty: bool,
    next_seq: u64,
}

/// Priority-ordered set of live faults with log-on-change semantics.
pub struct ErrorBus {
    inner: Mutex<BusInner>,
    log: Arc<dyn FaultLog>,
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new(Arc::new(LogRouter::default()))
    }
}

impl ErrorBus {
    pub fn new(log: Arc<dyn FaultLog>) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                items: FxHashMap::default(),
                logged: FxHashMap::default(),
                dirty: true,
                next_seq: 0,
            }),
            log,
        }
    }

    /// Upserts `key`. Logs only when the fingerprint differs from the last
    /// logged one for this key.
    pub fn raise(
        &self,
        key: &str,
        message: impl Into<String>,
        priority: Priority,
        meta: Option<Value>,
    ) {
        let message = message.into();
        let now = Local::now();
        let fp = fingerprint(priority, &message, meta.as_ref());

        let record = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;

            match inner.items.get_mut(key) {
                Some(item) => {
                    item.message = message.clone();
                    item.priority = priority;
                    item.last_update = now;
                    item.count += 1;
                    if meta.is_some() {
                        item.meta = meta;
                    }
                }
                None => {
                    inner.items.insert(
                        key.to_string(),
                        ErrorItem {
                            key: key.to_string(),
                            message: message.clone(),
                            priority,
                            since: now,
                            last_update: now,
                            count: 1,
                            meta,
                            seq,
                        },
                    );
                }
            }
            inner.dirty = true;

            if inner.logged.get(key) == Some(&fp) {
                None
            } else {
                inner.logged.insert(key.to_string(), fp);
                Some(FaultRecord::Raised {
                    key: key.to_string(),
                    priority,
                    message,
                })
            }
        };

        if let Some(record) = record {
            self.log.record(&record);
        }
    }

    /// Removes `key` if present. Absent keys are a no-op.
    pub fn clear(&self, key: &str) {
        let record = {
            let mut inner = self.inner.lock();
            let Some(item) = inner.items.remove(key) else {
                return;
            };
            inner.logged.remove(key);
            inner.dirty = true;
            FaultRecord::Cleared {
                key: item.key,
                priority: item.priority,
                message: item.message,
            }
        };
        self.log.record(&record);
    }

    /// Most urgent item (oldest first among equal priorities) and whether
    /// anything changed since the last `mark_clean`.
    pub fn snapshot_top(&self) -> (Option<ErrorItem>, bool) {
        let inner = self.inner.lock();
        let top = inner
            .items
            .values()
            .min_by_key(|item| item.order_key())
            .cloned();
        (top, inner.dirty)
    }

    /// Like `snapshot_top`, but hides state notices at `Priority::LOW`.
    pub fn display_top(&self) -> (Option<ErrorItem>, bool) {
        let (top, dirty) = self.snapshot_top();
        (top.filter(|item| item.priority < Priority::LOW), dirty)
    }

    pub fn mark_clean(&self) {
        self.inner.lock().dirty = false;
    }

    pub fn get(&self, key: &str) -> Option<ErrorItem> {
        self.inner.lock().items.get(key).cloned()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner.lock().items.contains_key(key)
    }

    /// All live items in display order.
    pub fn items(&self) -> Vec<ErrorItem> {
        let mut items: Vec<ErrorItem> = self.inner.lock().items.values().cloned().collect();
        items.sort_by_key(|item| item.order_key());
        items
    }
}
