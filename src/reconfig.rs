use std::sync::Arc;

use log::{info, warn};

use crate::discovery::DiscoveryPublisher;
use crate::error::AppError;
use crate::faults::{ErrorBus, Priority, keys};
use crate::gpio::GpioEngine;
use crate::persistence::{ClassificationMap, PersistenceStore};
use crate::registry::ZoneRegistry;
use crate::transport::Outbox;
use crate::zone::{Category, RoleClass};

/// What each step of a role change achieved. Steps never abort each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub zone: String,
    pub previous: RoleClass,
    pub class: RoleClass,
    pub persisted: bool,
    pub reprogrammed: bool,
    pub old_entity_deleted: bool,
    pub entity_published: bool,
    pub state_published: bool,
}

pub struct ReconfigurationController {
    registry: Arc<ZoneRegistry>,
    engine: Arc<GpioEngine>,
    store: Arc<dyn PersistenceStore>,
    discovery: Arc<DiscoveryPublisher>,
    outbox: Outbox,
    faults: Arc<ErrorBus>,
}

impl ReconfigurationController {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        engine: Arc<GpioEngine>,
        store: Arc<dyn PersistenceStore>,
        discovery: Arc<DiscoveryPublisher>,
        outbox: Outbox,
        faults: Arc<ErrorBus>,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            discovery,
            outbox,
            faults,
        }
    }

    /// Moves `key` to `class`. Returns `None` when the zone already has it.
    ///
    /// Order: persist, reprogram the pin, delete the old-category entity,
    /// publish the new entity, then subscribe and seed (outputs) or publish
    /// the observed state (inputs). Every step is a retained publish or a
    /// whole-map write, so replaying a transition is harmless.
    pub async fn apply(
        &self,
        key: &str,
        class: RoleClass,
    ) -> Result<Option<TransitionReport>, AppError> {
        let current = self.registry.get(key)?;
        if current.class == class {
            return Ok(None);
        }
        let previous = current.class;

        let persisted = self.persist(key, class);

        let change = self.engine.apply_role(key, class)?;
        let reprogrammed = change.reprogram.is_ok();

        let old_entity_deleted = if previous.category() != class.category() {
            self.discovery.delete_entity(key, previous.category()).await
        } else {
            false
        };

        let zone = self.registry.get(key)?;
        let entity_published = self.discovery.publish_entity(&zone).await;

        let state_published = match class.category() {
            Category::Output => {
                let topic = self.discovery.topics().output_command(key);
                self.outbox.subscribe(&topic).await;
                match self.engine.output_state(key) {
                    Ok(on) => self.discovery.publish_output_state(key, on).await,
                    Err(e) => {
                        warn!("seed state for {key} skipped: {e}");
                        false
                    }
                }
            }
            Category::Input => {
                if previous.is_output() {
                    let topic = self.discovery.topics().output_command(key);
                    self.outbox.unsubscribe(&topic).await;
                }
                self.discovery.publish_state(&zone).await
            }
        };

        info!("ZONE_CLASS_SET {key}: {previous} -> {class}");
        Ok(Some(TransitionReport {
            zone: key.to_string(),
            previous,
            class,
            persisted,
            reprogrammed,
            old_entity_deleted,
            entity_published,
            state_published,
        }))
    }

    /// Read-modify-write of the whole map. An unreadable store falls back to
    /// the classes currently in the registry.
    fn persist(&self, key: &str, class: RoleClass) -> bool {
        let mut map = match self.store.load() {
            Ok(map) => map,
            Err(e) => {
                warn!("reload classes failed, rebuilding from registry: {e}");
                self.registry
                    .snapshot()
                    .into_iter()
                    .map(|zone| (zone.key, zone.class))
                    .collect::<ClassificationMap>()
            }
        };
        map.insert(key.to_string(), class);

        match self.store.save(&map) {
            Ok(()) => {
                self.faults.clear(keys::STORE_WRITE);
                true
            }
            Err(e) => {
                warn!("persist class for {key} failed: {e}");
                self.faults.raise(
                    keys::STORE_WRITE,
                    format!("Persist failed: {e}"),
                    Priority::MEDIUM_HIGH,
                    None,
                );
                false
            }
        }
    }
}
