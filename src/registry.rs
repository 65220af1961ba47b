use parking_lot::Mutex;

use crate::config::ZoneConfig;
use crate::error::AppError;
use crate::persistence::ClassificationMap;
use crate::zone::{RoleClass, Zone};

struct RegistryInner {
    zones: Vec<Zone>,
    last_input_change: Option<String>,
}

impl RegistryInner {
    fn zone_mut(&mut self, key: &str) -> Result<&mut Zone, AppError> {
        self.zones
            .iter_mut()
            .find(|zone| zone.key == key)
            .ok_or_else(|| AppError::NotFoundZone(key.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub state: bool,
    pub changed: bool,
}

/// Catalog of zones and their live state. Zone order follows the config.
pub struct ZoneRegistry {
    inner: Mutex<RegistryInner>,
}

impl ZoneRegistry {
    /// Builds the catalog, letting persisted classes override configured ones.
    pub fn new(configs: &[ZoneConfig], persisted: &ClassificationMap) -> Self {
        let zones = configs
            .iter()
            .map(|cfg| {
                let class = persisted.get(&cfg.key).copied().unwrap_or(cfg.class);
                Zone::new(cfg.key.clone(), cfg.name.clone(), cfg.pin.clone(), class)
            })
            .collect();

        Self {
            inner: Mutex::new(RegistryInner {
                zones,
                last_input_change: None,
            }),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().zones.iter().map(|z| z.key.clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().zones.iter().any(|z| z.key == key)
    }

    pub fn get(&self, key: &str) -> Result<Zone, AppError> {
        self.with_zone(key, |zone| zone.clone())
    }

    pub fn snapshot(&self) -> Vec<Zone> {
        self.inner.lock().zones.clone()
    }

    /// Flips the role and invalidates pending pulses. Returns the previous class.
    pub fn set_role(&self, key: &str, class: RoleClass) -> Result<RoleClass, AppError> {
        self.set_role_with(key, class, |_| ())
            .map(|(previous, ())| previous)
    }

    /// Flips the role, then runs `rederive` on the zone in the same critical
    /// section so no state change can land between the two.
    pub fn set_role_with<R>(
        &self,
        key: &str,
        class: RoleClass,
        rederive: impl FnOnce(&mut Zone) -> R,
    ) -> Result<(RoleClass, R), AppError> {
        self.with_zone(key, |zone| {
            let previous = zone.class;
            zone.class = class;
            zone.generation += 1;
            zone.pending_pulse = None;
            (previous, rederive(zone))
        })
    }

    /// Returns whether the state changed.
    pub fn set_state(&self, key: &str, state: bool) -> Result<bool, AppError> {
        let change = self.sample_state(key, |_| Ok::<_, AppError>(Some(state)))??;
        Ok(change.is_some_and(|c| c.changed))
    }

    /// Samples the zone and stores the result under one lock. A sample of
    /// `None` leaves the zone untouched; a sampling error is handed back as
    /// the inner result.
    pub fn sample_state<E>(
        &self,
        key: &str,
        sample: impl FnOnce(&Zone) -> Result<Option<bool>, E>,
    ) -> Result<Result<Option<StateChange>, E>, AppError> {
        let mut inner = self.inner.lock();
        let zone = inner.zone_mut(key)?;
        let state = match sample(zone) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(Ok(None)),
            Err(e) => return Ok(Err(e)),
        };

        let changed = zone.state != state;
        zone.state = state;
        let input = !zone.class.is_output();
        if changed && input {
            inner.last_input_change = Some(key.to_string());
        }
        Ok(Ok(Some(StateChange { state, changed })))
    }

    /// Keys of open input zones, in catalog order. Outputs never count.
    pub fn snapshot_open_inputs(&self) -> Vec<String> {
        self.inner
            .lock()
            .zones
            .iter()
            .filter(|zone| !zone.class.is_output() && zone.state)
            .map(|zone| zone.key.clone())
            .collect()
    }

    pub fn last_input_change(&self) -> Option<String> {
        self.inner.lock().last_input_change.clone()
    }

    /// Runs `f` on the zone inside the registry's critical section.
    pub(crate) fn with_zone<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Zone) -> R,
    ) -> Result<R, AppError> {
        let mut inner = self.inner.lock();
        let zone = inner.zone_mut(key)?;
        Ok(f(zone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinConfig;
    use crate::zone::{InputKind, OutputKind};

    fn configs() -> Vec<ZoneConfig> {
        (1..=3)
            .map(|i| ZoneConfig {
                key: format!("zone{i}"),
                name: format!("Zone {i}"),
                pin: PinConfig {
                    chip: "/dev/gpiochip0".into(),
                    line: 20 + i,
                },
                class: RoleClass::default(),
            })
            .collect()
    }

    #[test]
    fn persisted_classes_override_config() {
        let mut persisted = ClassificationMap::new();
        persisted.insert("zone2".into(), RoleClass::Output(OutputKind::Toggle));
        let registry = ZoneRegistry::new(&configs(), &persisted);

        assert_eq!(
            registry.get("zone1").unwrap().class,
            RoleClass::Input(InputKind::Opening)
        );
        assert_eq!(
            registry.get("zone2").unwrap().class,
            RoleClass::Output(OutputKind::Toggle)
        );
        assert!(matches!(registry.get("zone9"), Err(AppError::NotFoundZone(_))));
    }

    #[test]
    fn set_state_reports_changes_only() {
        let registry = ZoneRegistry::new(&configs(), &ClassificationMap::new());
        assert!(registry.set_state("zone1", true).unwrap());
        assert!(!registry.set_state("zone1", true).unwrap());
        assert_eq!(registry.last_input_change().as_deref(), Some("zone1"));
    }

    #[test]
    fn open_inputs_exclude_outputs_and_keep_order() {
        let registry = ZoneRegistry::new(&configs(), &ClassificationMap::new());
        registry.set_state("zone3", true).unwrap();
        registry.set_state("zone1", true).unwrap();
        registry.set_state("zone2", true).unwrap();
        registry
            .set_role("zone2", RoleClass::Output(OutputKind::Momentary))
            .unwrap();

        assert_eq!(registry.snapshot_open_inputs(), vec!["zone1", "zone3"]);
    }

    #[test]
    fn set_role_bumps_generation_and_drops_pulse() {
        let registry = ZoneRegistry::new(&configs(), &ClassificationMap::new());
        registry
            .with_zone("zone1", |zone| zone.pending_pulse = Some(4))
            .unwrap();

        let previous = registry
            .set_role("zone1", RoleClass::Input(InputKind::Door))
            .unwrap();
        assert_eq!(previous, RoleClass::Input(InputKind::Opening));

        let zone = registry.get("zone1").unwrap();
        assert_eq!(zone.generation, 1);
        assert_eq!(zone.pending_pulse, None);
    }

    #[test]
    fn role_change_rederives_in_the_same_section() {
        let registry = ZoneRegistry::new(&configs(), &ClassificationMap::new());
        registry.set_state("zone2", true).unwrap();

        let (previous, seen) = registry
            .set_role_with("zone2", RoleClass::Output(OutputKind::Toggle), |zone| {
                let seen = (zone.class, zone.generation);
                zone.state = false;
                seen
            })
            .unwrap();

        assert_eq!(previous, RoleClass::Input(InputKind::Opening));
        assert_eq!(seen, (RoleClass::Output(OutputKind::Toggle), 1));
        assert!(!registry.get("zone2").unwrap().state);
    }

    #[test]
    fn sample_errors_leave_state_alone() {
        let registry = ZoneRegistry::new(&configs(), &ClassificationMap::new());
        let result = registry
            .sample_state("zone1", |_| Err::<Option<bool>, _>(AppError::Gpio("busy".into())))
            .unwrap();
        assert!(matches!(result, Err(AppError::Gpio(_))));
        assert!(!registry.get("zone1").unwrap().state);
        assert_eq!(registry.last_input_change(), None);

        let change = registry
            .sample_state("zone1", |_| Ok::<_, AppError>(Some(true)))
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            Some(StateChange {
                state: true,
                changed: true
            })
        );
        assert!(registry.sample_state("zone9", |_| Ok::<_, AppError>(None)).is_err());
    }
}
