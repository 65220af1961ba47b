use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::PinConfig;
use crate::error::AppError;
use crate::faults::{ErrorBus, Priority, keys};
use crate::registry::ZoneRegistry;
use crate::zone::{Level, OutputKind, RoleClass, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinMode {
    /// Idle high; "open" reads high.
    InputPullUp,
    Output { initial: Level },
}

impl PinMode {
    pub fn for_class(class: RoleClass) -> Self {
        match class {
            RoleClass::Input(_) => PinMode::InputPullUp,
            RoleClass::Output(_) => PinMode::Output {
                initial: Level::Low,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
}

/// Raw transition reported by a backend.
#[derive(Debug, Clone)]
pub struct EdgeEvent {
    pub pin: PinConfig,
    pub edge: Option<Edge>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObserverKind {
    Interrupt,
    Poll,
}

/// Debounced transition of a zone, fanned out to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneEvent {
    pub zone: String,
    pub edge: Option<Edge>,
    pub timestamp_ms: u64,
}

pub trait GpioBackend: Send + Sync {
    fn configure(&self, pin: &PinConfig, mode: PinMode) -> Result<(), AppError>;
    /// Starts edge reporting on an input pin. An error means the pin must be polled.
    fn watch_edges(&self, pin: &PinConfig, handler: EventHandler) -> Result<(), AppError>;
    fn unwatch_edges(&self, pin: &PinConfig);
    fn read_level(&self, pin: &PinConfig) -> Result<Level, AppError>;
    fn write_level(&self, pin: &PinConfig, level: Level) -> Result<(), AppError>;
    fn release_all(&self);
}

#[derive(Default)]
struct DebounceState {
    last_accepted: Option<Instant>,
    suppressed: bool,
}

/// Maps pin edges to zones and suppresses repeats inside the debounce window.
pub struct EdgeDispatcher {
    zones_by_pin: FxHashMap<PinConfig, String>,
    window: Duration,
    debounce: Mutex<FxHashMap<String, DebounceState>>,
    event_tx: broadcast::Sender<ZoneEvent>,
}

pub type EventHandler = Arc<EdgeDispatcher>;

impl EdgeDispatcher {
    pub fn new(
        zones_by_pin: FxHashMap<PinConfig, String>,
        window: Duration,
        event_tx: broadcast::Sender<ZoneEvent>,
    ) -> Self {
        Self {
            zones_by_pin,
            window,
            debounce: Mutex::new(FxHashMap::default()),
            event_tx,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) -> bool {
        self.dispatch_at(event, Instant::now())
    }

    /// Returns false when the edge fell inside the debounce window.
    pub fn dispatch_at(&self, event: EdgeEvent, now: Instant) -> bool {
        let Some(zone) = self.zones_by_pin.get(&event.pin) else {
            return false;
        };

        {
            let mut debounce = self.debounce.lock();
            let state = debounce.entry(zone.clone()).or_default();
            if let Some(last) = state.last_accepted
                && now.saturating_duration_since(last) < self.window
            {
                state.suppressed = true;
                return false;
            }
            state.last_accepted = Some(now);
            state.suppressed = false;
        }

        let _ = self.event_tx.send(ZoneEvent {
            zone: zone.clone(),
            edge: event.edge,
            timestamp_ms: event.timestamp_ms,
        });
        true
    }

    /// Re-emits a zone whose edges were swallowed once its window has passed,
    /// so the final level is not lost.
    pub fn flush_suppressed(&self, zone: &str, now: Instant) -> bool {
        {
            let mut debounce = self.debounce.lock();
            let Some(state) = debounce.get_mut(zone) else {
                return false;
            };
            let settled = state
                .last_accepted
                .is_none_or(|last| now.saturating_duration_since(last) >= self.window);
            if !state.suppressed || !settled {
                return false;
            }
            state.suppressed = false;
            state.last_accepted = Some(now);
        }

        let _ = self.event_tx.send(ZoneEvent {
            zone: zone.to_string(),
            edge: None,
            timestamp_ms: epoch_millis(),
        });
        true
    }

    pub fn reset(&self, zone: &str) {
        self.debounce.lock().remove(zone);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ZoneEvent> {
        self.event_tx.subscribe()
    }
}

/// Watches one input zone. The poll loop ticks every observer the same way.
pub trait ZoneObserver: Send {
    fn kind(&self) -> ObserverKind;
    fn pin(&self) -> &PinConfig;
    fn tick(
        &mut self,
        backend: &dyn GpioBackend,
        dispatcher: &EdgeDispatcher,
        now: Instant,
    ) -> Result<(), AppError>;
}

/// Edges arrive from the backend; the tick only flushes swallowed edges.
pub struct InterruptObserver {
    zone: String,
    pin: PinConfig,
}

impl ZoneObserver for InterruptObserver {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Interrupt
    }

    fn pin(&self) -> &PinConfig {
        &self.pin
    }

    fn tick(
        &mut self,
        _backend: &dyn GpioBackend,
        dispatcher: &EdgeDispatcher,
        now: Instant,
    ) -> Result<(), AppError> {
        dispatcher.flush_suppressed(&self.zone, now);
        Ok(())
    }
}

/// Compares the previous polled level with the current one each tick.
pub struct PollObserver {
    pin: PinConfig,
    last: Option<Level>,
}

impl ZoneObserver for PollObserver {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Poll
    }

    fn pin(&self) -> &PinConfig {
        &self.pin
    }

    fn tick(
        &mut self,
        backend: &dyn GpioBackend,
        dispatcher: &EdgeDispatcher,
        now: Instant,
    ) -> Result<(), AppError> {
        let level = backend.read_level(&self.pin)?;
        if self.last == Some(level) {
            return Ok(());
        }

        let edge = self.last.map(|_| match level {
            Level::High => Edge::Rising,
            Level::Low => Edge::Falling,
        });
        let event = EdgeEvent {
            pin: self.pin.clone(),
            edge,
            timestamp_ms: epoch_millis(),
        };
        // keep the old level while debounced so a later tick retries
        if dispatcher.dispatch_at(event, now) {
            self.last = Some(level);
        }
        Ok(())
    }
}

/// Outcome of sampling an input zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputReading {
    pub open: bool,
    pub changed: bool,
}

/// Handle for the delayed revert of a momentary pulse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseToken {
    pub zone: String,
    pub generation: u64,
    pub id: u64,
}

#[derive(Debug)]
pub struct RoleChange {
    pub previous: RoleClass,
    pub class: RoleClass,
    pub state: bool,
    pub reprogram: Result<(), AppError>,
}

fn zone_fault(base: &str, zone: &str) -> String {
    format!("{base}.{zone}")
}

pub struct GpioEngine {
    backend: Arc<dyn GpioBackend>,
    registry: Arc<ZoneRegistry>,
    faults: Arc<ErrorBus>,
    dispatcher: EventHandler,
    observers: Mutex<FxHashMap<String, Box<dyn ZoneObserver>>>,
    next_pulse: AtomicU64,
}

impl GpioEngine {
    pub fn new(
        backend: Arc<dyn GpioBackend>,
        registry: Arc<ZoneRegistry>,
        faults: Arc<ErrorBus>,
        debounce: Duration,
        event_capacity: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity);
        let zones_by_pin = registry
            .snapshot()
            .into_iter()
            .map(|zone| (zone.pin, zone.key))
            .collect();
        let dispatcher = Arc::new(EdgeDispatcher::new(zones_by_pin, debounce, event_tx));

        Self {
            backend,
            registry,
            faults,
            dispatcher,
            observers: Mutex::new(FxHashMap::default()),
            next_pulse: AtomicU64::new(1),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ZoneEvent> {
        self.dispatcher.subscribe()
    }

    /// Programs every zone pin for its class and starts observing inputs.
    /// Any failure here is fatal for the process.
    pub fn setup_all(&self) -> Result<(), AppError> {
        for zone in self.registry.snapshot() {
            self.backend
                .configure(&zone.pin, PinMode::for_class(zone.class))
                .map_err(|e| AppError::Gpio(format!("setup {}: {e}", zone.key)))?;

            let state = match zone.class {
                RoleClass::Input(_) => {
                    let open = self.backend.read_level(&zone.pin)?.is_high();
                    self.attach_observer(&zone);
                    open
                }
                RoleClass::Output(_) => false,
            };
            self.registry.set_state(&zone.key, state)?;
        }
        Ok(())
    }

    pub fn observer_kind(&self, key: &str) -> Option<ObserverKind> {
        self.observers.lock().get(key).map(|o| o.kind())
    }

    fn attach_observer(&self, zone: &Zone) {
        let observer: Box<dyn ZoneObserver> =
            match self.backend.watch_edges(&zone.pin, self.dispatcher.clone()) {
                Ok(()) => Box::new(InterruptObserver {
                    zone: zone.key.clone(),
                    pin: zone.pin.clone(),
                }),
                Err(e) => {
                    info!("edge detection unavailable for {}, polling: {e}", zone.key);
                    Box::new(PollObserver {
                        pin: zone.pin.clone(),
                        last: None,
                    })
                }
            };
        self.observers.lock().insert(zone.key.clone(), observer);
    }

    fn detach_observer(&self, key: &str) {
        let observer = self.observers.lock().remove(key);
        if let Some(observer) = observer
            && observer.kind() == ObserverKind::Interrupt
        {
            self.backend.unwatch_edges(observer.pin());
        }
        self.dispatcher.reset(key);
    }

    /// One sweep over all observers. Read failures are raised per zone and
    /// never stop the sweep.
    pub fn poll_tick(&self, now: Instant) {
        let mut failed = Vec::new();
        let mut healthy = Vec::new();
        {
            let mut observers = self.observers.lock();
            for (key, observer) in observers.iter_mut() {
                match observer.tick(self.backend.as_ref(), &self.dispatcher, now) {
                    Ok(()) => healthy.push(key.clone()),
                    Err(e) => failed.push((key.clone(), e)),
                }
            }
        }

        for key in healthy {
            self.faults.clear(&zone_fault(keys::GPIO_INPUT, &key));
        }
        for (key, e) in failed {
            self.faults.raise(
                &zone_fault(keys::GPIO_INPUT, &key),
                format!("GPIO read failed: {key} {e}"),
                Priority::HIGH,
                None,
            );
        }
    }

    /// Samples an input zone and stores the result. Outputs yield `None`.
    pub fn refresh_input(&self, key: &str) -> Result<Option<InputReading>, AppError> {
        let backend = self.backend.as_ref();
        let result = self.registry.sample_state(key, |zone| {
            if zone.class.is_output() {
                return Ok(None);
            }
            backend.read_level(&zone.pin).map(|level| Some(level.is_high()))
        })?;

        let fault = zone_fault(keys::GPIO_INPUT, key);
        match result {
            Ok(change) => {
                self.faults.clear(&fault);
                Ok(change.map(|c| InputReading {
                    open: c.state,
                    changed: c.changed,
                }))
            }
            Err(e) => {
                self.faults.raise(
                    &fault,
                    format!("GPIO read failed: {key} {e}"),
                    Priority::HIGH,
                    None,
                );
                Err(e)
            }
        }
    }

    /// Physical level of an output zone, for seeding its published state.
    pub fn output_state(&self, key: &str) -> Result<bool, AppError> {
        let backend = self.backend.as_ref();
        let change = self.registry.sample_state(key, |zone| {
            if !zone.class.is_output() {
                return Err(AppError::InvalidState(format!("{key} is not an output")));
            }
            backend.read_level(&zone.pin).map(|level| Some(level.is_high()))
        })??;
        Ok(change.is_some_and(|c| c.state))
    }

    /// Raises or clears the zone's output fault. Role mismatches are the
    /// caller's concern and never reach the bus.
    fn note_output<T>(&self, key: &str, result: &Result<T, AppError>, what: &str) {
        let fault = zone_fault(keys::GPIO_OUTPUT, key);
        match result {
            Ok(_) => self.faults.clear(&fault),
            Err(e @ AppError::Gpio(_)) => self.faults.raise(
                &fault,
                format!("{what}: {key} {e}"),
                Priority::HIGH,
                None,
            ),
            Err(_) => {}
        }
    }

    /// Drives an output zone and cancels any pending pulse revert.
    pub fn drive_output(&self, key: &str, on: bool) -> Result<(), AppError> {
        let backend = self.backend.as_ref();
        let result = self
            .registry
            .with_zone(key, |zone: &mut Zone| -> Result<(), AppError> {
                if !zone.class.is_output() {
                    return Err(AppError::InvalidState(format!("{key} is not an output")));
                }
                zone.pending_pulse = None;
                backend.write_level(&zone.pin, Level::from_high(on))?;
                zone.state = on;
                Ok(())
            })?;
        self.note_output(key, &result, "GPIO output set failed");
        result
    }

    /// Drives a momentary zone active and returns the token its revert must present.
    pub fn start_pulse(&self, key: &str) -> Result<PulseToken, AppError> {
        let backend = self.backend.as_ref();
        let id = self.next_pulse.fetch_add(1, Ordering::Relaxed);
        let result = self
            .registry
            .with_zone(key, |zone: &mut Zone| -> Result<PulseToken, AppError> {
                if zone.class != RoleClass::Output(OutputKind::Momentary) {
                    return Err(AppError::InvalidState(format!("{key} is not momentary")));
                }
                backend.write_level(&zone.pin, Level::High)?;
                zone.state = true;
                zone.pending_pulse = Some(id);
                Ok(PulseToken {
                    zone: key.to_string(),
                    generation: zone.generation,
                    id,
                })
            })?;
        self.note_output(key, &result, "GPIO output set failed");
        result
    }

    /// Reverts a pulse if it is still the zone's pending one. A role change or
    /// an explicit command since the pulse started turns this into a no-op.
    pub fn finish_pulse(&self, token: &PulseToken) -> Result<bool, AppError> {
        let backend = self.backend.as_ref();
        let result = self
            .registry
            .with_zone(&token.zone, |zone: &mut Zone| -> Result<bool, AppError> {
                let current = zone.generation == token.generation
                    && zone.pending_pulse == Some(token.id)
                    && zone.class == RoleClass::Output(OutputKind::Momentary);
                if !current {
                    return Ok(false);
                }
                zone.pending_pulse = None;
                backend.write_level(&zone.pin, Level::Low)?;
                zone.state = false;
                Ok(true)
            })?;
        if !matches!(result, Ok(false)) {
            self.note_output(&token.zone, &result, "tap auto-off failed");
        }
        result
    }

    /// Switches a zone's role and reprograms its pin in the same critical
    /// section, re-deriving the zone state. The role flips even when the
    /// hardware refuses the new mode.
    pub fn apply_role(&self, key: &str, class: RoleClass) -> Result<RoleChange, AppError> {
        let current = self.registry.get(key)?;
        // reprogramming drops edge requests, so observers are rebuilt around it
        self.detach_observer(key);

        let backend = self.backend.as_ref();
        let (previous, (state, reprogram)) =
            self.registry.set_role_with(key, class, |zone| {
                let reprogram = backend.configure(&zone.pin, PinMode::for_class(class));
                zone.state = match (class, &reprogram) {
                    (RoleClass::Input(_), Ok(())) => backend
                        .read_level(&zone.pin)
                        .map(Level::is_high)
                        .unwrap_or(false),
                    _ => false,
                };
                (zone.state, reprogram)
            })?;
        let change = RoleChange {
            previous,
            class,
            state,
            reprogram,
        };

        if !class.is_output() {
            self.attach_observer(&current);
        }

        let fault = zone_fault(keys::GPIO_MODE, key);
        match &change.reprogram {
            Ok(()) => self.faults.clear(&fault),
            Err(e) => {
                warn!("GPIO mode set failed for {key}: {e}");
                self.faults.raise(
                    &fault,
                    format!("GPIO mode set failed: {key} {e}"),
                    Priority::HIGH,
                    None,
                );
            }
        }
        Ok(change)
    }

    pub fn release(&self) {
        let keys: Vec<String> = self.observers.lock().keys().cloned().collect();
        for key in keys {
            self.detach_observer(&key);
        }
        self.backend.release_all();
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
