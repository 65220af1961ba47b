use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::TimingConfig;
use crate::discovery::{CLASS_PLACEHOLDER, DiscoveryPublisher, Inbound, Topics, ZONE_PLACEHOLDER};
use crate::error::AppError;
use crate::faults::{ErrorBus, Priority, keys};
use crate::gpio::{GpioEngine, ObserverKind, ZoneEvent, epoch_millis};
use crate::persistence::PersistenceStore;
use crate::reconfig::ReconfigurationController;
use crate::registry::ZoneRegistry;
use crate::selection::SelectionState;
use crate::transport::{Outbox, TransportEvent};
use crate::zone::{OutputKind, RoleClass, on_off};

const OFFLINE_FLUSH_DELAY: Duration = Duration::from_millis(200);
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Glue between the transport, the GPIO engine and the discovery protocol.
pub struct Bridge {
    registry: Arc<ZoneRegistry>,
    engine: Arc<GpioEngine>,
    faults: Arc<ErrorBus>,
    discovery: Arc<DiscoveryPublisher>,
    outbox: Outbox,
    reconfig: ReconfigurationController,
    selection: SelectionState,
    timing: TimingConfig,
    shutdown: watch::Sender<bool>,
}

impl Bridge {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        engine: Arc<GpioEngine>,
        faults: Arc<ErrorBus>,
        store: Arc<dyn PersistenceStore>,
        outbox: Outbox,
        topics: Topics,
        timing: TimingConfig,
    ) -> Self {
        let discovery = Arc::new(DiscoveryPublisher::new(
            topics,
            registry.keys(),
            outbox.clone(),
        ));
        let reconfig = ReconfigurationController::new(
            registry.clone(),
            engine.clone(),
            store,
            discovery.clone(),
            outbox.clone(),
            faults.clone(),
        );

        Self {
            registry,
            engine,
            faults,
            discovery,
            outbox,
            reconfig,
            selection: SelectionState::default(),
            timing,
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::ConnectFailed(reason) => self.faults.raise(
                keys::MQTT_CONNECT,
                format!("MQTT connect failed: {reason}"),
                Priority::HIGH,
                None,
            ),
            TransportEvent::Disconnected(reason) => self.faults.raise(
                keys::MQTT_DOWN,
                format!("MQTT disconnected: {reason}"),
                Priority::HIGH,
                None,
            ),
            TransportEvent::Message { topic, payload } => self.on_message(&topic, &payload).await,
        }
    }

    /// Brings a fresh session up to date. The broker forgets subscriptions
    /// between sessions, so everything is redone on each connect.
    async fn on_connected(&self) {
        info!("MQTT connected, republishing {} zones", self.registry.keys().len());
        self.faults.clear(keys::MQTT_CONNECT);
        self.faults.clear(keys::MQTT_DOWN);
        self.discovery.publish_availability(true).await;

        self.discovery.publish_selectors().await;
        self.selection.reset();
        self.discovery.bounce_zone().await;
        self.discovery.bounce_class().await;

        let topics = self.discovery.topics();
        self.outbox.subscribe(&topics.zone_select_set()).await;
        self.outbox.subscribe(&topics.class_select_set()).await;

        for key in self.registry.keys() {
            if let Err(e) = self.publish_zone(&key).await {
                warn!("initial publish for {key} failed: {e}");
            }
        }

        for zone in self.registry.snapshot() {
            if zone.class.is_output() {
                self.outbox
                    .subscribe(&topics.output_command(&zone.key))
                    .await;
            }
        }
    }

    async fn publish_zone(&self, key: &str) -> Result<(), AppError> {
        let zone = self.registry.get(key)?;
        self.discovery.publish_entity(&zone).await;

        if zone.class.is_output() {
            let on = self.engine.output_state(key)?;
            self.discovery.publish_output_state(key, on).await;
        } else {
            self.engine.refresh_input(key)?;
            self.discovery.publish_state(&self.registry.get(key)?).await;
        }
        Ok(())
    }

    async fn on_message(&self, topic: &str, payload: &str) {
        let payload = payload.trim();
        match self.discovery.topics().parse_inbound(topic) {
            Some(Inbound::SwitchCommand(zone)) => self.on_switch_command(&zone, payload).await,
            Some(Inbound::ZoneSelect) => self.on_zone_select(payload).await,
            Some(Inbound::ClassSelect) => self.on_class_select(payload).await,
            None => warn!("ignoring message on unexpected topic {topic}"),
        }
    }

    async fn on_switch_command(&self, key: &str, payload: &str) {
        let Ok(zone) = self.registry.get(key) else {
            warn!("command for unknown zone '{key}' ignored");
            return;
        };
        let RoleClass::Output(kind) = zone.class else {
            warn!("command for input zone '{key}' ignored");
            return;
        };
        let on = match payload.to_ascii_uppercase().as_str() {
            "ON" => true,
            "OFF" => false,
            other => {
                warn!("invalid command '{other}' for {key} ignored");
                return;
            }
        };

        match (kind, on) {
            (OutputKind::Toggle, _) => {
                if self.engine.drive_output(key, on).is_ok() {
                    self.discovery.publish_output_state(key, on).await;
                    info!("OUTPUT_TOGGLE {key} -> {}", on_off(on));
                }
            }
            (OutputKind::Momentary, false) => {
                if self.engine.drive_output(key, false).is_ok() {
                    self.discovery.publish_output_state(key, false).await;
                    info!("OUTPUT_TAP {key} -> OFF");
                }
            }
            (OutputKind::Momentary, true) => {
                let Ok(token) = self.engine.start_pulse(key) else {
                    return;
                };
                self.discovery.publish_output_state(key, true).await;

                let engine = self.engine.clone();
                let discovery = self.discovery.clone();
                let hold = self.timing.tap_hold();
                tokio::spawn(async move {
                    time::sleep(hold).await;
                    if let Ok(true) = engine.finish_pulse(&token) {
                        discovery.publish_output_state(&token.zone, false).await;
                    }
                });
                info!("OUTPUT_TAP {key} -> PULSE {}ms", hold.as_millis());
            }
        }
    }

    async fn on_zone_select(&self, payload: &str) {
        if payload == ZONE_PLACEHOLDER {
            self.selection.clear_zone();
            self.discovery.bounce_zone().await;
            return;
        }
        if !self.registry.contains(payload) {
            warn!("SELECT zone ignored: unknown zone '{payload}'");
            return;
        }

        self.selection.pick_zone(payload);
        self.discovery.bounce_zone().await;
        info!("SELECT zone -> {payload} (bounced to placeholder)");
    }

    async fn on_class_select(&self, payload: &str) {
        if payload == CLASS_PLACEHOLDER {
            self.selection.clear_class();
            self.discovery.bounce_class().await;
            return;
        }
        let class: RoleClass = match payload.parse() {
            Ok(class) => class,
            Err(e) => {
                warn!("SELECT class ignored: {e}");
                return;
            }
        };

        match self.selection.pick_class(class) {
            Some((zone, class)) => match self.reconfig.apply(&zone, class).await {
                Ok(_) => info!("SELECT class -> {class} (applied to {zone})"),
                Err(e) => warn!("SELECT class -> {class} for {zone} failed: {e}"),
            },
            None => info!("SELECT class -> {class} (no zone selected; ignored)"),
        }
        self.discovery.bounce_class().await;
    }

    /// Samples a zone after a debounced edge and publishes it if it changed.
    pub async fn on_zone_event(&self, event: &ZoneEvent) {
        if self.engine.observer_kind(&event.zone) == Some(ObserverKind::Interrupt) {
            time::sleep(self.timing.edge_settle()).await;
        }

        match self.engine.refresh_input(&event.zone) {
            Ok(Some(reading)) if reading.changed => {
                if let Ok(zone) = self.registry.get(&event.zone) {
                    self.discovery.publish_state(&zone).await;
                }
                let label = if reading.open { "OPEN" } else { "CLOSED" };
                info!("SENSOR_CHANGE {} -> {label}", event.zone);
            }
            Ok(_) => {}
            Err(e) => warn!("read {} failed: {e}", event.zone),
        }
    }

    /// Raises the open-zones notice, or clears it when every input is closed.
    pub fn update_open_aggregate(&self) {
        let open = self.registry.snapshot_open_inputs();
        if open.is_empty() {
            self.faults.clear(keys::ZONES_OPEN);
            return;
        }

        let changed = self.registry.last_input_change();
        let name = changed
            .as_deref()
            .and_then(|key| self.registry.get(key).ok())
            .map(|zone| zone.name)
            .unwrap_or_else(|| "n/a".to_string());
        self.faults.raise(
            keys::ZONES_OPEN,
            format!("Doors/Windows open: {} ({name})", open.len()),
            Priority::LOW,
            Some(json!({ "open": open, "changed": changed })),
        );
    }

    pub async fn run_transport(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = stopped(&mut stop) => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_event(event).await;
        }
    }

    pub async fn run_zone_events(self: Arc<Self>, mut events: broadcast::Receiver<ZoneEvent>) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let received = tokio::select! {
                _ = stopped(&mut stop) => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => self.on_zone_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("zone event stream lagged by {n}, resyncing inputs");
                    for key in self.registry.keys() {
                        self.on_zone_event(&ZoneEvent {
                            zone: key,
                            edge: None,
                            timestamp_ms: epoch_millis(),
                        })
                        .await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Fixed-tick sweep over all observers plus the slower aggregate check.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.timing.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_aggregate: Option<Instant> = None;
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            self.engine.poll_tick(now.into_std());

            let due = last_aggregate
                .is_none_or(|last| now.duration_since(last) >= self.timing.aggregate_interval());
            if due {
                self.update_open_aggregate();
                last_aggregate = Some(now);
            }
        }
    }

    /// Stops the loops, publishes `offline`, gives it time to leave,
    /// disconnects and hands the pins back. A stalled transport cannot hold
    /// the pins.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        if time::timeout(SHUTDOWN_STEP_TIMEOUT, self.discovery.publish_availability(false))
            .await
            .is_err()
        {
            warn!("offline notice timed out");
        }
        time::sleep(OFFLINE_FLUSH_DELAY).await;
        if time::timeout(SHUTDOWN_STEP_TIMEOUT, self.outbox.disconnect())
            .await
            .is_err()
        {
            warn!("transport disconnect timed out");
        }

        self.engine.release();
        info!("bridge stopped");
    }
}

/// Resolves once the shutdown flag is set.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
