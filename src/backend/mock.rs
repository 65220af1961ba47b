use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::config::PinConfig;
use crate::error::AppError;
use crate::gpio::{Edge, EdgeEvent, EventHandler, GpioBackend, PinMode, epoch_millis};
use crate::zone::Level;

/// In-memory pins. Contacts start closed (low); tests move them with
/// [`MockGpioBackend::set_input`]. Reads return the contact level in input
/// mode and the driven level in output mode.
#[derive(Default)]
pub struct MockGpioBackend {
    pins: RwLock<HashMap<PinConfig, Mutex<MockPinState>>>, // keyed by chip and line
    no_edge_lines: RwLock<HashSet<u32>>,
    faulty_lines: RwLock<HashSet<u32>>,
}

struct MockPinState {
    mode: PinMode,
    contact: Level,
    driven: Level,
    handler: Option<EventHandler>,
}

impl MockPinState {
    fn level(&self) -> Level {
        match self.mode {
            PinMode::InputPullUp => self.contact,
            PinMode::Output { .. } => self.driven,
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Gpio(format!("lock poisoned: {e}"))
}

impl MockGpioBackend {
    /// Makes `watch_edges` fail for `line`, forcing the poll fallback.
    pub fn disable_edges(&self, line: u32) {
        if let Ok(mut lines) = self.no_edge_lines.write() {
            lines.insert(line);
        }
    }

    /// Makes every operation on `line` fail while `faulty` is set.
    pub fn set_faulty(&self, line: u32, faulty: bool) {
        if let Ok(mut lines) = self.faulty_lines.write() {
            if faulty {
                lines.insert(line);
            } else {
                lines.remove(&line);
            }
        }
    }

    /// Simulates an electrical change on an input and fires its edge handler.
    pub fn set_input(&self, pin: &PinConfig, level: Level) -> Result<(), AppError> {
        let handler = {
            let pins = self.pins.read().map_err(poisoned)?;
            let entry = pins
                .get(pin)
                .ok_or_else(|| AppError::InvalidState("pin not configured".into()))?;
            let mut state = entry.lock().map_err(poisoned)?;
            if state.contact == level {
                return Ok(());
            }
            state.contact = level;
            state.handler.clone()
        };

        if let Some(handler) = handler {
            handler.dispatch(EdgeEvent {
                pin: pin.clone(),
                edge: Some(match level {
                    Level::High => Edge::Rising,
                    Level::Low => Edge::Falling,
                }),
                timestamp_ms: epoch_millis(),
            });
        }
        Ok(())
    }

    pub fn level(&self, pin: &PinConfig) -> Option<Level> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(pin)?.lock().ok()?;
        Some(state.level())
    }

    pub fn mode(&self, pin: &PinConfig) -> Option<PinMode> {
        let pins = self.pins.read().ok()?;
        let state = pins.get(pin)?.lock().ok()?;
        Some(state.mode)
    }

    pub fn is_watched(&self, pin: &PinConfig) -> bool {
        let Ok(pins) = self.pins.read() else {
            return false;
        };
        pins.get(pin)
            .and_then(|entry| entry.lock().ok().map(|s| s.handler.is_some()))
            .unwrap_or(false)
    }

    fn check_healthy(&self, pin: &PinConfig) -> Result<(), AppError> {
        let faulty = self.faulty_lines.read().map_err(poisoned)?;
        if faulty.contains(&pin.line) {
            return Err(AppError::Gpio(format!("line {} not responding", pin.line)));
        }
        Ok(())
    }
}

impl GpioBackend for MockGpioBackend {
    fn configure(&self, pin: &PinConfig, mode: PinMode) -> Result<(), AppError> {
        self.check_healthy(pin)?;
        let mut pins = self.pins.write().map_err(poisoned)?;

        let entry = pins.entry(pin.clone()).or_insert_with(|| {
            Mutex::new(MockPinState {
                mode,
                contact: Level::Low,
                driven: Level::Low,
                handler: None,
            })
        });

        let mut state = entry.lock().map_err(poisoned)?;
        state.mode = mode;
        state.handler = None;
        if let PinMode::Output { initial } = mode {
            state.driven = initial;
        }
        Ok(())
    }

    fn watch_edges(&self, pin: &PinConfig, handler: EventHandler) -> Result<(), AppError> {
        self.check_healthy(pin)?;
        if self.no_edge_lines.read().map_err(poisoned)?.contains(&pin.line) {
            return Err(AppError::Gpio(format!(
                "edge detection unsupported on line {}",
                pin.line
            )));
        }

        let pins = self.pins.read().map_err(poisoned)?;
        let entry = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let mut state = entry.lock().map_err(poisoned)?;
        if state.mode != PinMode::InputPullUp {
            return Err(AppError::InvalidState(
                "edge detection requires an input pin".into(),
            ));
        }
        state.handler = Some(handler);
        Ok(())
    }

    fn unwatch_edges(&self, pin: &PinConfig) {
        let Ok(pins) = self.pins.read() else {
            return;
        };
        if let Some(entry) = pins.get(pin)
            && let Ok(mut state) = entry.lock()
        {
            state.handler = None;
        }
    }

    fn read_level(&self, pin: &PinConfig) -> Result<Level, AppError> {
        self.check_healthy(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let entry = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let state = entry.lock().map_err(poisoned)?;
        Ok(state.level())
    }

    fn write_level(&self, pin: &PinConfig, level: Level) -> Result<(), AppError> {
        self.check_healthy(pin)?;
        let pins = self.pins.read().map_err(poisoned)?;
        let entry = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let mut state = entry.lock().map_err(poisoned)?;

        if !matches!(state.mode, PinMode::Output { .. }) {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }
        state.driven = level;
        Ok(())
    }

    fn release_all(&self) {
        if let Ok(mut pins) = self.pins.write() {
            pins.clear();
        }
    }
}
