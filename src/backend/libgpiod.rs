use log::warn;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock as PLRwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::PinConfig;
use crate::error::AppError;
use crate::gpio::{Edge, EdgeEvent, EventHandler, GpioBackend, PinMode};
use crate::zone::Level;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Character-device backend. Each zone pin owns its own line request.
pub struct LibgpiodBackend {
    pins: PLRwLock<FxHashMap<PinConfig, RwLock<PinHandle>>>,
    hw_debounce: Duration,
}

struct PinHandle {
    mode: PinMode,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin: PinConfig,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: EventHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error on line {}: {e}", pin.line);
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        warn!("read edge events error on line {}: {e}", pin.line);
                        yield_now();
                        continue;
                    }
                };
                for evt in events {
                    let Ok(evt) = evt else {
                        continue;
                    };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => Edge::Rising,
                        Ok(line::EdgeKind::Falling) => Edge::Falling,
                        Err(_) => continue,
                    };

                    handler.dispatch(EdgeEvent {
                        pin: pin.clone(),
                        edge: Some(edge),
                        timestamp_ms: evt.timestamp().as_millis() as u64,
                    });
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Gpio(format!("lock poisoned: {e}"))
}

impl LibgpiodBackend {
    /// `hw_debounce` is handed to the kernel for edge-watched inputs.
    pub fn new(hw_debounce: Duration) -> Result<Self, AppError> {
        Ok(Self {
            pins: PLRwLock::new(FxHashMap::default()),
            hw_debounce,
        })
    }

    fn make_line_settings(
        mode: PinMode,
        edges: Option<Duration>,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match mode {
            PinMode::InputPullUp => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_bias(Some(line::Bias::PullUp))
                    .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;
            }
            PinMode::Output { initial } => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
                ls.set_output_value(to_value(initial))
                    .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
            }
        }

        if let Some(debounce) = edges {
            ls.set_edge_detection(Some(line::Edge::Both))
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
            ls.set_debounce_period(debounce);
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn reconfigure(
        handle: &PinHandle,
        pin: &PinConfig,
        mode: PinMode,
        edges: Option<Duration>,
    ) -> Result<(), AppError> {
        let line_settings = Self::make_line_settings(mode, edges)?;
        let line_cfg = Self::make_line_config(pin.line, line_settings)?;
        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))?;
        Ok(())
    }
}

fn to_value(level: Level) -> line::Value {
    match level {
        Level::High => line::Value::Active,
        Level::Low => line::Value::InActive,
    }
}

impl GpioBackend for LibgpiodBackend {
    fn configure(&self, pin: &PinConfig, mode: PinMode) -> Result<(), AppError> {
        let pins = self.pins.upgradable_read();

        match pins.get(pin) {
            Some(handle) => {
                let mut handle = handle.write().map_err(poisoned)?;
                // the listener holds the request lock between waits
                handle.listener.take();
                Self::reconfigure(&handle, pin, mode, None)?;
                handle.mode = mode;
            }
            None => {
                let line_settings = Self::make_line_settings(mode, None)?;
                let line_cfg = Self::make_line_config(pin.line, line_settings)?;
                let gpiod_handle =
                    Arc::new(FairMutex::new(GpiodHandle::new(&pin.chip, &line_cfg)?));

                let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                pins.insert(
                    pin.clone(),
                    RwLock::new(PinHandle {
                        mode,
                        gpiod_handle,
                        listener: None,
                    }),
                );
            }
        }
        Ok(())
    }

    fn watch_edges(&self, pin: &PinConfig, handler: EventHandler) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let mut handle = handle_lock.write().map_err(poisoned)?;

        if handle.mode != PinMode::InputPullUp {
            return Err(AppError::InvalidState(
                "edge detection requires an input pin".into(),
            ));
        }

        handle.listener.take();
        Self::reconfigure(&handle, pin, handle.mode, Some(self.hw_debounce))?;
        handle.listener = Some(EdgeListener::new(
            pin.clone(),
            handle.gpiod_handle.clone(),
            handler,
        )?);
        Ok(())
    }

    fn unwatch_edges(&self, pin: &PinConfig) {
        let pins = self.pins.read();
        let Some(handle_lock) = pins.get(pin) else {
            return;
        };
        let Ok(mut handle) = handle_lock.write() else {
            return;
        };
        if handle.listener.take().is_none() {
            return;
        }
        if let Err(e) = Self::reconfigure(&handle, pin, handle.mode, None) {
            warn!("disable edge detection on line {}: {e}", pin.line);
        }
    }

    fn read_level(&self, pin: &PinConfig) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let handle = handle_lock.read().map_err(poisoned)?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(pin.line)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn write_level(&self, pin: &PinConfig, level: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(pin)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set mode first".into()))?;
        let handle = handle_lock.read().map_err(poisoned)?;

        if !matches!(handle.mode, PinMode::Output { .. }) {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(pin.line, to_value(level))
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn release_all(&self) {
        // dropping a request hands its lines back to the kernel
        self.pins.write().clear();
    }
}
