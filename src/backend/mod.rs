//! Pin drivers behind [`crate::gpio::GpioBackend`].

#[cfg(feature = "hardware-gpio")]
mod libgpiod;
mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
