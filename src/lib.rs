//! Dawn simulator lamp for a Raspberry Pi.
//!
//! Four PWM-driven channels (red, green, blue, white) controlled over HTTP,
//! plus a daily alarm that slowly brightens them into a sunrise.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod alarm;
pub mod api;
pub mod channel;
pub mod channel_set;
pub mod config;
pub mod daemon;
pub mod pacing;
pub mod pwm;

pub use channel::{Channel, ChannelName, LevelBounds};
pub use channel_set::{ChannelPins, ChannelSet, Levels};
pub use config::Config;

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
