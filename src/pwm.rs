//! PWM output drivers.
//!
//! The light engine only ever talks to [`PwmBackend`] and [`PwmOutput`]. On a
//! Raspberry Pi the [`RppalBackend`] drives software PWM on the GPIO header;
//! everywhere else the [`MemoryBackend`] keeps the duty cycles in memory.

use anyhow::{anyhow, Context, Result};
use embedded_hal::pwm::{ErrorType, SetDutyCycle};
use log::{debug, info};
use rppal::gpio::{Gpio, OutputPin};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::lock;

include!(concat!(env!("OUT_DIR"), "/board_pins.rs"));

/// The one PWM frequency every light channel runs at.
pub const PWM_FREQUENCY_HZ: f64 = 60.0;

/// A single configured PWM pin.
pub trait PwmOutput: Send {
    /// Apply a duty cycle in percent (0-100).
    fn apply(&mut self, duty_percent: u8) -> Result<()>;

    /// Stop driving the pin.
    fn stop(&mut self) -> Result<()>;
}

/// Hands out configured PWM pins and releases the GPIO subsystem at exit.
pub trait PwmBackend: Send {
    /// Configure `pin` (physical board numbering) as a PWM output.
    fn configure(&mut self, pin: u8, frequency_hz: f64) -> Result<Box<dyn PwmOutput>>;

    /// Release everything the backend holds. Called once at process end.
    fn cleanup(&mut self);
}

/// Software PWM on the Raspberry Pi GPIO header.
pub struct RppalBackend {
    gpio: Gpio,
}

impl RppalBackend {
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new().context("Failed to open the GPIO peripheral")?;
        info!("GPIO opened");
        Ok(Self { gpio })
    }
}

impl PwmBackend for RppalBackend {
    fn configure(&mut self, pin: u8, frequency_hz: f64) -> Result<Box<dyn PwmOutput>> {
        let bcm = board_to_bcm(pin)
            .ok_or_else(|| anyhow!("Board pin {} is not a GPIO pin", pin))?;

        let mut output = self
            .gpio
            .get(bcm)
            .with_context(|| format!("GPIO {} (board pin {}) is unavailable", bcm, pin))?
            .into_output_low();
        output
            .set_pwm_frequency(frequency_hz, 0.0)
            .with_context(|| format!("Failed to start PWM on board pin {}", pin))?;

        info!(
            "Board pin {} (GPIO {}) configured for {} Hz PWM",
            pin, bcm, frequency_hz
        );
        Ok(Box::new(SoftPwmOutput {
            board_pin: pin,
            frequency_hz,
            output,
        }))
    }

    fn cleanup(&mut self) {
        // Pins reset themselves when their OutputPin is dropped.
        info!("GPIO cleanup complete");
    }
}

struct SoftPwmOutput {
    board_pin: u8,
    frequency_hz: f64,
    output: OutputPin,
}

impl PwmOutput for SoftPwmOutput {
    fn apply(&mut self, duty_percent: u8) -> Result<()> {
        let duty = f64::from(duty_percent.min(100)) / 100.0;
        self.output
            .set_pwm_frequency(self.frequency_hz, duty)
            .with_context(|| format!("Failed to set duty cycle on board pin {}", self.board_pin))
    }

    fn stop(&mut self) -> Result<()> {
        self.output
            .clear_pwm()
            .with_context(|| format!("Failed to stop PWM on board pin {}", self.board_pin))?;
        self.output.set_low();
        Ok(())
    }
}

/// Wraps any `embedded-hal` PWM channel as a [`PwmOutput`].
pub struct DutyCycleOutput<P> {
    pin: P,
}

impl<P: SetDutyCycle> DutyCycleOutput<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P> PwmOutput for DutyCycleOutput<P>
where
    P: SetDutyCycle + Send,
    P::Error: Debug,
{
    fn apply(&mut self, duty_percent: u8) -> Result<()> {
        self.pin
            .set_duty_cycle_percent(duty_percent.min(100))
            .map_err(|e| anyhow!("Failed to set duty cycle: {:?}", e))
    }

    fn stop(&mut self) -> Result<()> {
        self.pin
            .set_duty_cycle_fully_off()
            .map_err(|e| anyhow!("Failed to stop PWM: {:?}", e))
    }
}

/// Resolution of a [`MemoryPin`]: 0.01 % per count.
const MEMORY_MAX_DUTY: u16 = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    configured: Vec<u8>,
    history: HashMap<u8, Vec<u8>>,
    released: HashSet<u8>,
    cleanups: usize,
}

/// In-memory PWM backend used by `--simulate` and by the tests.
///
/// Clones share the same state, so a clone kept by the caller can inspect
/// what the light engine wrote after the backend itself has been handed over.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last duty cycle written to `pin`, in percent.
    pub fn duty(&self, pin: u8) -> Option<u8> {
        let state = lock(&self.state);
        state.history.get(&pin).and_then(|h| h.last().copied())
    }

    /// Every duty cycle written to `pin`, oldest first.
    pub fn history(&self, pin: u8) -> Vec<u8> {
        let state = lock(&self.state);
        state.history.get(&pin).cloned().unwrap_or_default()
    }

    /// Pins configured so far, in configuration order.
    pub fn configured_pins(&self) -> Vec<u8> {
        lock(&self.state).configured.clone()
    }

    /// Whether the output for `pin` has been dropped.
    pub fn is_released(&self, pin: u8) -> bool {
        lock(&self.state).released.contains(&pin)
    }

    pub fn cleanup_count(&self) -> usize {
        lock(&self.state).cleanups
    }
}

impl PwmBackend for MemoryBackend {
    fn configure(&mut self, pin: u8, frequency_hz: f64) -> Result<Box<dyn PwmOutput>> {
        {
            let mut state = lock(&self.state);
            if state.configured.contains(&pin) {
                return Err(anyhow!("Board pin {} is already configured", pin));
            }
            state.configured.push(pin);
        }
        debug!("Simulated pin {} configured for {} Hz PWM", pin, frequency_hz);

        Ok(Box::new(DutyCycleOutput::new(MemoryPin {
            pin,
            state: Arc::clone(&self.state),
        })))
    }

    fn cleanup(&mut self) {
        lock(&self.state).cleanups += 1;
        info!("Simulated GPIO cleanup complete");
    }
}

/// A simulated PWM channel that records its duty cycle history.
pub struct MemoryPin {
    pin: u8,
    state: Arc<Mutex<MemoryState>>,
}

impl ErrorType for MemoryPin {
    type Error = Infallible;
}

impl SetDutyCycle for MemoryPin {
    fn max_duty_cycle(&self) -> u16 {
        MEMORY_MAX_DUTY
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        let percent = (u32::from(duty) * 100 / u32::from(MEMORY_MAX_DUTY)) as u8;
        debug!("Simulated pin {} duty {}%", self.pin, percent);
        let mut state = lock(&self.state);
        state.history.entry(self.pin).or_default().push(percent);
        Ok(())
    }
}

impl Drop for MemoryPin {
    fn drop(&mut self) {
        lock(&self.state).released.insert(self.pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_pin_mapping() {
        assert_eq!(board_to_bcm(40), Some(21));
        assert_eq!(board_to_bcm(38), Some(20));
        assert_eq!(board_to_bcm(37), Some(26));
        assert_eq!(board_to_bcm(36), Some(16));
        // Power and ground pins carry no GPIO
        assert_eq!(board_to_bcm(1), None);
        assert_eq!(board_to_bcm(39), None);
    }

    #[test]
    fn test_memory_backend_records_duty() {
        let mut backend = MemoryBackend::new();
        let recorder = backend.clone();

        let mut output = backend.configure(40, PWM_FREQUENCY_HZ).unwrap();
        output.apply(0).unwrap();
        output.apply(42).unwrap();
        output.apply(80).unwrap();

        assert_eq!(recorder.duty(40), Some(80));
        assert_eq!(recorder.history(40), vec![0, 42, 80]);
        assert_eq!(recorder.configured_pins(), vec![40]);
    }

    #[test]
    fn test_memory_backend_stop_and_release() {
        let mut backend = MemoryBackend::new();
        let recorder = backend.clone();

        let mut output = backend.configure(38, PWM_FREQUENCY_HZ).unwrap();
        output.apply(50).unwrap();
        output.stop().unwrap();
        assert_eq!(recorder.duty(38), Some(0));
        assert!(!recorder.is_released(38));

        drop(output);
        assert!(recorder.is_released(38));

        backend.cleanup();
        assert_eq!(recorder.cleanup_count(), 1);
    }

    #[test]
    fn test_memory_backend_rejects_duplicate_pin() {
        let mut backend = MemoryBackend::new();
        let _first = backend.configure(37, PWM_FREQUENCY_HZ).unwrap();
        assert!(backend.configure(37, PWM_FREQUENCY_HZ).is_err());
    }

    #[test]
    fn test_memory_backend_survives_poisoned_state() {
        let mut backend = MemoryBackend::new();
        let recorder = backend.clone();
        let mut output = backend.configure(40, PWM_FREQUENCY_HZ).unwrap();

        let state = Arc::clone(&recorder.state);
        let _ = std::thread::spawn(move || {
            let _held = state.lock().unwrap();
            panic!("writer died holding the state");
        })
        .join();
        assert!(recorder.state.is_poisoned());

        output.apply(33).unwrap();
        assert_eq!(recorder.duty(40), Some(33));
        drop(output);
        assert!(recorder.is_released(40));
        backend.cleanup();
        assert_eq!(recorder.cleanup_count(), 1);
    }

    #[test]
    fn test_duty_cycle_output_clamps_percent() {
        let mut backend = MemoryBackend::new();
        let recorder = backend.clone();

        let mut output = backend.configure(36, PWM_FREQUENCY_HZ).unwrap();
        output.apply(250).unwrap();
        assert_eq!(recorder.duty(36), Some(100));
    }
}
