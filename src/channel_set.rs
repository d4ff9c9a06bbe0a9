//! The four light channels and the sequences built from them.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{random_level, Channel, ChannelName, LevelBounds};
use crate::lock;
use crate::pacing::Sleeper;
use crate::pwm::{PwmBackend, PWM_FREQUENCY_HZ};

const RANDOM_RAMP: Duration = Duration::from_millis(10);

const FLASH_RAMP: Duration = Duration::from_millis(500);
const FLASH_HOLD: Duration = Duration::from_secs(1);

const BLINK_RAMP_UP: Duration = Duration::from_secs(1);
const BLINK_HOLD: Duration = Duration::from_secs(1);
const BLINK_RAMP_DOWN: Duration = Duration::from_millis(500);

const DAWN_RED_HALF: Duration = Duration::from_secs(300);
const DAWN_RED_FULL: Duration = Duration::from_secs(300);
const DAWN_WHITE: Duration = Duration::from_secs(300);
const DAWN_BLUE: Duration = Duration::from_secs(60);
const DAWN_HOLD: Duration = Duration::from_secs(60);
const DAWN_FADE: Duration = Duration::from_millis(500);
const DAWN_REST: Duration = Duration::from_secs(180);
const DAWN_BLINKS: usize = 6;
const DAWN_TAIL_STEP: Duration = Duration::from_secs(1);

/// Lets the outputs settle before the GPIO subsystem is released.
const RELEASE_SETTLE: Duration = Duration::from_millis(20);

/// Physical board pin of each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPins {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

impl ChannelPins {
    pub fn pin(&self, name: ChannelName) -> u8 {
        match name {
            ChannelName::Red => self.red,
            ChannelName::Green => self.green,
            ChannelName::Blue => self.blue,
            ChannelName::White => self.white,
        }
    }
}

impl Default for ChannelPins {
    fn default() -> Self {
        Self {
            red: 40,
            green: 38,
            blue: 37,
            white: 36,
        }
    }
}

/// Snapshot of every channel level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Levels {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

/// Owns the four light channels for the lifetime of the process.
///
/// Hardware is taken in [`ChannelSet::acquire`] and given back exactly once by
/// [`ChannelSet::shutdown`], which also runs on drop.
pub struct ChannelSet {
    channels: [Channel; 4],
    backend: Mutex<Option<Box<dyn PwmBackend>>>,
    sleeper: Arc<dyn Sleeper>,
    released: AtomicBool,
}

impl ChannelSet {
    /// Configure one PWM output per channel, each starting at the minimum.
    pub fn acquire(
        mut backend: Box<dyn PwmBackend>,
        pins: ChannelPins,
        bounds: LevelBounds,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let channels = match Self::configure(backend.as_mut(), pins, bounds, &sleeper) {
            Ok(channels) => channels,
            Err(e) => {
                backend.cleanup();
                return Err(e);
            }
        };

        info!(
            "💡 Lights ready: red={} green={} blue={} white={} (levels {}..={})",
            pins.red,
            pins.green,
            pins.blue,
            pins.white,
            bounds.min(),
            bounds.max()
        );

        Ok(Self {
            channels,
            backend: Mutex::new(Some(backend)),
            sleeper,
            released: AtomicBool::new(false),
        })
    }

    fn configure(
        backend: &mut dyn PwmBackend,
        pins: ChannelPins,
        bounds: LevelBounds,
        sleeper: &Arc<dyn Sleeper>,
    ) -> Result<[Channel; 4]> {
        let mut make = |name: ChannelName| -> Result<Channel> {
            let pin = pins.pin(name);
            let mut output = backend
                .configure(pin, PWM_FREQUENCY_HZ)
                .with_context(|| format!("Failed to configure {} on board pin {}", name, pin))?;
            output
                .apply(bounds.min())
                .with_context(|| format!("Failed to start {} on board pin {}", name, pin))?;
            Ok(Channel::new(name, bounds, output, Arc::clone(sleeper)))
        };

        Ok([
            make(ChannelName::Red)?,
            make(ChannelName::Green)?,
            make(ChannelName::Blue)?,
            make(ChannelName::White)?,
        ])
    }

    pub fn channel(&self, name: ChannelName) -> &Channel {
        &self.channels[name.index()]
    }

    pub fn red(&self) -> &Channel {
        self.channel(ChannelName::Red)
    }

    pub fn green(&self) -> &Channel {
        self.channel(ChannelName::Green)
    }

    pub fn blue(&self) -> &Channel {
        self.channel(ChannelName::Blue)
    }

    pub fn white(&self) -> &Channel {
        self.channel(ChannelName::White)
    }

    /// Channels in their fixed order: red, green, blue, white.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn levels(&self) -> Levels {
        Levels {
            red: self.red().level(),
            green: self.green().level(),
            blue: self.blue().level(),
            white: self.white().level(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Ramp each channel in turn to a random level, almost instantly.
    pub fn randomize_all(&self) -> Result<()> {
        for channel in self.iter() {
            let target = random_level(channel.bounds())?;
            info!("{} {} to {}", channel.name(), channel.level(), target);
            channel.ramp_to(target, RANDOM_RAMP);
        }
        Ok(())
    }

    /// Flash each channel once so a person can check the wiring.
    pub fn startup_sequence(&self) {
        info!("Startup flash");
        for channel in self.iter() {
            let bounds = channel.bounds();
            channel.ramp_to(bounds.max(), FLASH_RAMP);
            self.pause(FLASH_HOLD);
            channel.ramp_to(bounds.min(), FLASH_RAMP);
            self.pause(FLASH_HOLD);
        }
    }

    /// Turn everything off, then blink the channels round-robin `count` times.
    pub fn blink_cycle(&self, count: usize) {
        for channel in self.iter() {
            channel.set_level(channel.bounds().min());
        }

        for round in 0..count {
            debug!("Blink round {}/{}", round + 1, count);
            for channel in self.iter() {
                let bounds = channel.bounds();
                channel.ramp_to(bounds.max(), BLINK_RAMP_UP);
                self.pause(BLINK_HOLD);
                channel.ramp_to(bounds.min(), BLINK_RAMP_DOWN);
            }
        }
    }

    /// The sunrise simulation. Blocks for a little over 22 minutes.
    pub fn dawn_sequence(&self) {
        info!("🌅 Dawn sequence starting");
        let (red, blue, white) = (self.red(), self.blue(), self.white());

        red.ramp_to(red.bounds().max() / 2, DAWN_RED_HALF);
        red.ramp_to(red.bounds().max(), DAWN_RED_FULL);
        white.ramp_to(white.bounds().max(), DAWN_WHITE);
        blue.ramp_to(blue.bounds().max(), DAWN_BLUE);
        self.pause(DAWN_HOLD);

        red.ramp_to(red.bounds().min(), DAWN_FADE);
        blue.ramp_to(blue.bounds().min(), DAWN_FADE);
        self.pause(DAWN_REST);

        self.blink_cycle(DAWN_BLINKS);

        // Slow fade-out tail
        for _ in 0..red.bounds().max() {
            for channel in self.iter() {
                channel.step_down();
            }
            self.pause(DAWN_TAIL_STEP);
        }
        info!("Dawn sequence finished");
    }

    /// Drive every channel to its minimum, stop the outputs and release the
    /// hardware. Only the first call does anything.
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Lights already released");
            return;
        }

        info!("Releasing lights");
        for channel in self.iter() {
            channel.release();
        }
        self.sleeper.sleep(RELEASE_SETTLE);

        if let Some(mut backend) = lock(&self.backend).take() {
            backend.cleanup();
        }
    }

    /// Sequence pauses are skipped once the lights are released.
    fn pause(&self, duration: Duration) {
        if !self.is_released() {
            self.sleeper.sleep(duration);
        }
    }
}

impl Drop for ChannelSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MAX_LEVEL;
    use crate::pacing::testing::RecordingSleeper;
    use crate::pacing::ThreadSleeper;
    use crate::pwm::MemoryBackend;
    use std::thread;
    use std::time::Instant;

    fn lights_with(sleeper: Arc<dyn Sleeper>) -> (ChannelSet, MemoryBackend) {
        let backend = MemoryBackend::new();
        let lights = ChannelSet::acquire(
            Box::new(backend.clone()),
            ChannelPins::default(),
            LevelBounds::default(),
            sleeper,
        )
        .unwrap();
        (lights, backend)
    }

    fn all_off() -> Levels {
        Levels {
            red: 0,
            green: 0,
            blue: 0,
            white: 0,
        }
    }

    #[test]
    fn test_acquire_configures_pins_in_order() {
        let (lights, recorder) = lights_with(Arc::new(RecordingSleeper::new()));
        assert_eq!(recorder.configured_pins(), vec![40, 38, 37, 36]);
        for pin in [40, 38, 37, 36] {
            assert_eq!(recorder.duty(pin), Some(0));
        }
        assert_eq!(lights.levels(), all_off());

        let names: Vec<ChannelName> = lights.iter().map(|c| c.name()).collect();
        assert_eq!(names, ChannelName::ALL.to_vec());
    }

    #[test]
    fn test_acquire_failure_cleans_up() {
        let recorder = MemoryBackend::new();
        let pins = ChannelPins {
            red: 40,
            green: 40,
            blue: 37,
            white: 36,
        };
        let result = ChannelSet::acquire(
            Box::new(recorder.clone()),
            pins,
            LevelBounds::default(),
            Arc::new(RecordingSleeper::new()),
        );

        let err = result.err().unwrap();
        assert!(err.to_string().contains("green"));
        assert_eq!(recorder.cleanup_count(), 1);
        assert!(recorder.is_released(40));
    }

    #[test]
    fn test_levels_snapshot() {
        let (lights, _recorder) = lights_with(Arc::new(RecordingSleeper::new()));
        lights.red().set_level(80);
        lights.blue().set_level(12);
        assert_eq!(
            lights.levels(),
            Levels {
                red: 80,
                green: 0,
                blue: 12,
                white: 0,
            }
        );
    }

    #[test]
    fn test_randomize_all_stays_in_bounds() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, _recorder) = lights_with(sleeper.clone());

        lights.randomize_all().unwrap();
        assert!(lights.iter().all(|c| c.level() <= MAX_LEVEL));
        // Four ramps of at most 10ms each
        assert!(sleeper.total() <= Duration::from_millis(40));
        assert!(sleeper.total() > Duration::from_millis(39));
    }

    #[test]
    fn test_startup_sequence_flashes_each_channel() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, recorder) = lights_with(sleeper.clone());

        lights.startup_sequence();
        assert_eq!(lights.levels(), all_off());
        assert_eq!(sleeper.total(), Duration::from_secs(12));
        for pin in [40, 38, 37, 36] {
            assert_eq!(recorder.history(pin).iter().max(), Some(&MAX_LEVEL));
        }
    }

    #[test]
    fn test_blink_cycle_zero_only_resets() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, _recorder) = lights_with(sleeper.clone());
        lights.red().set_level(50);
        lights.white().set_level(3);

        lights.blink_cycle(0);
        assert_eq!(lights.levels(), all_off());
        assert!(sleeper.pauses().is_empty());
    }

    #[test]
    fn test_blink_cycle_round_robin() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, recorder) = lights_with(sleeper.clone());

        lights.blink_cycle(2);
        assert_eq!(lights.levels(), all_off());
        assert_eq!(sleeper.total(), Duration::from_secs(20));
        for pin in [40, 38, 37, 36] {
            let peaks = recorder.history(pin).iter().filter(|d| **d == MAX_LEVEL).count();
            assert_eq!(peaks, 2);
        }
    }

    #[test]
    fn test_dawn_sequence() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, recorder) = lights_with(sleeper.clone());

        lights.dawn_sequence();
        assert_eq!(lights.levels(), all_off());
        assert_eq!(sleeper.total(), Duration::from_secs(1341));

        // Red passes through half brightness on its way up
        let red = recorder.history(40);
        assert!(red.contains(&(MAX_LEVEL / 2)));
        assert!(red.contains(&MAX_LEVEL));
        // Green only takes part in the blink cycle
        let green_peaks = recorder.history(38).iter().filter(|d| **d == MAX_LEVEL).count();
        assert_eq!(green_peaks, DAWN_BLINKS);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let (lights, recorder) = lights_with(sleeper);
        lights.red().set_level(70);

        lights.shutdown();
        lights.shutdown();
        assert!(lights.is_released());
        assert_eq!(recorder.cleanup_count(), 1);
        assert_eq!(recorder.duty(40), Some(0));
        for pin in [40, 38, 37, 36] {
            assert!(recorder.is_released(pin));
        }

        drop(lights);
        assert_eq!(recorder.cleanup_count(), 1);
    }

    #[test]
    fn test_drop_releases_hardware() {
        let (lights, recorder) = lights_with(Arc::new(RecordingSleeper::new()));
        drop(lights);
        assert_eq!(recorder.cleanup_count(), 1);
    }

    #[test]
    fn test_concurrent_ramps_on_different_channels() {
        let (lights, _recorder) = lights_with(Arc::new(ThreadSleeper));
        let lights = Arc::new(lights);

        let start = Instant::now();
        let red = {
            let lights = Arc::clone(&lights);
            thread::spawn(move || lights.red().ramp_to(80, Duration::from_millis(300)))
        };
        let green = {
            let lights = Arc::clone(&lights);
            thread::spawn(move || lights.green().ramp_to(30, Duration::from_millis(300)))
        };

        assert_eq!(red.join().unwrap(), 80);
        assert_eq!(green.join().unwrap(), 30);
        assert!(start.elapsed() < Duration::from_millis(550));
        assert_eq!(lights.levels().red, 80);
        assert_eq!(lights.levels().green, 30);
    }

    #[test]
    fn test_shutdown_interrupts_running_ramp() {
        let (lights, recorder) = lights_with(Arc::new(ThreadSleeper));
        let lights = Arc::new(lights);

        let ramping = Arc::clone(&lights);
        let ramp = thread::spawn(move || ramping.white().ramp_to(80, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        lights.shutdown();
        assert!(start.elapsed() < Duration::from_millis(500));

        assert_eq!(ramp.join().unwrap(), 0);
        assert_eq!(recorder.duty(36), Some(0));
        assert_eq!(recorder.cleanup_count(), 1);
    }
}
