//! A single PWM light channel: its level, its bounds and its ramps.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock;
use crate::pacing::Sleeper;
use crate::pwm::PwmOutput;

/// Lowest level any channel can be driven to.
pub const MIN_LEVEL: u8 = 0;

/// Default highest level. Doubles as the duty cycle percentage.
pub const MAX_LEVEL: u8 = 80;

/// Pause taken by a ramp that has nowhere to go.
pub const MIN_STEP_INTERVAL: Duration = Duration::from_millis(10);

/// The four light channels, in their fixed iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelName {
    Red,
    Green,
    Blue,
    White,
}

impl ChannelName {
    pub const ALL: [ChannelName; 4] = [
        ChannelName::Red,
        ChannelName::Green,
        ChannelName::Blue,
        ChannelName::White,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelName::Red => "red",
            ChannelName::Green => "green",
            ChannelName::Blue => "blue",
            ChannelName::White => "white",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive level range of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelBounds {
    min: u8,
    max: u8,
}

impl LevelBounds {
    pub fn new(min: u8, max: u8) -> Result<Self> {
        if min > max {
            return Err(anyhow!("Minimum level {} is above maximum level {}", min, max));
        }
        if max > 100 {
            return Err(anyhow!("Maximum level {} is not a valid duty cycle", max));
        }
        Ok(Self { min, max })
    }

    pub const fn min(self) -> u8 {
        self.min
    }

    pub const fn max(self) -> u8 {
        self.max
    }

    pub const fn contains(self, level: u8) -> bool {
        self.min <= level && level <= self.max
    }

    /// Clamp an arbitrary integer into the range.
    pub fn clamp(self, level: i64) -> u8 {
        level.clamp(i64::from(self.min), i64::from(self.max)) as u8
    }
}

impl Default for LevelBounds {
    fn default() -> Self {
        Self {
            min: MIN_LEVEL,
            max: MAX_LEVEL,
        }
    }
}

/// Uniformly random level within `bounds`.
pub fn random_level(bounds: LevelBounds) -> Result<u8> {
    let span = u32::from(bounds.max - bounds.min) + 1;
    // Reject the tail that would bias the modulo
    let limit = (u32::MAX / span) * span;
    loop {
        let value =
            getrandom::u32().map_err(|e| anyhow!("Failed to read system randomness: {}", e))?;
        if value < limit {
            return Ok(bounds.min + (value % span) as u8);
        }
    }
}

struct ChannelState {
    level: u8,
    /// `None` once the channel has been released.
    output: Option<Box<dyn PwmOutput>>,
}

/// One light channel bound to a PWM output.
///
/// Two locks guard a channel. `ramp_lock` is held for the whole of any level
/// changing call, so nothing can cut into a running ramp on the same channel.
/// `state` is held only while a single step is applied, which keeps readers
/// responsive during long ramps.
pub struct Channel {
    name: ChannelName,
    bounds: LevelBounds,
    sleeper: Arc<dyn Sleeper>,
    ramp_lock: Mutex<()>,
    state: Mutex<ChannelState>,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Up,
    Down,
}

impl Channel {
    /// Create a channel sitting at its minimum level.
    ///
    /// The output is expected to already be at that level.
    pub fn new(
        name: ChannelName,
        bounds: LevelBounds,
        output: Box<dyn PwmOutput>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            name,
            bounds,
            sleeper,
            ramp_lock: Mutex::new(()),
            state: Mutex::new(ChannelState {
                level: bounds.min(),
                output: Some(output),
            }),
        }
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn bounds(&self) -> LevelBounds {
        self.bounds
    }

    pub fn level(&self) -> u8 {
        lock(&self.state).level
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).output.is_none()
    }

    /// Set the level immediately.
    ///
    /// Levels outside the bounds are ignored. Returns whether the level was
    /// applied.
    pub fn set_level(&self, target: u8) -> bool {
        let _ramp = lock(&self.ramp_lock);
        self.write_level(target)
    }

    /// Raise the level by one unless already at the maximum.
    pub fn step_up(&self) -> bool {
        let _ramp = lock(&self.ramp_lock);
        self.step(Step::Up)
    }

    /// Lower the level by one unless already at the minimum.
    pub fn step_down(&self) -> bool {
        let _ramp = lock(&self.ramp_lock);
        self.step(Step::Down)
    }

    /// Move to a uniformly random level. Returns the new level.
    pub fn randomize(&self) -> Result<u8> {
        let _ramp = lock(&self.ramp_lock);
        let level = random_level(self.bounds)?;
        self.write_level(level);
        Ok(self.level())
    }

    /// Walk the level one unit at a time to `target_level` over `total`.
    ///
    /// Blocks for the whole ramp. The target is clamped into bounds first.
    /// When there is nothing to do the call still pauses for
    /// [`MIN_STEP_INTERVAL`]. Returns the level the ramp ended on.
    pub fn ramp_to(&self, target_level: u8, total: Duration) -> u8 {
        let _ramp = lock(&self.ramp_lock);

        let target = self.bounds.clamp(i64::from(target_level));
        let current = self.level();
        let distance = current.abs_diff(target);
        if distance == 0 {
            self.sleeper.sleep(MIN_STEP_INTERVAL);
            return current;
        }

        let interval = total / u32::from(distance);
        let direction = if target > current { Step::Up } else { Step::Down };
        debug!(
            "{} ramp {} -> {} over {:?} ({:?} per step)",
            self.name, current, target, total, interval
        );

        for _ in 0..distance {
            if !self.step(direction) {
                break;
            }
            self.sleeper.sleep(interval);
        }

        self.level()
    }

    /// Drive the output to the minimum, stop it and drop it.
    ///
    /// Only takes the state lock, so it never waits for a running ramp; the
    /// ramp notices the release on its next step. Returns `false` if the
    /// channel was already released.
    pub(crate) fn release(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(mut output) = state.output.take() else {
            return false;
        };

        state.level = self.bounds.min();
        if let Err(e) = output.apply(self.bounds.min()) {
            warn!("{}: {:?}", self.name, e);
        }
        if let Err(e) = output.stop() {
            warn!("{}: {:?}", self.name, e);
        }
        debug!("{} released", self.name);
        true
    }

    fn step(&self, step: Step) -> bool {
        let mut state = lock(&self.state);
        let next = match step {
            Step::Up if state.level < self.bounds.max() => state.level + 1,
            Step::Down if state.level > self.bounds.min() => state.level - 1,
            _ => return false,
        };
        self.apply_locked(&mut state, next)
    }

    fn write_level(&self, target: u8) -> bool {
        let mut state = lock(&self.state);
        if !self.bounds.contains(target) {
            debug!(
                "{}: ignoring level {} outside {}..={}",
                self.name,
                target,
                self.bounds.min(),
                self.bounds.max()
            );
            return false;
        }
        self.apply_locked(&mut state, target)
    }

    fn apply_locked(&self, state: &mut ChannelState, level: u8) -> bool {
        let Some(output) = state.output.as_mut() else {
            return false;
        };
        state.level = level;
        if let Err(e) = output.apply(level) {
            warn!("{}: {:?}", self.name, e);
        }
        true
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("bounds", &self.bounds)
            .field("level", &self.level())
            .finish()
    }
}
