//! Daily wake-up alarm that starts the dawn sequence.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use log::{debug, info};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::channel_set::ChannelSet;
use crate::pacing::Sleeper;

/// How often the alarm looks at the clock.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hour and minute of the day the alarm goes off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTime {
    hour: u32,
    minute: u32,
}

impl AlarmTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 {
            return Err(anyhow!("Alarm hour {} is out of range", hour));
        }
        if minute > 59 {
            return Err(anyhow!("Alarm minute {} is out of range", minute));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// True for every second of the trigger minute.
    pub fn matches(&self, now: &NaiveDateTime) -> bool {
        now.hour() == self.hour && now.minute() == self.minute
    }
}

impl Default for AlarmTime {
    fn default() -> Self {
        Self {
            hour: 4,
            minute: 45,
        }
    }
}

impl FromStr for AlarmTime {
    type Err = anyhow::Error;

    /// Parse `HH:MM`.
    fn from_str(s: &str) -> Result<Self> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("Alarm time '{}' is not HH:MM", s))?;
        let hour = hour
            .parse()
            .with_context(|| format!("Alarm time '{}' has an invalid hour", s))?;
        let minute = minute
            .parse()
            .with_context(|| format!("Alarm time '{}' has an invalid minute", s))?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Source of local wall-clock time.
pub trait WallClock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl WallClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Fires the dawn sequence at most once per calendar day.
#[derive(Debug, Clone)]
pub struct Alarm {
    trigger: AlarmTime,
    last_fired: Option<NaiveDate>,
}

impl Alarm {
    pub fn new(trigger: AlarmTime) -> Self {
        Self {
            trigger,
            last_fired: None,
        }
    }

    pub fn trigger(&self) -> AlarmTime {
        self.trigger
    }

    pub fn last_fired(&self) -> Option<NaiveDate> {
        self.last_fired
    }

    /// Decide whether the alarm goes off at `now`, and remember it if so.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        if !self.trigger.matches(&now) {
            return false;
        }
        let today = now.date();
        if self.last_fired == Some(today) {
            return false;
        }
        self.last_fired = Some(today);
        true
    }

    /// One pass of the alarm loop. Runs the whole dawn sequence when the
    /// alarm goes off, so this can block for a long time.
    pub fn tick(&mut self, lights: &ChannelSet, now: NaiveDateTime) -> bool {
        debug!("{}", now.format("%H:%M:%S"));
        if !self.poll(now) {
            return false;
        }
        info!("⏰ Wake up!");
        lights.dawn_sequence();
        true
    }

    /// Poll the clock once per `POLL_INTERVAL` until the lights are released.
    pub fn run<C: WallClock>(mut self, lights: &ChannelSet, clock: &C, sleeper: &dyn Sleeper) {
        info!("Alarm clock starting, dawn at {}", self.trigger());
        while !lights.is_released() {
            self.tick(lights, clock.now());
            sleeper.sleep(POLL_INTERVAL);
        }
        info!("Alarm clock stopped");
    }

    /// Run the alarm on its own named thread.
    pub fn spawn<C>(
        self,
        lights: Arc<ChannelSet>,
        clock: C,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<JoinHandle<()>>
    where
        C: WallClock + 'static,
    {
        let handle = thread::Builder::new()
            .name("alarm".into())
            .spawn(move || self.run(&lights, &clock, sleeper.as_ref()))
            .context("Failed to spawn the alarm thread")?;
        Ok(handle)
    }
}
