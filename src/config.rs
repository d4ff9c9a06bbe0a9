//! Daemon configuration.
//!
//! Values come from the process environment, falling back to whatever `.env`
//! held when the crate was built, falling back to the built-in defaults.

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::alarm::AlarmTime;
use crate::channel::{LevelBounds, MIN_LEVEL};
use crate::channel_set::ChannelPins;

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// HTTP port, bound on all interfaces.
    pub port: u16,
    pub pins: ChannelPins,
    /// Time of day the dawn sequence starts.
    pub alarm: AlarmTime,
    pub bounds: LevelBounds,
    /// Use the in-memory PWM backend instead of the GPIO header.
    pub simulate: bool,
    /// Flash every channel once at startup.
    pub startup_flash: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            pins: ChannelPins::default(),
            alarm: AlarmTime::default(),
            bounds: LevelBounds::default(),
            simulate: false,
            startup_flash: true,
        }
    }
}

/// Values baked in from `.env` by the build script.
fn compiled_default(key: &str) -> Option<&'static str> {
    match key {
        "PILIGHTS_PORT" => option_env!("PILIGHTS_PORT"),
        "PILIGHTS_PIN_RED" => option_env!("PILIGHTS_PIN_RED"),
        "PILIGHTS_PIN_GREEN" => option_env!("PILIGHTS_PIN_GREEN"),
        "PILIGHTS_PIN_BLUE" => option_env!("PILIGHTS_PIN_BLUE"),
        "PILIGHTS_PIN_WHITE" => option_env!("PILIGHTS_PIN_WHITE"),
        "PILIGHTS_ALARM" => option_env!("PILIGHTS_ALARM"),
        "PILIGHTS_MAX_LEVEL" => option_env!("PILIGHTS_MAX_LEVEL"),
        "PILIGHTS_STARTUP_FLASH" => option_env!("PILIGHTS_STARTUP_FLASH"),
        _ => None,
    }
}

impl Config {
    /// Load from `.env` in the working directory and the process environment.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("Failed to read .env"),
        }

        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| compiled_default(key).map(String::from))
        })
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let pins = ChannelPins {
            red: parse_var(&lookup, "PILIGHTS_PIN_RED", defaults.pins.red)?,
            green: parse_var(&lookup, "PILIGHTS_PIN_GREEN", defaults.pins.green)?,
            blue: parse_var(&lookup, "PILIGHTS_PIN_BLUE", defaults.pins.blue)?,
            white: parse_var(&lookup, "PILIGHTS_PIN_WHITE", defaults.pins.white)?,
        };
        let all = [pins.red, pins.green, pins.blue, pins.white];
        for (i, pin) in all.iter().enumerate() {
            if all[i + 1..].contains(pin) {
                bail!("Board pin {} is assigned to more than one channel", pin);
            }
        }

        let max_level = parse_var(&lookup, "PILIGHTS_MAX_LEVEL", defaults.bounds.max())?;
        let bounds = LevelBounds::new(MIN_LEVEL, max_level).context("Invalid PILIGHTS_MAX_LEVEL")?;

        Ok(Self {
            port: parse_var(&lookup, "PILIGHTS_PORT", defaults.port)?,
            pins,
            alarm: parse_var(&lookup, "PILIGHTS_ALARM", defaults.alarm)?,
            bounds,
            simulate: parse_flag(&lookup, "PILIGHTS_SIMULATE", defaults.simulate)?,
            startup_flash: parse_flag(&lookup, "PILIGHTS_STARTUP_FLASH", defaults.startup_flash)?,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} '{}': {}", key, value, e)),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(anyhow!("Invalid {} '{}': expected a boolean", key, value)),
    }
}
