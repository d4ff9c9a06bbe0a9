//! Process lifetime: startup flash, alarm thread and HTTP server, all cut
//! short by the shutdown signal.

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::alarm::{Alarm, WallClock};
use crate::api;
use crate::channel_set::ChannelSet;
use crate::config::Config;
use crate::pacing::Sleeper;

/// Run until `shutdown` resolves or something fails, then release the lights.
///
/// `shutdown` resolves to the name of whatever asked the process to stop. It
/// is watched from the very start, including during the startup flash.
pub async fn run<C, S>(
    config: &Config,
    lights: Arc<ChannelSet>,
    sleeper: Arc<dyn Sleeper>,
    clock: C,
    shutdown: S,
) -> Result<()>
where
    C: WallClock + 'static,
    S: Future<Output = &'static str>,
{
    let result = supervise(config, Arc::clone(&lights), sleeper, clock, shutdown).await;
    lights.shutdown();
    result
}

async fn supervise<C, S>(
    config: &Config,
    lights: Arc<ChannelSet>,
    sleeper: Arc<dyn Sleeper>,
    clock: C,
    shutdown: S,
) -> Result<()>
where
    C: WallClock + 'static,
    S: Future<Output = &'static str>,
{
    tokio::pin!(shutdown);

    if config.startup_flash {
        let flashing = Arc::clone(&lights);
        let flash = tokio::task::spawn_blocking(move || flashing.startup_sequence());
        tokio::select! {
            joined = flash => joined.context("Startup flash panicked")?,
            signal = &mut shutdown => {
                info!("Received {} during the startup flash, shutting down", signal);
                return Ok(());
            }
        }
    }

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    let alarm = Alarm::new(config.alarm).spawn(Arc::clone(&lights), clock, sleeper)?;
    let alarm_done = tokio::task::spawn_blocking(move || alarm.join());

    tokio::select! {
        result = api::serve(listener, lights) => result,
        joined = alarm_done => {
            match joined {
                Ok(Ok(())) => warn!("Alarm thread stopped"),
                _ => error!("Alarm thread panicked"),
            }
            bail!("Alarm thread is gone")
        }
        signal = &mut shutdown => {
            info!("Received {}, shutting down", signal);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::LocalClock;
    use crate::channel::LevelBounds;
    use crate::channel_set::ChannelPins;
    use crate::pacing::ThreadSleeper;
    use crate::pwm::MemoryBackend;
    use std::time::{Duration, Instant};

    fn lights_with(sleeper: &Arc<dyn Sleeper>) -> (Arc<ChannelSet>, MemoryBackend) {
        let backend = MemoryBackend::new();
        let lights = ChannelSet::acquire(
            Box::new(backend.clone()),
            ChannelPins::default(),
            LevelBounds::default(),
            Arc::clone(sleeper),
        )
        .unwrap();
        (Arc::new(lights), backend)
    }

    async fn signal_after(delay: Duration, name: &'static str) -> &'static str {
        tokio::time::sleep(delay).await;
        name
    }

    fn assert_released(lights: &ChannelSet, recorder: &MemoryBackend) {
        assert!(lights.is_released());
        assert_eq!(recorder.cleanup_count(), 1);
        for pin in [40, 38, 37, 36] {
            assert!(recorder.is_released(pin));
            assert_eq!(recorder.duty(pin), Some(0));
        }
    }

    #[tokio::test]
    async fn test_signal_during_startup_flash_releases_lights() {
        let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
        let (lights, recorder) = lights_with(&sleeper);
        let config = Config {
            port: 0,
            ..Config::default()
        };
        assert!(config.startup_flash);

        let start = Instant::now();
        run(
            &config,
            Arc::clone(&lights),
            sleeper,
            LocalClock,
            signal_after(Duration::from_millis(200), "SIGTERM"),
        )
        .await
        .unwrap();

        // The flash alone takes 12 s
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
        assert_released(&lights, &recorder);
        assert!(recorder.history(40).iter().any(|d| *d > 0));
    }

    #[tokio::test]
    async fn test_signal_while_serving_releases_lights() {
        let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
        let (lights, recorder) = lights_with(&sleeper);
        let config = Config {
            port: 0,
            startup_flash: false,
            ..Config::default()
        };

        run(
            &config,
            Arc::clone(&lights),
            sleeper,
            LocalClock,
            signal_after(Duration::from_millis(100), "SIGINT"),
        )
        .await
        .unwrap();

        assert_released(&lights, &recorder);
        assert!(recorder.history(40).iter().all(|d| *d == 0));
    }
}
