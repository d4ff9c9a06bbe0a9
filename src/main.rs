use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use pilights::alarm::LocalClock;
use pilights::channel_set::ChannelSet;
use pilights::config::Config;
use pilights::daemon;
use pilights::pacing::{Sleeper, ThreadSleeper};
use pilights::pwm::{MemoryBackend, PwmBackend, RppalBackend};

/// Turns the lights off however `main` exits.
struct ShutdownGuard(Arc<ChannelSet>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::load()?;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simulate" => config.simulate = true,
            other => bail!("Unknown argument '{}' (usage: pilights [--simulate])", other),
        }
    }

    info!("🚀 Starting pilights");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    // Registered before the hardware is touched so that every signal from
    // here on ends in a release
    let shutdown = {
        let _runtime = runtime.enter();
        shutdown_signal()?
    };

    let backend: Box<dyn PwmBackend> = if config.simulate {
        warn!("Simulating PWM outputs, no GPIO pins will be touched");
        Box::new(MemoryBackend::new())
    } else {
        Box::new(RppalBackend::new()?)
    };

    let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
    let lights = Arc::new(ChannelSet::acquire(
        backend,
        config.pins,
        config.bounds,
        Arc::clone(&sleeper),
    )?);
    let _guard = ShutdownGuard(Arc::clone(&lights));

    let result = runtime.block_on(daemon::run(
        &config,
        Arc::clone(&lights),
        sleeper,
        LocalClock,
        shutdown,
    ));

    runtime.shutdown_timeout(Duration::from_secs(5));
    info!("👋 Bye");
    result
}

/// Install the SIGINT and SIGTERM handlers. The returned future resolves to
/// the name of the first signal received.
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install the SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install the SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}
