//! Timed pauses used by ramps, sequences and the alarm poll.

use std::thread;
use std::time::Duration;

/// Something that can block the calling thread for a while.
///
/// Every suspension point in the light engine goes through this trait so that
/// long sequences can be driven without waiting on the real clock.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Sleeper;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every requested pause and returns immediately.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSleeper {
        pauses: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn pauses(&self) -> Vec<Duration> {
            self.pauses.lock().unwrap().clone()
        }

        pub(crate) fn total(&self) -> Duration {
            self.pauses.lock().unwrap().iter().sum()
        }

        pub(crate) fn clear(&self) {
            self.pauses.lock().unwrap().clear();
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSleeper;
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_thread_sleeper_blocks() {
        let start = Instant::now();
        ThreadSleeper.sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_recording_sleeper_sums_pauses() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_millis(500));
        sleeper.sleep(Duration::from_secs(1));
        assert_eq!(sleeper.pauses().len(), 2);
        assert_eq!(sleeper.total(), Duration::from_millis(1500));

        sleeper.clear();
        assert!(sleeper.pauses().is_empty());
    }
}
