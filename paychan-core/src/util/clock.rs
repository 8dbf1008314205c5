use crate::SendSync;
use core::time::Duration;

/// A wall-clock provider.
///
/// Channel expiries are absolute UNIX times, so everything that compares
/// against them reads the time through this trait.
pub trait Clock: SendSync {
    /// A duration since the UNIX epoch
    fn now(&self) -> Duration;

    /// Whole seconds since the UNIX epoch
    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

mod standard {
    use super::SendSync;
    use core::time::Duration;
    use std::time::SystemTime;

    /// A clock provider using the std::time::SystemTime
    pub struct StandardClock();

    impl SendSync for StandardClock {}

    impl super::Clock for StandardClock {
        fn now(&self) -> Duration {
            // a system clock before 1970 is treated as the epoch
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default()
        }
    }
}

pub use standard::*;

mod manual {
    use crate::prelude::*;
    use core::time::Duration;

    /// A clock provider with manually updated notion of "now"
    #[derive(Clone)]
    pub struct ManualClock(Arc<Mutex<Duration>>);

    impl SendSync for ManualClock {}

    impl super::Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.0.lock().unwrap()
        }
    }

    impl ManualClock {
        /// Create a manual clock
        pub fn new(now: Duration) -> Self {
            ManualClock(Arc::new(Mutex::new(now)))
        }

        /// Set the current time as duration since the UNIX epoch
        pub fn set(&self, now: Duration) {
            *self.0.lock().unwrap() = now;
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }
}

pub use manual::*;
