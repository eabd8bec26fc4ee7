//! Wall-clock reads for expiry math. Unit tests swap in mock_instant's
//! controllable clock so expiration windows can be pinned exactly.

#[cfg(test)]
use mock_instant::global::{SystemTime, UNIX_EPOCH};
#[cfg(not(test))]
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, right now.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("wall clock reads before the unix epoch")
        .as_millis() as u64
}

/// The mocked clock is process-global; tests that set or advance it take
/// this lock so they serialize against each other.
#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static CLOCK_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub fn lock_clock() -> MutexGuard<'static, ()> {
        CLOCK_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
