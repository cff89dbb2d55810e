//! Process-wide epoch-millisecond clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_ISSUED_MS: AtomicI64 = AtomicI64::new(0);

/// Returns the current epoch milliseconds, strictly increasing per process.
///
/// Two writes in the same millisecond still get distinct stamps, so
/// `updated_at` always moves forward after an update.
pub fn now_epoch_ms() -> i64 {
    let wall = wall_clock_ms();
    let mut last = LAST_ISSUED_MS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_ISSUED_MS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
