use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_NS: AtomicI64 = AtomicI64::new(0);

/// Nanoseconds since the Unix epoch.
///
/// Strictly increasing within a process: a call never returns a value at or
/// below one already handed out, even if the wall clock stalls or steps back.
pub fn now_ns() -> i64 {
    let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);

    let mut last = LAST_NS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last.saturating_add(1));
        match LAST_NS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
