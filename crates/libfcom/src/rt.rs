//! Real-time scheduling for the receiver thread.
//!
//! The receiver runs SCHED_FIFO at a priority expressed as a percentile
//! of the platform's real-time range. Without the privilege to do so
//! (the common case on developer machines) it falls back to the
//! inherited policy with a warning, exactly once, at startup.

/// Apply SCHED_FIFO to the calling thread at `percent` of the real-time
/// priority range. Best-effort; failures are logged, not returned.
pub(crate) fn set_realtime_priority(percent: u8) {
    let pmin = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    let pmax = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if pmin < 0 || pmax < 0 {
        tracing::warn!("cannot query SCHED_FIFO priority range");
        return;
    }

    let priority = pmin + (pmax - pmin) * percent.min(100) as i32 / 100;
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let err = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    match err {
        0 => tracing::debug!(priority, "receiver thread scheduled SCHED_FIFO"),
        libc::EPERM => tracing::warn!(
            "not using real-time scheduler due to lack of privilege; \
             receiver keeps the default policy"
        ),
        err => tracing::warn!(err, "failed to apply real-time scheduling"),
    }
}
