use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared between the engine-lifecycle layer and the
/// request layer. `gwd` renders these as Prometheus text; the atomics live
/// here so `EngineManager` and `EngineHttp` can increment them at the
/// point where the event actually happens rather than guessing from the
/// outside.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub client_disconnects_total: AtomicU64,
    pub engine_starts_total: AtomicU64,
    pub idle_stops_total: AtomicU64,
    pub upstream_errors_timeout: AtomicU64,
    pub upstream_errors_connect: AtomicU64,
    pub upstream_errors_other: AtomicU64,
}

impl Metrics {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_start(&self) {
        Self::inc(&self.engine_starts_total);
    }

    pub fn record_idle_stop(&self) {
        Self::inc(&self.idle_stops_total);
    }

    pub fn record_client_disconnect(&self) {
        Self::inc(&self.client_disconnects_total);
    }

    pub fn record_upstream_error(&self, err: &reqwest::Error) {
        if err.is_timeout() {
            Self::inc(&self.upstream_errors_timeout);
        } else if err.is_connect() {
            Self::inc(&self.upstream_errors_connect);
        } else {
            Self::inc(&self.upstream_errors_other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::default();
        assert_eq!(m.engine_starts_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.idle_stops_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.client_disconnects_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn record_helpers_increment_once() {
        let m = Metrics::default();
        m.record_engine_start();
        m.record_idle_stop();
        m.record_client_disconnect();
        assert_eq!(m.engine_starts_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.idle_stops_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.client_disconnects_total.load(Ordering::Relaxed), 1);
    }
}
