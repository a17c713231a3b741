use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    runs_started_total: AtomicU64,
    runs_completed_total: AtomicU64,
    runs_failed_total: AtomicU64,
    runs_timed_out_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    active_sessions: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.runs_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.runs_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_failed(&self) {
        self.runs_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_timed_out(&self) {
        self.runs_timed_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.decrement_active_sessions();
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE runbox_runs_started_total counter\n",
                "runbox_runs_started_total {}\n",
                "# TYPE runbox_runs_completed_total counter\n",
                "runbox_runs_completed_total {}\n",
                "# TYPE runbox_runs_failed_total counter\n",
                "runbox_runs_failed_total {}\n",
                "# TYPE runbox_runs_timed_out_total counter\n",
                "runbox_runs_timed_out_total {}\n",
                "# TYPE runbox_cache_hits_total counter\n",
                "runbox_cache_hits_total {}\n",
                "# TYPE runbox_cache_misses_total counter\n",
                "runbox_cache_misses_total {}\n",
                "# TYPE runbox_active_sessions gauge\n",
                "runbox_active_sessions {}\n"
            ),
            self.runs_started_total.load(Ordering::Relaxed),
            self.runs_completed_total.load(Ordering::Relaxed),
            self.runs_failed_total.load(Ordering::Relaxed),
            self.runs_timed_out_total.load(Ordering::Relaxed),
            self.cache_hits_total.load(Ordering::Relaxed),
            self.cache_misses_total.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
        )
    }

    fn decrement_active_sessions(&self) {
        let mut current = self.active_sessions.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_sessions.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn active_sessions_gauge_does_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.session_closed();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("runbox_active_sessions 0"));
    }
}
