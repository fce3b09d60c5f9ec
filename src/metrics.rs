use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    sessions_started_total: AtomicU64,
    sessions_failed_total: AtomicU64,
    sessions_closed_total: AtomicU64,
    sessions_reaped_total: AtomicU64,
    executions_total: AtomicU64,
    student_errors_total: AtomicU64,
    test_runs_total: AtomicU64,
    tests_passed_total: AtomicU64,
    read_timeouts_total: AtomicU64,
    submissions_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_reaped(&self, count: u64) {
        self.sessions_reaped_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn execution(&self) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn student_error(&self) {
        self.student_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn test_run(&self, passed: bool) {
        self.test_runs_total.fetch_add(1, Ordering::Relaxed);
        if passed {
            self.tests_passed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn read_timeout(&self) {
        self.read_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission(&self) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self, active_sessions: usize) -> String {
        format!(
            concat!(
                "# TYPE grader_sessions_started_total counter\n",
                "grader_sessions_started_total {}\n",
                "# TYPE grader_sessions_failed_total counter\n",
                "grader_sessions_failed_total {}\n",
                "# TYPE grader_sessions_closed_total counter\n",
                "grader_sessions_closed_total {}\n",
                "# TYPE grader_sessions_reaped_total counter\n",
                "grader_sessions_reaped_total {}\n",
                "# TYPE grader_sessions_active gauge\n",
                "grader_sessions_active {}\n",
                "# TYPE grader_executions_total counter\n",
                "grader_executions_total {}\n",
                "# TYPE grader_student_errors_total counter\n",
                "grader_student_errors_total {}\n",
                "# TYPE grader_test_runs_total counter\n",
                "grader_test_runs_total {}\n",
                "# TYPE grader_tests_passed_total counter\n",
                "grader_tests_passed_total {}\n",
                "# TYPE grader_read_timeouts_total counter\n",
                "grader_read_timeouts_total {}\n",
                "# TYPE grader_submissions_total counter\n",
                "grader_submissions_total {}\n"
            ),
            self.sessions_started_total.load(Ordering::Relaxed),
            self.sessions_failed_total.load(Ordering::Relaxed),
            self.sessions_closed_total.load(Ordering::Relaxed),
            self.sessions_reaped_total.load(Ordering::Relaxed),
            active_sessions,
            self.executions_total.load(Ordering::Relaxed),
            self.student_errors_total.load(Ordering::Relaxed),
            self.test_runs_total.load(Ordering::Relaxed),
            self.tests_passed_total.load(Ordering::Relaxed),
            self.read_timeouts_total.load(Ordering::Relaxed),
            self.submissions_total.load(Ordering::Relaxed),
        )
    }
}
