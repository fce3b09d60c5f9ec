use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    assessment::Question,
    config::GradingConfig,
    kernel::{
        KernelClient,
        aggregator::{ExecutionOutput, RunLimits, run_code},
    },
    metrics::MetricsRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeReport {
    pub stdout: String,
    pub stderr: String,
    /// One entry per test case, in the question's order.
    pub test_results: Vec<bool>,
}

pub struct Grader {
    config: GradingConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Grader {
    pub fn new(config: GradingConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self { config, metrics }
    }

    /// Runs the student's code, then each test snippet appended to it.
    ///
    /// All runs share the session's interpreter, so module-level state left by
    /// the student's run is visible to every test snippet. If the student's
    /// run wrote anything to stderr no snippet is executed and every test
    /// fails.
    pub async fn grade(
        &self,
        client: &dyn KernelClient,
        question: &Question,
        code: &str,
    ) -> GradeReport {
        self.metrics.execution();
        let student = run_code(client, code, self.limits(self.config.execution_timeout)).await;
        if student.timed_out {
            self.metrics.read_timeout();
        }

        if !student.stderr.is_empty() {
            self.metrics.student_error();
            tracing::debug!(question_id = %question.id, "student code failed; skipping tests");
            return GradeReport {
                stdout: student.stdout,
                stderr: student.stderr,
                test_results: vec![false; question.test_cases.len()],
            };
        }

        let mut test_results = Vec::with_capacity(question.test_cases.len());
        for (index, case) in question.test_cases.iter().enumerate() {
            let program = format!("{code}\n\n{}", case.code_to_run);
            let out = run_code(client, &program, self.limits(self.config.test_timeout)).await;
            if out.timed_out {
                self.metrics.read_timeout();
            }
            let passed = test_passed(&out, &case.expected_output);
            self.metrics.test_run(passed);
            tracing::debug!(question_id = %question.id, test = index, passed, "test case graded");
            test_results.push(passed);
        }

        GradeReport {
            stdout: student.stdout,
            stderr: student.stderr,
            test_results,
        }
    }

    fn limits(&self, read_timeout: Duration) -> RunLimits {
        RunLimits {
            read_timeout,
            deadline: self.config.run_deadline.max(read_timeout),
            max_output_bytes: self.config.max_output_bytes,
        }
    }
}

/// A test passes when it raised nothing and its trimmed stdout equals the
/// expected text exactly.
pub fn test_passed(out: &ExecutionOutput, expected: &str) -> bool {
    out.stderr.is_empty() && out.stdout.trim() == expected
}
