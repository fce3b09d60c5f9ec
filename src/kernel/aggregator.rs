use std::time::Duration;

use tokio::time::Instant;

use crate::kernel::{
    ExecutionState, KernelClient, MessageContent,
    message::plain_text,
};

/// Bounds on a single submission's read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Longest wait for any one kernel message.
    pub read_timeout: Duration,
    /// Longest the whole loop may run, however chatty the kernel is.
    pub deadline: Duration,
    /// Captured stdout, stderr and result text combined.
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1 << 20;

    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            deadline: Self::DEFAULT_DEADLINE.max(read_timeout),
            max_output_bytes: Self::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Text captured from one code submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Streamed stdout chunks in arrival order, followed by every
    /// `execute_result` rendering in arrival order.
    pub stdout: String,
    pub stderr: String,
    /// The read loop gave up before the kernel reported idle.
    pub timed_out: bool,
}

enum Cutoff {
    Silent(Duration),
    Deadline(Duration),
    Output(usize),
}

impl Cutoff {
    fn note(&self) -> String {
        match self {
            Self::Silent(wait) => format!(
                "\n[Kernel did not respond for {} seconds]",
                wait.as_secs_f64()
            ),
            Self::Deadline(limit) => format!(
                "\n[Execution exceeded {} seconds]",
                limit.as_secs_f64()
            ),
            Self::Output(limit) => format!("\n[Output exceeded {limit} bytes]"),
        }
    }
}

/// Submits `code` and folds the kernel's replies into an [`ExecutionOutput`].
///
/// Each read is bounded by `limits.read_timeout` and the loop as a whole by
/// `limits.deadline`. Messages whose parent id differs from this submission's
/// id are dropped, so late replies to an earlier submission never leak in.
/// The loop ends on the first idle status for this submission; a read
/// failure, the deadline or the output cap ends it too and leaves a note in
/// stderr. The kernel itself is left running either way.
pub async fn run_code(client: &dyn KernelClient, code: &str, limits: RunLimits) -> ExecutionOutput {
    let msg_id = match client.execute(code).await {
        Ok(msg_id) => msg_id,
        Err(err) => {
            tracing::warn!(error = %err, "kernel rejected submission");
            return ExecutionOutput {
                stdout: String::new(),
                stderr: format!("\n[Kernel could not accept code: {err}]"),
                timed_out: false,
            };
        }
    };

    let deadline = Instant::now() + limits.deadline;
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut results = String::new();

    let cutoff = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Some(Cutoff::Deadline(limits.deadline));
        }
        let wait = limits.read_timeout.min(remaining);
        let msg = match client.next_message(wait).await {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(msg_id = %msg_id, error = %err, "kernel read failed");
                if wait < limits.read_timeout && Instant::now() >= deadline {
                    break Some(Cutoff::Deadline(limits.deadline));
                }
                break Some(Cutoff::Silent(limits.read_timeout));
            }
        };

        if !msg.is_child_of(&msg_id) {
            tracing::trace!(msg_id = %msg_id, parent_id = ?msg.parent_id, "dropping foreign message");
            continue;
        }

        match msg.content {
            MessageContent::Stream { name, text } => {
                if name == "stdout" {
                    stdout.push_str(&text);
                } else {
                    stderr.push_str(&text);
                }
            }
            MessageContent::Error { traceback, .. } => stderr.push_str(&traceback.join("\n")),
            MessageContent::ExecuteResult { data } => results.push_str(plain_text(&data)),
            MessageContent::Status {
                execution_state: ExecutionState::Idle,
            } => break None,
            MessageContent::Status { .. } | MessageContent::Unrecognized => {}
        }

        if stdout.len() + stderr.len() + results.len() > limits.max_output_bytes {
            break Some(Cutoff::Output(limits.max_output_bytes));
        }
    };

    let mut timed_out = false;
    if let Some(cutoff) = cutoff {
        match cutoff {
            Cutoff::Output(_) => tracing::warn!(msg_id = %msg_id, "kernel output cap reached"),
            Cutoff::Silent(_) | Cutoff::Deadline(_) => timed_out = true,
        }
        stderr.push_str(&cutoff.note());
    }

    stdout.push_str(&results);
    ExecutionOutput {
        stdout,
        stderr,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RunLimits, run_code};
    use crate::kernel::{
        ExecutionState, KernelMessage,
        testing::{ScriptedKernel, completed},
    };

    const TIMEOUT: Duration = Duration::from_secs(20);

    fn limits() -> RunLimits {
        RunLimits::new(TIMEOUT)
    }

    #[tokio::test]
    async fn silent_code_yields_empty_output() {
        let kernel = ScriptedKernel::new(|msg_id, _| completed(msg_id, Vec::new()));
        let out = run_code(&*kernel, "x = 1", limits()).await;
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn results_follow_streamed_text() {
        let kernel = ScriptedKernel::new(|msg_id, _| {
            completed(
                msg_id,
                vec![
                    KernelMessage::result(msg_id, "42"),
                    KernelMessage::stream(msg_id, "stdout", "a\n"),
                    KernelMessage::stream(msg_id, "stderr", "warn\n"),
                    KernelMessage::stream(msg_id, "stdout", "b\n"),
                    KernelMessage::result(msg_id, "!"),
                ],
            )
        });
        let out = run_code(&*kernel, "print('a')", limits()).await;
        assert_eq!(out.stdout, "a\nb\n42!");
        assert_eq!(out.stderr, "warn\n");
    }

    #[tokio::test]
    async fn traceback_lines_are_joined_into_stderr() {
        let kernel = ScriptedKernel::new(|msg_id, _| {
            completed(
                msg_id,
                vec![KernelMessage::error(
                    msg_id,
                    &["Traceback (most recent call last):", "NameError: name 'y' is not defined"],
                )],
            )
        });
        let out = run_code(&*kernel, "y", limits()).await;
        assert_eq!(
            out.stderr,
            "Traceback (most recent call last):\nNameError: name 'y' is not defined"
        );
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn ignores_messages_from_other_submissions() {
        let kernel = ScriptedKernel::new(|msg_id, _| {
            vec![
                KernelMessage::stream("stale", "stdout", "old output\n"),
                KernelMessage::status(Some("stale"), ExecutionState::Idle),
                KernelMessage::stream(msg_id, "stdout", "new output\n"),
                KernelMessage::error("stale", &["OldError"]),
                KernelMessage::status(None, ExecutionState::Idle),
                KernelMessage::status(Some(msg_id), ExecutionState::Idle),
            ]
        });
        kernel.inject(KernelMessage::result("earlier", "99"));

        let out = run_code(&*kernel, "print('new output')", limits()).await;
        assert_eq!(out.stdout, "new output\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn missing_idle_reports_timeout_with_value() {
        let kernel = ScriptedKernel::new(|msg_id, _| {
            vec![KernelMessage::stream(msg_id, "stdout", "partial")]
        });
        let out = run_code(&*kernel, "while True: pass", RunLimits::new(Duration::from_secs(5))).await;
        assert_eq!(out.stdout, "partial");
        assert_eq!(out.stderr, "\n[Kernel did not respond for 5 seconds]");
        assert!(out.timed_out);
    }

    #[tokio::test]
    async fn unrecognized_and_busy_messages_do_not_end_the_loop() {
        let kernel = ScriptedKernel::new(|msg_id, _| {
            vec![
                KernelMessage::status(Some(msg_id), ExecutionState::Busy),
                KernelMessage {
                    parent_id: Some(msg_id.to_string()),
                    content: crate::kernel::MessageContent::Unrecognized,
                },
                KernelMessage::stream(msg_id, "stdout", "done"),
                KernelMessage::status(Some(msg_id), ExecutionState::Idle),
                KernelMessage::stream(msg_id, "stdout", "after idle"),
            ]
        });
        let out = run_code(&*kernel, "pass", limits()).await;
        assert_eq!(out.stdout, "done");
    }

    #[tokio::test]
    async fn dead_kernel_reports_rejection_in_stderr() {
        let kernel = ScriptedKernel::new(|msg_id, _| completed(msg_id, Vec::new()));
        kernel.kill();
        let out = run_code(&*kernel, "x = 1", limits()).await;
        assert_eq!(out.stdout, "");
        assert!(out.stderr.starts_with("\n[Kernel could not accept code: "));
        assert!(kernel.executed().is_empty());
    }

    #[tokio::test]
    async fn endless_output_stops_at_the_byte_cap() {
        let kernel = ScriptedKernel::flooding();
        let limits = RunLimits {
            max_output_bytes: 64,
            ..limits()
        };
        let out = run_code(&*kernel, "while True: print(1)", limits).await;
        assert!(out.stdout.len() > 64 && out.stdout.len() <= 66);
        assert_eq!(out.stderr, "\n[Output exceeded 64 bytes]");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn chatty_kernel_is_cut_off_at_the_deadline() {
        let kernel = ScriptedKernel::flooding();
        let limits = RunLimits {
            read_timeout: TIMEOUT,
            deadline: Duration::from_millis(50),
            max_output_bytes: usize::MAX,
        };
        let out = tokio::time::timeout(
            Duration::from_secs(5),
            run_code(&*kernel, "while True: print(1)", limits),
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(out.stderr.starts_with("\n[Execution exceeded "));
        assert!(out.stdout.starts_with("1\n"));
    }
}
