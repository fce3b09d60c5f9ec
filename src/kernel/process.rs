use std::{
    process::Stdio,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::kernel::{
    KernelClient, KernelError, KernelLauncher, KernelManager, KernelMessage, MessageContent,
};

const DRIVER: &str = include_str!("driver.py");
const INBOX_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Launches kernels as long-lived Python interpreters running the bundled
/// driver, one per session.
pub struct ProcessKernelLauncher {
    python: String,
}

impl ProcessKernelLauncher {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

impl KernelLauncher for ProcessKernelLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    fn manager(&self) -> Box<dyn KernelManager> {
        Box::new(ProcessKernelManager {
            python: self.python.clone(),
            child: Mutex::new(None),
            client: Arc::new(ProcessKernelClient::default()),
        })
    }
}

pub struct ProcessKernelManager {
    python: String,
    child: Mutex<Option<Child>>,
    client: Arc<ProcessKernelClient>,
}

#[async_trait]
impl KernelManager for ProcessKernelManager {
    async fn start_kernel(&self) -> anyhow::Result<()> {
        let mut child = Command::new(&self.python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn kernel interpreter {}", self.python))?;

        let stdin = child.stdin.take().context("missing kernel stdin pipe")?;
        let stdout = child.stdout.take().context("missing kernel stdout pipe")?;
        tracing::debug!(pid = ?child.id(), "kernel process spawned");

        self.client.attach(stdin, stdout).await;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    fn client(&self) -> Arc<dyn KernelClient> {
        self.client.clone()
    }

    async fn shutdown_kernel(&self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.client.close_stdin().await;

        if child.try_wait()?.is_some() {
            return Ok(());
        }
        // Closing stdin ends the driver's request loop; give it a moment.
        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_ok() {
            return Ok(());
        }
        child.kill().await.context("failed to kill kernel process")
    }

    async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    msg_id: &'a str,
    code: &'a str,
}

#[derive(Default)]
pub struct ProcessKernelClient {
    stdin: Mutex<Option<ChildStdin>>,
    stdout: StdMutex<Option<ChildStdout>>,
    inbox: Mutex<Option<mpsc::Receiver<KernelMessage>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessKernelClient {
    async fn attach(&self, stdin: ChildStdin, stdout: ChildStdout) {
        *self.stdin.lock().await = Some(stdin);
        if let Ok(mut slot) = self.stdout.lock() {
            *slot = Some(stdout);
        }
    }

    async fn close_stdin(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }
}

#[async_trait]
impl KernelClient for ProcessKernelClient {
    async fn start_channels(&self) -> Result<(), KernelError> {
        let stdout = self
            .stdout
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(KernelError::NotStarted)?;

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let reader = tokio::spawn(read_messages(stdout, tx));
        *self.inbox.lock().await = Some(rx);
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }
        Ok(())
    }

    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), KernelError> {
        let wait = async {
            loop {
                let msg = self.next_message(timeout).await?;
                if msg.parent_id.is_none() && msg.is_idle() {
                    return Ok::<(), KernelError>(());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| KernelError::Timeout(timeout))?
    }

    async fn execute(&self, code: &str) -> Result<String, KernelError> {
        let msg_id = Uuid::new_v4().to_string();
        let mut line = serde_json::to_vec(&ExecuteRequest {
            msg_id: &msg_id,
            code,
        })?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(KernelError::ChannelClosed)?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(msg_id)
    }

    async fn next_message(&self, timeout: Duration) -> Result<KernelMessage, KernelError> {
        let mut inbox = self.inbox.lock().await;
        let inbox = inbox.as_mut().ok_or(KernelError::NotStarted)?;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(KernelError::ChannelClosed),
            Err(_) => Err(KernelError::Timeout(timeout)),
        }
    }

    async fn stop_channels(&self) {
        if let Some(reader) = self.reader.lock().ok().and_then(|mut slot| slot.take()) {
            reader.abort();
        }
        self.inbox.lock().await.take();
        self.close_stdin().await;
    }

    async fn is_alive(&self) -> bool {
        self.reader
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|reader| !reader.is_finished()))
            .unwrap_or(false)
    }
}

async fn read_messages(stdout: ChildStdout, tx: mpsc::Sender<KernelMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "kernel stdout read failed");
                break;
            }
        };
        let msg = match serde_json::from_str::<KernelMessage>(&line) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed kernel line");
                continue;
            }
        };
        if let MessageContent::Status { execution_state } = &msg.content {
            tracing::trace!(parent_id = ?msg.parent_id, state = ?execution_state, "kernel status");
        }
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    tracing::debug!("kernel output stream closed");
}
