//! In-memory kernel whose replies are produced by a closure, so registry,
//! aggregator and grading logic can be exercised without a Python process.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::kernel::{
    ExecutionState, KernelClient, KernelError, KernelLauncher, KernelManager, KernelMessage,
};

/// Maps `(msg_id, code)` to the messages the kernel emits for that submission.
pub type Responder = dyn Fn(&str, &str) -> Vec<KernelMessage> + Send + Sync;

/// Wraps `body` in the busy/idle status pair a real kernel sends.
pub fn completed(msg_id: &str, body: Vec<KernelMessage>) -> Vec<KernelMessage> {
    let mut out = vec![KernelMessage::status(Some(msg_id), ExecutionState::Busy)];
    out.extend(body);
    out.push(KernelMessage::status(Some(msg_id), ExecutionState::Idle));
    out
}

pub struct ScriptedKernel {
    responder: Arc<Responder>,
    inbox: Mutex<VecDeque<KernelMessage>>,
    executed: Mutex<Vec<String>>,
    counter: AtomicU64,
    becomes_ready: bool,
    flooding: bool,
    pending: Mutex<Option<String>>,
    overlapped: AtomicBool,
    process_alive: AtomicBool,
    channels_open: AtomicBool,
    dead: AtomicBool,
    pub shutdowns: AtomicUsize,
    pub channel_stops: AtomicUsize,
}

impl ScriptedKernel {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str, &str) -> Vec<KernelMessage> + Send + Sync + 'static,
    {
        Self::build(Arc::new(responder), true, false)
    }

    /// A kernel stuck printing forever: every read yields another stdout
    /// chunk for the latest submission until the channels are stopped.
    pub fn flooding() -> Arc<Self> {
        Self::build(Arc::new(|_: &str, _: &str| -> Vec<KernelMessage> { Vec::new() }), true, true)
    }

    fn build(responder: Arc<Responder>, becomes_ready: bool, flooding: bool) -> Arc<Self> {
        Arc::new(Self {
            responder,
            inbox: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            becomes_ready,
            flooding,
            pending: Mutex::new(None),
            overlapped: AtomicBool::new(false),
            process_alive: AtomicBool::new(false),
            channels_open: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            channel_stops: AtomicUsize::new(0),
        })
    }

    /// Queues a message as if the kernel had already emitted it.
    pub fn inject(&self, msg: KernelMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// True if a submission was sent while an earlier one had not yet
    /// delivered its idle status.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Simulates the kernel process dying on its own; later executes fail.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.process_alive.store(false, Ordering::SeqCst);
        self.channels_open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl KernelClient for ScriptedKernel {
    async fn start_channels(&self) -> Result<(), KernelError> {
        self.channels_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), KernelError> {
        if self.becomes_ready {
            Ok(())
        } else {
            Err(KernelError::Timeout(timeout))
        }
    }

    async fn execute(&self, code: &str) -> Result<String, KernelError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(KernelError::ChannelClosed);
        }
        let msg_id = format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        if self.pending.lock().unwrap().replace(msg_id.clone()).is_some() {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.executed.lock().unwrap().push(code.to_string());
        let replies = (self.responder)(&msg_id, code);
        self.inbox.lock().unwrap().extend(replies);
        Ok(msg_id)
    }

    async fn next_message(&self, timeout: Duration) -> Result<KernelMessage, KernelError> {
        tokio::task::yield_now().await;
        if self.flooding {
            if self.dead.load(Ordering::SeqCst) || self.channel_stops.load(Ordering::SeqCst) > 0 {
                return Err(KernelError::ChannelClosed);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            let parent = self.pending.lock().unwrap().clone().unwrap_or_default();
            return Ok(KernelMessage::stream(&parent, "stdout", "1\n"));
        }

        let msg = self
            .inbox
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(KernelError::Timeout(timeout))?;
        let mut pending = self.pending.lock().unwrap();
        if msg.is_idle() && pending.as_deref().is_some_and(|id| msg.is_child_of(id)) {
            *pending = None;
        }
        Ok(msg)
    }

    async fn stop_channels(&self) {
        self.channel_stops.fetch_add(1, Ordering::SeqCst);
        self.channels_open.store(false, Ordering::SeqCst);
    }

    async fn is_alive(&self) -> bool {
        self.channels_open.load(Ordering::SeqCst)
    }
}

pub struct ScriptedManager {
    kernel: Arc<ScriptedKernel>,
}

#[async_trait]
impl KernelManager for ScriptedManager {
    async fn start_kernel(&self) -> anyhow::Result<()> {
        self.kernel.process_alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn client(&self) -> Arc<dyn KernelClient> {
        self.kernel.clone()
    }

    async fn shutdown_kernel(&self) -> anyhow::Result<()> {
        self.kernel.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.kernel.process_alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.kernel.process_alive.load(Ordering::SeqCst)
    }
}

pub struct ScriptedLauncher {
    responder: Arc<Responder>,
    becomes_ready: bool,
    flooding: bool,
    launched: Mutex<Vec<Arc<ScriptedKernel>>>,
}

impl ScriptedLauncher {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str, &str) -> Vec<KernelMessage> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Arc::new(responder),
            becomes_ready: true,
            flooding: false,
            launched: Mutex::new(Vec::new()),
        })
    }

    /// A launcher whose kernels never report readiness.
    pub fn unresponsive() -> Arc<Self> {
        Arc::new(Self {
            responder: Arc::new(|_: &str, _: &str| -> Vec<KernelMessage> { Vec::new() }),
            becomes_ready: false,
            flooding: false,
            launched: Mutex::new(Vec::new()),
        })
    }

    /// A launcher whose kernels behave like [`ScriptedKernel::flooding`].
    pub fn flooding() -> Arc<Self> {
        Arc::new(Self {
            responder: Arc::new(|_: &str, _: &str| -> Vec<KernelMessage> { Vec::new() }),
            becomes_ready: true,
            flooding: true,
            launched: Mutex::new(Vec::new()),
        })
    }

    /// Replies to every submission with an immediate idle status.
    pub fn silent() -> Arc<Self> {
        Self::new(|msg_id, _| completed(msg_id, Vec::new()))
    }

    pub fn launched(&self) -> Vec<Arc<ScriptedKernel>> {
        self.launched.lock().unwrap().clone()
    }
}

impl KernelLauncher for ScriptedLauncher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn manager(&self) -> Box<dyn KernelManager> {
        let kernel = ScriptedKernel::build(self.responder.clone(), self.becomes_ready, self.flooding);
        self.launched.lock().unwrap().push(kernel.clone());
        Box::new(ScriptedManager { kernel })
    }
}
