use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    sync::{Mutex, MutexGuard, Semaphore},
    task::JoinHandle,
};

use crate::{
    error::{AppError, AppResult},
    kernel::{KernelClient, KernelError, KernelLauncher, KernelManager},
    metrics::MetricsRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    AlreadyExists,
}

/// A fully started kernel owned by one session.
pub struct KernelHandle {
    session_id: String,
    manager: Box<dyn KernelManager>,
    client: Arc<dyn KernelClient>,
    exec_lock: Mutex<()>,
    last_active: StdMutex<Instant>,
    closed: AtomicBool,
}

impl KernelHandle {
    fn new(session_id: &str, manager: Box<dyn KernelManager>, client: Arc<dyn KernelClient>) -> Self {
        Self {
            session_id: session_id.to_string(),
            manager,
            client,
            exec_lock: Mutex::new(()),
            last_active: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &dyn KernelClient {
        self.client.as_ref()
    }

    /// Serializes executions against this session's kernel. Callers hold the
    /// guard for a whole grading run so the shared output stream carries one
    /// submission at a time.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        let guard = self.exec_lock.lock().await;
        self.touch();
        guard
    }

    /// True once the handle has been torn down; a caller that looked the
    /// handle up before removal must not use it.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn is_busy(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }

    /// Closes the channels before stopping the process so no reader is left
    /// waiting on a dead kernel. Failures are logged and otherwise ignored.
    async fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.client.is_alive().await {
            self.client.stop_channels().await;
        }
        if self.manager.is_alive().await {
            if let Err(err) = self.manager.shutdown_kernel().await {
                tracing::warn!(session_id = %self.session_id, error = %err, "kernel shutdown failed");
            }
        }
        tracing::info!(session_id = %self.session_id, "kernel torn down");
    }
}

/// Maps session ids to their kernels.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<KernelHandle>>,
    launcher: Arc<dyn KernelLauncher>,
    startup_timeout: Duration,
    start_permits: Semaphore,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn KernelLauncher>,
        startup_timeout: Duration,
        max_concurrent_starts: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            launcher,
            startup_timeout,
            start_permits: Semaphore::new(max_concurrent_starts.max(1)),
        }
    }

    /// Starts a kernel for `session_id` unless one is already registered.
    ///
    /// Nothing is registered unless the kernel reached readiness. When two
    /// starts for the same id overlap, the later one discards its kernel.
    pub async fn start(&self, session_id: &str) -> AppResult<StartOutcome> {
        if self.sessions.contains_key(session_id) {
            return Ok(StartOutcome::AlreadyExists);
        }

        let handle = {
            let _permit = self
                .start_permits
                .acquire()
                .await
                .map_err(|_| AppError::Internal("kernel start pool closed".to_string()))?;
            self.launch(session_id).await?
        };

        let duplicate = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => Some(handle),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handle));
                None
            }
        };
        if let Some(handle) = duplicate {
            tracing::info!(session_id, "session registered concurrently; discarding extra kernel");
            handle.teardown().await;
            return Ok(StartOutcome::AlreadyExists);
        }

        tracing::info!(session_id, backend = self.launcher.name(), "kernel ready");
        Ok(StartOutcome::Created)
    }

    async fn launch(&self, session_id: &str) -> AppResult<KernelHandle> {
        tracing::info!(session_id, "starting kernel");
        let manager = self.launcher.manager();
        manager
            .start_kernel()
            .await
            .map_err(|err| AppError::KernelStart(format!("{err:#}")))?;

        let client = manager.client();
        if let Err(err) = client.start_channels().await {
            shutdown_quietly(session_id, manager.as_ref()).await;
            return Err(AppError::KernelStart(err.to_string()));
        }

        if let Err(err) = client.wait_for_ready(self.startup_timeout).await {
            tracing::warn!(session_id, error = %err, "kernel did not become ready");
            client.stop_channels().await;
            shutdown_quietly(session_id, manager.as_ref()).await;
            return Err(match err {
                KernelError::Timeout(_) => AppError::KernelStartTimeout,
                other => AppError::KernelStart(other.to_string()),
            });
        }

        Ok(KernelHandle::new(session_id, manager, client))
    }

    pub fn lookup(&self, session_id: &str) -> AppResult<Arc<KernelHandle>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or(AppError::SessionNotFound)
    }

    /// Removes and stops the session's kernel. Returns whether one existed.
    ///
    /// Does not wait for an execution in flight: closing the channels ends
    /// its read loop, and the grader sees the handle as closed.
    pub async fn remove_and_teardown(&self, session_id: &str) -> bool {
        let Some((_, handle)) = self.sessions.remove(session_id) else {
            return false;
        };
        handle.teardown().await;
        true
    }

    /// Tears down every session idle for at least `max_idle` that is not
    /// currently executing. Returns the reaped ids.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for session_id in candidates {
            let removed = self.sessions.remove_if(&session_id, |_, handle| {
                !handle.is_busy() && handle.idle_for() >= max_idle
            });
            if let Some((_, handle)) = removed {
                tracing::info!(session_id = %session_id, "reaping idle session");
                handle.teardown().await;
                reaped.push(session_id);
            }
        }
        reaped
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            self.remove_and_teardown(&session_id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

async fn shutdown_quietly(session_id: &str, manager: &dyn KernelManager) {
    if let Err(err) = manager.shutdown_kernel().await {
        tracing::warn!(session_id, error = %err, "failed to stop half-started kernel");
    }
}

pub fn spawn_idle_reaper(
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsRegistry>,
    max_idle: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(max_idle).await;
            if !reaped.is_empty() {
                metrics.sessions_reaped(reaped.len() as u64);
                tracing::info!(count = reaped.len(), "idle sessions reaped");
            }
        }
    })
}
