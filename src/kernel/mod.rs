//! Seam between the grading service and the process that actually runs code.
//!
//! A kernel is split the way notebook kernels usually are: a [`KernelManager`]
//! owns the process lifecycle and hands out a [`KernelClient`] that submits
//! code and reads the typed message stream the process produces.

pub mod aggregator;
pub mod message;
pub mod process;
pub mod registry;
#[cfg(test)]
pub mod testing;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub use message::{ExecutionState, KernelMessage, MessageContent};
pub use process::ProcessKernelLauncher;
pub use registry::{SessionRegistry, StartOutcome};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no message within {0:?}")]
    Timeout(Duration),
    #[error("kernel channel closed")]
    ChannelClosed,
    #[error("kernel channels are not started")]
    NotStarted,
    #[error("kernel io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode kernel request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait KernelManager: Send + Sync {
    async fn start_kernel(&self) -> anyhow::Result<()>;

    fn client(&self) -> Arc<dyn KernelClient>;

    async fn shutdown_kernel(&self) -> anyhow::Result<()>;

    async fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait KernelClient: Send + Sync {
    async fn start_channels(&self) -> Result<(), KernelError>;

    /// Blocks until the kernel reports it can accept code.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), KernelError>;

    /// Submits `code` and returns the correlation id its messages will carry.
    async fn execute(&self, code: &str) -> Result<String, KernelError>;

    async fn next_message(&self, timeout: Duration) -> Result<KernelMessage, KernelError>;

    async fn stop_channels(&self);

    async fn is_alive(&self) -> bool;
}

pub trait KernelLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// A manager for a kernel that has not been started yet.
    fn manager(&self) -> Box<dyn KernelManager>;
}
