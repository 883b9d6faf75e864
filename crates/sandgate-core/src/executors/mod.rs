//! Execution backends for validated code.
//!
//! Both tiers sit behind the same `Executor` trait so the retry coordinator
//! can wrap either one. The lightweight tier runs a sandboxed child process
//! on this host; the heavy tier hands the code to an external scheduler.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core_types::{ExecutionRequest, ExecutionResult, ExecutionTier};
use crate::errors::ExecutionError;

pub mod sandbox;
pub mod secure;

pub use secure::SecureExecutor;

/// One attempt at running a request. Failures of the program itself come
/// back as a non-success `ExecutionResult`; `Err` means the machinery failed.
#[async_trait]
pub trait Executor: Send + Sync {
    fn tier(&self) -> ExecutionTier;

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Number of executions currently in flight, shared by whoever holds a clone.
#[derive(Debug, Clone, Default)]
pub struct ActiveExecutions {
    count: Arc<AtomicUsize>,
}

impl ActiveExecutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Counts one execution until the returned guard is dropped.
    pub fn track(&self) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            count: Arc::clone(&self.count),
        }
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}
