//! The long-running loop that drives a `JobProcessor` at a fixed polling
//! interval, owning its own abort signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::processor::JobProcessor;

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub polling_interval_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            polling_interval_ms: 500,
        }
    }
}

/// Owns one polling loop over one `JobProcessor`. Many workers may target
/// the same queue; they are independent and share no state besides the
/// store.
pub struct Worker {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the loop. Runs until `stop` is called or the parent token
    /// (if any was composed into `token`) is cancelled.
    pub fn start(processor: Arc<JobProcessor>, options: WorkerOptions) -> Self {
        let token = CancelToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                if loop_token.is_cancelled() {
                    break;
                }
                match processor.run_once(&loop_token).await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "job processor cycle failed");
                    }
                }
                let sleep = tokio::time::sleep(Duration::from_millis(options.polling_interval_ms));
                tokio::select! {
                    _ = sleep => {}
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Signal abort and wait for the in-flight cycle to observe it.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
