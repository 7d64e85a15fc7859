// ABOUTME: One-shot completion signal for requests applied on the service executor
// ABOUTME: The signal always fires: dropping an unfulfilled completion delivers false

use tokio::sync::oneshot;

/// Producer half, owned by the executor while it applies a request
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<bool>>,
}

/// Consumer half, returned to the caller
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<bool>,
}

impl Completion {
    /// Create a linked completion pair
    pub fn channel() -> (Completion, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx: Some(tx) }, CompletionHandle { rx })
    }

    /// Deliver the outcome
    pub fn complete(mut self, value: bool) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(value);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

impl CompletionHandle {
    /// Block until the request was applied; false if it failed or was dropped
    ///
    /// Must not be called from inside an async runtime; use [`wait_async`](Self::wait_async).
    pub fn wait(self) -> bool {
        self.rx.blocking_recv().unwrap_or(false)
    }

    /// Await the outcome
    pub async fn wait_async(self) -> bool {
        self.rx.await.unwrap_or(false)
    }

    /// Outcome if it has already been delivered
    pub fn try_result(&mut self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(false),
        }
    }
}
