//! One-shot timers that post a message back into the driver queue.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A scheduled message. Dropping the timer cancels it.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn after<M: Send + 'static>(
        delay: Duration,
        sender: mpsc::UnboundedSender<M>,
        message: M,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(message);
        });
        Self { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
