//! Scan-wide cancellation signal.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable, one-way cancellation flag.
///
/// Every clone observes the same flag. Once cancelled it stays cancelled.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        CancelSignal {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the signal is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of this signal, so the only
        // way out of `wait_for` is the flag turning true.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
