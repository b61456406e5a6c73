//! cooperative cancellation shared between a caller and long running operations.
//!
//! The token is a channel that never carries a message; cancelling closes it, which
//! wakes every pending `cancelled()` future at once.
use async_channel::{bounded, Receiver, Sender};

use crate::error::CacheError;

#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new()
    }
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        let (tx, rx) = bounded(1);
        CancellationToken { tx, rx }
    }

    /// cancel this token and all of its clones; returns false if already cancelled
    pub fn cancel(&self) -> bool {
        self.tx.close()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_closed()
    }

    /// resolves once the token is cancelled
    pub async fn cancelled(&self) {
        // nothing is ever sent, so recv only returns when the channel closes
        while self.rx.recv().await.is_ok() {}
    }

    /// fail fast with `CacheError::Cancelled` if the token has fired
    pub fn check(&self) -> Result<(), CacheError> {
        if self.is_cancelled() {
            Err(CacheError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(clone.check().is_ok());

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(CacheError::Cancelled)));
    }

    #[test]
    fn cancelled_wakes_waiters() {
        async_std::task::block_on(async move {
            let token = CancellationToken::new();
            let waiter = token.clone();
            let task = async_std::task::spawn(async move {
                waiter.cancelled().await;
                true
            });

            token.cancel();
            assert!(task.await);
        });
    }
}
