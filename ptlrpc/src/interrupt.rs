use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal a caller can raise from another task.
///
/// Clones share the same flag. The call engine only listens for it while a
/// request is gated or after its timeout has fired.
#[derive(Debug, Clone)]
pub struct Interrupt {
    flag: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    /// Create an untriggered interrupt.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Raise the interrupt.
    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }

    /// Lower the interrupt.
    pub fn clear(&self) {
        self.flag.send_replace(false);
    }

    /// Whether the interrupt is raised.
    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolve once the interrupt is raised.
    pub async fn triggered(&self) {
        let mut rx = self.flag.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives in `self`, so this never closes.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_triggered_wakes_waiter() {
        let interrupt = Interrupt::new();
        let waiter = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move { interrupt.triggered().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        interrupt.trigger();
        waiter.await.expect("waiter should finish");
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn test_already_triggered_resolves_immediately() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        interrupt.triggered().await;
        interrupt.clear();
        assert!(!interrupt.is_triggered());
    }
}
