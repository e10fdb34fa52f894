//! Cooperative cancellation.
//!
//! A [`CancelToken`] is observable two ways: polled as a flag from blocking
//! code (probers check it between I/O phases) and selected on as a channel
//! from the scheduler (`recv` on [`CancelToken::receiver`] completes once the
//! token is cancelled, because cancelling drops the channel's only sender).
//! All clones share one state; cancelling any clone cancels them all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Shared cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(Mutex::new(Some(tx))),
            receiver: rx,
        }
    }

    /// Cancel. Idempotent; wakes every `select!` waiting on the receiver.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the only sender closes the channel, so pending and future
        // recv() calls return immediately.
        self.sender.lock().take();
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Channel view of the token, for use in `crossbeam_channel::select!`.
    /// `recv` on it only completes (with `Err`) after cancellation.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Cancel this token after `delay`, from a background thread. The timer
    /// keeps running even if the work finishes first; cancelling an already
    /// finished run is a no-op.
    pub fn cancel_after(&self, delay: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            token.cancel();
        });
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(t.receiver().try_recv().is_err_and(|e| e.is_empty()));
    }

    #[test]
    fn cancel_is_visible_to_all_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        c.cancel();
        assert!(t.is_cancelled());
        assert!(c.is_cancelled());
        // Channel is closed: recv completes immediately.
        assert!(t.receiver().recv().is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let t = CancelToken::new();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn cancel_after_fires() {
        let t = CancelToken::new();
        t.cancel_after(Duration::from_millis(20));
        assert!(t.receiver().recv_timeout(Duration::from_secs(2)).is_err());
        assert!(t.is_cancelled());
    }
}
