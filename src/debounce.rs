//! Trailing-edge debouncer.
//!
//! Coalesces bursts of `trigger()` calls into at most one delayed
//! invocation of the callback. Both tunnel directions use one of these to
//! fold a flurry of received packets into a single drain of the reliable
//! endpoint's receive queue.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// A trailing-edge timer around an async callback.
///
/// Must be created inside a Tokio runtime; the worker task lives for as
/// long as the `Debouncer` itself.
pub struct Debouncer {
    tx: mpsc::Sender<()>,
}

impl Debouncer {
    /// Create a debouncer that waits `delay` after the first trigger of a
    /// burst, swallows the rest of the burst, then runs `callback` once.
    pub fn new<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(delay).await;
                loop {
                    match rx.try_recv() {
                        Ok(()) => continue,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                callback().await;
            }
        });
        Self { tx }
    }

    /// Request a callback invocation. Triggers that land while one is
    /// already pending are folded into it.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}
