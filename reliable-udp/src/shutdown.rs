//! Broadcast stop signals.
//!
//! A [`StopHandle`] closes the signal for every [`StopListener`] derived from
//! it.  Endpoints hold two of them: a per-generation stop signal observed by
//! worker tasks (replaced on every recovery) and a process-level shutdown
//! signal driven by Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;

/// Owning side of a stop signal.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

/// Observing side of a stop signal.
#[derive(Debug, Clone)]
pub struct StopListener(watch::Receiver<bool>);

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    /// A fresh, open signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Close the signal.  Idempotent.
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener(self.0.subscribe())
    }
}

impl StopListener {
    /// Resolve once the signal is closed (or its handle is gone).
    ///
    /// Cancel-safe; meant to sit in a `tokio::select!` arm.
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Close `handle` when the process receives Ctrl-C.
pub fn stop_on_interrupt(handle: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl+C, shutting down...");
            handle.stop();
        }
    });
}
