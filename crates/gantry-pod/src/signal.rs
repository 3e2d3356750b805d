//! Caller-owned termination signal plumbing.
//!
//! Installing process-wide signal handlers inside a library runner would
//! fight the embedding application, so the runners take an explicit
//! `TerminationStream` instead: the caller decides whether POSIX signals
//! feed it, some other channel does, or nothing at all.

use std::future::pending;

use tokio::sync::mpsc;
use tracing::info;

/// A stream of termination requests. Runners race pod completion
/// against it; a received value maps to orderly teardown.
pub struct TerminationStream {
    rx: Option<mpsc::Receiver<&'static str>>,
}

impl TerminationStream {
    /// Install handlers for SIGINT, SIGTERM, SIGUSR1, and SIGUSR2 and
    /// feed the first one received into the stream.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, rx) = mpsc::channel(1);
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = usr1.recv() => "SIGUSR1",
                _ = usr2.recv() => "SIGUSR2",
            };
            info!(signal = name, "termination signal received");
            let _ = tx.send(name).await;
        });

        Ok(Self { rx: Some(rx) })
    }

    /// A stream that never fires; termination is cancellation-only.
    pub fn disabled() -> Self {
        Self { rx: None }
    }

    /// Adapt an external channel, e.g. an application-level shutdown
    /// broadcast or a test harness.
    pub fn external(rx: mpsc::Receiver<&'static str>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Wait for a termination request. Pends forever when the stream is
    /// disabled or its sender is gone.
    pub async fn recv(&mut self) -> &'static str {
        match self.rx.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(name) => name,
                None => pending().await,
            },
            None => pending().await,
        }
    }
}
