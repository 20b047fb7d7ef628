//! Process termination handling
//!
//! A `watch` channel fans one stop request out to the health server and the
//! gauge refresher. `wait_for_signal` turns SIGTERM or SIGINT into that request.

use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// OS signal that ended the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Terminate => f.write_str("SIGTERM"),
            TerminationSignal::Interrupt => f.write_str("SIGINT"),
        }
    }
}

/// Receiving half, cloned into every background task
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once a stop was requested or the controller half is gone
    pub async fn wait(&mut self) {
        // Err means the sender was dropped, which also counts as stop
        let _ = self.receiver.wait_for(|stopping| *stopping).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending half, owned by `main`
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Request a stop; safe to call with no listeners left
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        info!(listeners = self.sender.receiver_count(), "Shutdown requested");
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Block until SIGTERM or SIGINT arrives
///
/// Fails only when the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<TerminationSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => TerminationSignal::Terminate,
        _ = sigint.recv() => TerminationSignal::Interrupt,
    };
    info!(signal = %received, "Termination signal received");
    Ok(received)
}

/// Block until Ctrl+C arrives
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<TerminationSignal> {
    tokio::signal::ctrl_c().await?;
    info!(signal = %TerminationSignal::Interrupt, "Termination signal received");
    Ok(TerminationSignal::Interrupt)
}
