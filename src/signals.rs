/// Signal handling for shutdown.
///
/// Listens for SIGINT (Ctrl-C), SIGHUP and SIGTERM and forwards them to the
/// runner as [`ShutdownSignal`]s. The listener is an explicit handle: it is
/// installed once, and uninstalled once when the first signal is handled,
/// which restores the default disposition of every signal it listened for.
use nix::sys::signal::{self as nix_signal, SigHandler, Signal};
use std::fmt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Hangup,
    Terminate,
}

impl ShutdownSignal {
    pub const ALL: [ShutdownSignal; 3] = [
        ShutdownSignal::Interrupt,
        ShutdownSignal::Hangup,
        ShutdownSignal::Terminate,
    ];

    fn kind(self) -> SignalKind {
        match self {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
        }
    }

    fn as_nix(self) -> Signal {
        match self {
            ShutdownSignal::Interrupt => Signal::SIGINT,
            ShutdownSignal::Hangup => Signal::SIGHUP,
            ShutdownSignal::Terminate => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

/// Handle to the process-wide "we are listening for shutdown" state.
pub trait SignalRegistration {
    /// Stop listening. Returns false if already uninstalled.
    fn uninstall(&mut self) -> bool;
}

pub struct ShutdownListener {
    tasks: Vec<JoinHandle<()>>,
    installed: bool,
}

impl ShutdownListener {
    /// Start forwarding shutdown signals to `tx`. Must be called within a tokio runtime.
    pub fn install(tx: mpsc::UnboundedSender<ShutdownSignal>) -> std::io::Result<Self> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(ShutdownSignal::ALL.len());
        for sig in ShutdownSignal::ALL {
            let mut stream = match signal(sig.kind()) {
                Ok(stream) => stream,
                Err(e) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::debug!(signal = %sig, "received shutdown signal");
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            }));
        }
        tracing::debug!("shutdown signal listener installed");
        Ok(Self {
            tasks,
            installed: true,
        })
    }
}

impl SignalRegistration for ShutdownListener {
    fn uninstall(&mut self) -> bool {
        if !self.installed {
            return false;
        }
        self.installed = false;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        for sig in ShutdownSignal::ALL {
            // SAFETY: SigDfl installs no handler code, so nothing can run in
            // signal context afterwards.
            if let Err(e) = unsafe { nix_signal::signal(sig.as_nix(), SigHandler::SigDfl) } {
                tracing::warn!(signal = %sig, error = %e, "failed to restore default signal handler");
            }
        }
        tracing::debug!("shutdown signal listener uninstalled");
        true
    }
}

impl Drop for ShutdownListener {
    fn drop(&mut self) {
        self.uninstall();
    }
}
