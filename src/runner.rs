/// Main loop: watch sources, run builds, and hand every event to the
/// coordinator one at a time.
///
/// Builds, child waits, the watcher and the signal listener run as their own
/// tasks and only talk to this loop through channels, so each coordinator
/// transition runs to completion before the next event is looked at.
use crate::builder;
use crate::config::{BuildConfig, ConfigError, RelaunchConfig};
use crate::coordinator::{
    BuildOutcome, Coordinator, CoordinatorOptions, RebuildCallbacks, ShutdownAction,
};
use crate::process::{resolve_artifact, Launch, ProcessLauncher};
use crate::signals::{ShutdownListener, ShutdownSignal, SignalRegistration};
use crate::watch::{WatchError, Watcher};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    /// Failed to install the shutdown signal listener.
    Signals(std::io::Error),
    Watch(WatchError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "configuration error: {e}"),
            RunError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
            RunError::Watch(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Config(e) => Some(e),
            RunError::Signals(e) => Some(e),
            RunError::Watch(e) => Some(e),
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        RunError::Config(e)
    }
}

/// Run until a shutdown signal asks the supervisor to exit.
///
/// With `shutdown.exit_on_signal = false` this only returns on error: after
/// the first signal the server is stopped, nothing is rebuilt, and the
/// default signal actions are back in place.
pub async fn run(config: RelaunchConfig, callbacks: RebuildCallbacks) -> Result<(), RunError> {
    config.validate()?;
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let listener = ShutdownListener::install(signal_tx).map_err(RunError::Signals)?;
    drive(config, callbacks, Box::new(listener), signal_rx).await
}

fn start_build<L: Launch>(
    coordinator: &mut Coordinator<L>,
    build: &BuildConfig,
    tx: &mpsc::UnboundedSender<BuildOutcome>,
) {
    coordinator.build_started();
    let build = build.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let outcome = builder::run_build(&build).await;
        let _ = tx.send(outcome);
    });
}

async fn drive(
    config: RelaunchConfig,
    callbacks: RebuildCallbacks,
    registration: Box<dyn SignalRegistration>,
    mut signals: mpsc::UnboundedReceiver<ShutdownSignal>,
) -> Result<(), RunError> {
    let (exit_tx, mut exits) = mpsc::unbounded_channel();
    let (build_tx, mut builds) = mpsc::unbounded_channel();
    let (change_tx, mut changes) = mpsc::unbounded_channel();

    let mut options = CoordinatorOptions::from_config(&config);
    options.outfile = options.outfile.as_deref().map(resolve_artifact);
    let launcher = ProcessLauncher::new(config.server.clone(), exit_tx);
    let mut coordinator = Coordinator::new(options, callbacks, launcher, registration)?;

    let watcher = Watcher::new(&config.watch, config.build.outfile.as_deref())
        .map_err(|e| RunError::Watch(e.into()))?;
    let mut watch_handle = if watcher.is_enabled() {
        Some(watcher.spawn(change_tx.clone()).map_err(RunError::Watch)?)
    } else {
        tracing::info!("no watch paths configured, building once");
        None
    };

    let mut building = true;
    let mut pending = false;
    let mut terminating = false;
    start_build(&mut coordinator, &config.build, &build_tx);

    loop {
        tokio::select! {
            Some(changed) = changes.recv(), if !terminating => {
                tracing::info!(files = changed.len(), "sources changed");
                tracing::debug!(changed = ?changed, "changed paths");
                if building {
                    pending = true;
                } else {
                    start_build(&mut coordinator, &config.build, &build_tx);
                    building = true;
                }
            }
            Some(outcome) = builds.recv() => {
                building = false;
                if let Err(e) = coordinator.build_finished(outcome) {
                    tracing::error!(error = %e, "server did not start; waiting for the next build");
                }
                if pending && !terminating {
                    pending = false;
                    start_build(&mut coordinator, &config.build, &build_tx);
                    building = true;
                }
            }
            Some(exit) = exits.recv() => coordinator.process_exited(exit),
            Some(signal) = signals.recv() => match coordinator.shutdown(signal) {
                ShutdownAction::ExitSupervisor => {
                    drop(watch_handle.take());
                    return Ok(());
                }
                ShutdownAction::Remain => {
                    terminating = true;
                    pending = false;
                    drop(watch_handle.take());
                    tracing::info!("server stopped; supervisor stays up without rebuilding");
                }
                ShutdownAction::AlreadyHandled => {}
            },
        }
    }
}
