/// Managed server process: spawn one child from the built artifact, forward its
/// output, request termination, and report its natural exit.
use crate::config::ServerConfig;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Placeholder replaced with the artifact path in the server command line.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// Natural exit of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub generation: u64,
    pub pid: u32,
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
}

/// Errors that can occur when starting the server.
#[derive(Debug)]
pub enum ProcessError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to spawn server {program:?}: {source}")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
        }
    }
}

/// A running child the coordinator can ask to stop.
pub trait Supervised {
    /// Request termination without waiting. Must be a no-op once the child is gone.
    fn terminate(&mut self);

    fn id(&self) -> Option<u32>;
}

/// Starts a new server process for a freshly built artifact.
pub trait Launch {
    type Process: Supervised;

    fn launch(&mut self, artifact: &Path, generation: u64) -> Result<Self::Process, ProcessError>;
}

/// Build the server command line, replacing `{artifact}` placeholders.
fn build_command_line(server: &ServerConfig, artifact: &Path) -> (String, Vec<String>) {
    let artifact = artifact.to_string_lossy();
    let program = server.command.replace(ARTIFACT_PLACEHOLDER, &artifact);
    let args = server
        .args
        .iter()
        .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, &artifact))
        .collect();
    (program, args)
}

/// One spawned server child.
///
/// The child is shared with its exit watcher. Both sides only reap or signal
/// it while holding the lock, so a signal is never aimed at a pid that has
/// already been reaped and possibly reused.
#[derive(Debug)]
pub struct ManagedProcess {
    pid: Option<u32>,
    generation: u64,
    exited: Arc<AtomicBool>,
    child: Arc<Mutex<Child>>,
}

impl ManagedProcess {
    /// Spawn the server for `artifact` and start observing its exit, forwarding
    /// its output to our own stdout and stderr.
    ///
    /// The child is spawned in its own process group (via `process_group(0)`)
    /// so termination reaches anything it forks. Must be called within a
    /// tokio runtime.
    pub fn start(
        server: &ServerConfig,
        artifact: &Path,
        generation: u64,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<Self, ProcessError> {
        Self::start_with_output(
            server,
            artifact,
            generation,
            exits,
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
    }

    /// Like [`ManagedProcess::start`], with the writers that receive the
    /// child's stdout and stderr when `redirect_output` is set.
    pub fn start_with_output<O, E>(
        server: &ServerConfig,
        artifact: &Path,
        generation: u64,
        exits: mpsc::UnboundedSender<ProcessExit>,
        stdout: O,
        stderr: E,
    ) -> Result<Self, ProcessError>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let (program, args) = build_command_line(server, artifact);
        tracing::debug!(program = %program, args = ?args, generation, "spawning server");

        let output = || {
            if server.redirect_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        // Registered before the spawn so an immediate exit is not missed.
        let mut sigchld = signal(SignalKind::child()).map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let pid = child.id();
        tracing::info!(pid = ?pid, generation, "server started");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward(out, stdout));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward(err, stderr));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let child = Arc::new(Mutex::new(child));
        let watched = Arc::clone(&child);
        tokio::spawn(async move {
            let status = loop {
                let polled = lock(&watched).try_wait();
                match polled {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
                if sigchld.recv().await.is_none() {
                    break Err(std::io::Error::other("SIGCHLD stream closed"));
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, generation, "failed to wait for server");
                    None
                }
            };
            flag.store(true, Ordering::SeqCst);
            tracing::debug!(pid = ?pid, generation, code = ?code, "server exited");
            let _ = exits.send(ProcessExit {
                generation,
                pid: pid.unwrap_or(0),
                code,
            });
        });

        Ok(Self {
            pid,
            generation,
            exited,
            child,
        })
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl Supervised for ManagedProcess {
    /// SIGTERM the child's process group unless it has already exited.
    fn terminate(&mut self) {
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, generation = self.generation, "server already exited");
            return;
        }
        signal_if_running(&mut lock(&self.child), self.generation);
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

fn lock(child: &Mutex<Child>) -> std::sync::MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send SIGTERM to the child's process group, falling back to the pid alone.
///
/// Returns whether a signal was sent. An exited child is reaped here instead,
/// so its pid cannot be reused between the check and the signal.
fn signal_if_running(child: &mut Child, generation: u64) -> bool {
    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(_)) => {
            tracing::debug!(generation, "server exited before termination request");
            return false;
        }
        Err(e) => {
            tracing::warn!(generation, error = %e, "failed to poll server status");
            return false;
        }
    }
    let Some(pid) = child.id() else {
        return false;
    };

    let target = Pid::from_raw(pid as i32);
    match killpg(target, Signal::SIGTERM) {
        Ok(()) => {
            tracing::debug!(pid, generation, "sent SIGTERM to server");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to signal process group, trying process only");
            match kill(target, Signal::SIGTERM) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to send SIGTERM to server");
                    false
                }
            }
        }
    }
}

/// Copy a child stream into one of our own until EOF.
async fn forward<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        tracing::debug!(error = %e, "stopped forwarding server output");
    }
}

/// Real launcher used by the runner.
pub struct ProcessLauncher {
    server: ServerConfig,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessLauncher {
    pub fn new(server: ServerConfig, exits: mpsc::UnboundedSender<ProcessExit>) -> Self {
        Self { server, exits }
    }
}

impl Launch for ProcessLauncher {
    type Process = ManagedProcess;

    fn launch(&mut self, artifact: &Path, generation: u64) -> Result<ManagedProcess, ProcessError> {
        ManagedProcess::start(&self.server, artifact, generation, self.exits.clone())
    }
}

/// Resolve the artifact to an absolute path so the server sees the same file
/// regardless of its working directory.
pub fn resolve_artifact(outfile: &Path) -> PathBuf {
    crate::config::absolute(outfile)
}
