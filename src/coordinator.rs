/// Rebuild coordinator: ties the build lifecycle to the single server process.
///
/// - Build started: ask the running server to stop, start the build timer.
/// - Build succeeded: report the duration, spawn the next server generation.
/// - Build failed: report diagnostics and duration, spawn nothing.
/// - Shutdown signal (first one only): uninstall the signal listener, ask the
///   server to stop, and tell the caller whether to exit.
///
/// Termination is fire-and-forget. A superseded server may still be shutting
/// down when the next generation starts; that window is accepted.
use crate::config::{ConfigError, RelaunchConfig};
use crate::diagnostic::Diagnostic;
use crate::process::{Launch, ProcessError, ProcessExit, Supervised};
use crate::signals::{ShutdownSignal, SignalRegistration};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Result of one build cycle, consumed immediately by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    Failure { diagnostics: Vec<Diagnostic> },
}

impl BuildOutcome {
    pub fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        BuildOutcome::Failure { diagnostics }
    }
}

/// Observer hooks. Every hook is optional; absent hooks are skipped.
#[derive(Default)]
pub struct RebuildCallbacks {
    pub on_rebuild_start: Option<Box<dyn FnMut() + Send>>,
    /// Called with the elapsed milliseconds of a successful build.
    pub on_rebuild_end: Option<Box<dyn FnMut(u64) + Send>>,
    /// Called with the diagnostics and elapsed milliseconds of a failed build.
    pub on_rebuild_failed: Option<Box<dyn FnMut(&[Diagnostic], u64) + Send>>,
    pub on_server_start: Option<Box<dyn FnMut() + Send>>,
    /// Called with the exit code (None if killed by signal) of any server.
    pub on_server_closed: Option<Box<dyn FnMut(Option<i32>) + Send>>,
}

impl fmt::Debug for RebuildCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebuildCallbacks")
            .field("on_rebuild_start", &self.on_rebuild_start.is_some())
            .field("on_rebuild_end", &self.on_rebuild_end.is_some())
            .field("on_rebuild_failed", &self.on_rebuild_failed.is_some())
            .field("on_server_start", &self.on_server_start.is_some())
            .field("on_server_closed", &self.on_server_closed.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub outfile: Option<PathBuf>,
    pub exit_on_signal: bool,
}

impl CoordinatorOptions {
    pub fn from_config(config: &RelaunchConfig) -> Self {
        Self {
            outfile: config.build.outfile.clone(),
            exit_on_signal: config.shutdown.exit_on_signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Building,
    /// Terminal: a shutdown signal was handled.
    Terminating,
}

/// What the caller must do after a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// End the supervising process with a success status.
    ExitSupervisor,
    /// Keep the supervising process alive; the coordinator is now inert.
    Remain,
    /// A previous signal already ran the teardown.
    AlreadyHandled,
}

struct Running<P> {
    generation: u64,
    process: P,
    terminate_requested: bool,
}

impl<P: Supervised> Running<P> {
    fn terminate(&mut self) {
        tracing::debug!(
            generation = self.generation,
            pid = ?self.process.id(),
            repeated = self.terminate_requested,
            "requesting server termination"
        );
        self.process.terminate();
        self.terminate_requested = true;
    }
}

pub struct Coordinator<L: Launch> {
    artifact: PathBuf,
    exit_on_signal: bool,
    callbacks: RebuildCallbacks,
    launcher: L,
    registration: Option<Box<dyn SignalRegistration>>,
    phase: Phase,
    build_started_at: Option<Instant>,
    generation: u64,
    current: Option<Running<L::Process>>,
}

impl<L: Launch> Coordinator<L> {
    /// Build a coordinator that owns `registration` until the first shutdown signal.
    ///
    /// Fails if no single output artifact is configured.
    pub fn new(
        options: CoordinatorOptions,
        callbacks: RebuildCallbacks,
        launcher: L,
        registration: Box<dyn SignalRegistration>,
    ) -> Result<Self, ConfigError> {
        let artifact = options.outfile.ok_or(ConfigError::MissingOutfile)?;
        Ok(Self {
            artifact,
            exit_on_signal: options.exit_on_signal,
            callbacks,
            launcher,
            registration: Some(registration),
            phase: Phase::Idle,
            build_started_at: None,
            generation: 0,
            current: None,
        })
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Generation of the server currently in the slot, if any.
    pub fn current_generation(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.generation)
    }

    pub fn build_started(&mut self) {
        match self.phase {
            Phase::Terminating => {
                tracing::debug!("ignoring build start after shutdown");
                return;
            }
            Phase::Building => {
                // Open question: the earlier start is dropped, so the next
                // reported duration only covers this start.
                tracing::warn!("build started before the previous build finished; resetting build timer");
            }
            Phase::Idle => {}
        }

        if let Some(current) = self.current.as_mut() {
            current.terminate();
        }

        self.phase = Phase::Building;
        self.build_started_at = Some(Instant::now());

        if let Some(cb) = self.callbacks.on_rebuild_start.as_mut() {
            cb();
        }
    }

    /// Finish the build cycle. A successful build spawns the next server; a
    /// spawn failure is returned to the caller and not retried.
    pub fn build_finished(&mut self, outcome: BuildOutcome) -> Result<(), ProcessError> {
        if self.phase == Phase::Terminating {
            tracing::debug!("ignoring build result after shutdown");
            return Ok(());
        }

        let elapsed_ms = match self.build_started_at.take() {
            Some(started) => started.elapsed().as_millis() as u64,
            None => {
                tracing::warn!("build finished without a matching start");
                0
            }
        };
        self.phase = Phase::Idle;

        match outcome {
            BuildOutcome::Failure { diagnostics } => {
                tracing::info!(elapsed_ms, errors = diagnostics.len(), "build failed");
                if let Some(cb) = self.callbacks.on_rebuild_failed.as_mut() {
                    cb(&diagnostics, elapsed_ms);
                }
                Ok(())
            }
            BuildOutcome::Success => {
                tracing::info!(elapsed_ms, "build succeeded");
                if let Some(cb) = self.callbacks.on_rebuild_end.as_mut() {
                    cb(elapsed_ms);
                }
                self.spawn_next()
            }
        }
    }

    fn spawn_next(&mut self) -> Result<(), ProcessError> {
        if let Some(previous) = self.current.as_mut() {
            if !previous.terminate_requested {
                previous.terminate();
            }
        }

        self.generation += 1;
        let generation = self.generation;
        let process = self.launcher.launch(&self.artifact, generation)?;
        tracing::debug!(generation, pid = ?process.id(), "server generation started");

        // Replacing the handle does not wait; the old wait task still reports its exit.
        self.current = Some(Running {
            generation,
            process,
            terminate_requested: false,
        });

        if let Some(cb) = self.callbacks.on_server_start.as_mut() {
            cb();
        }
        Ok(())
    }

    /// Observe a server's natural exit. Never triggers a build or a spawn.
    pub fn process_exited(&mut self, exit: ProcessExit) {
        let is_current = self.current_generation() == Some(exit.generation);
        if is_current {
            self.current = None;
        }
        tracing::debug!(
            generation = exit.generation,
            pid = exit.pid,
            code = ?exit.code,
            superseded = !is_current,
            "server closed"
        );
        if let Some(cb) = self.callbacks.on_server_closed.as_mut() {
            cb(exit.code);
        }
    }

    /// Handle a termination signal. Only the first call tears anything down.
    pub fn shutdown(&mut self, signal: ShutdownSignal) -> ShutdownAction {
        let Some(mut registration) = self.registration.take() else {
            tracing::debug!(%signal, "shutdown already handled");
            return ShutdownAction::AlreadyHandled;
        };
        registration.uninstall();
        self.phase = Phase::Terminating;
        tracing::info!(%signal, "shutting down");

        if let Some(current) = self.current.as_mut() {
            current.terminate();
        }

        if self.exit_on_signal {
            ShutdownAction::ExitSupervisor
        } else {
            ShutdownAction::Remain
        }
    }
}

impl<L: Launch> Drop for Coordinator<L> {
    fn drop(&mut self) {
        if let Some(current) = self.current.as_mut() {
            if !current.terminate_requested {
                current.terminate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Spawn { generation: u64, artifact: PathBuf },
        Terminate { generation: u64 },
        Uninstall,
        RebuildStart,
        RebuildEnd(u64),
        RebuildFailed(Vec<Diagnostic>),
        ServerStart,
        ServerClosed(Option<i32>),
    }

    type Log = Arc<Mutex<Vec<Op>>>;

    struct FakeProcess {
        generation: u64,
        log: Log,
    }

    impl Supervised for FakeProcess {
        fn terminate(&mut self) {
            self.log.lock().unwrap().push(Op::Terminate {
                generation: self.generation,
            });
        }

        fn id(&self) -> Option<u32> {
            Some(1000 + self.generation as u32)
        }
    }

    struct FakeLauncher {
        log: Log,
        fail: bool,
    }

    impl Launch for FakeLauncher {
        type Process = FakeProcess;

        fn launch(&mut self, artifact: &Path, generation: u64) -> Result<FakeProcess, ProcessError> {
            if self.fail {
                return Err(ProcessError::Spawn {
                    program: artifact.display().to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            self.log.lock().unwrap().push(Op::Spawn {
                generation,
                artifact: artifact.to_path_buf(),
            });
            Ok(FakeProcess {
                generation,
                log: Arc::clone(&self.log),
            })
        }
    }

    struct FakeRegistration {
        log: Log,
    }

    impl SignalRegistration for FakeRegistration {
        fn uninstall(&mut self) -> bool {
            self.log.lock().unwrap().push(Op::Uninstall);
            true
        }
    }

    fn recording_callbacks(log: &Log) -> RebuildCallbacks {
        let (l1, l2, l3, l4, l5) = (
            Arc::clone(log),
            Arc::clone(log),
            Arc::clone(log),
            Arc::clone(log),
            Arc::clone(log),
        );
        RebuildCallbacks {
            on_rebuild_start: Some(Box::new(move || l1.lock().unwrap().push(Op::RebuildStart))),
            on_rebuild_end: Some(Box::new(move |ms| l2.lock().unwrap().push(Op::RebuildEnd(ms)))),
            on_rebuild_failed: Some(Box::new(move |d: &[Diagnostic], _ms: u64| {
                l3.lock().unwrap().push(Op::RebuildFailed(d.to_vec()))
            })),
            on_server_start: Some(Box::new(move || l4.lock().unwrap().push(Op::ServerStart))),
            on_server_closed: Some(Box::new(move |code| {
                l5.lock().unwrap().push(Op::ServerClosed(code))
            })),
        }
    }

    fn options(exit_on_signal: bool) -> CoordinatorOptions {
        CoordinatorOptions {
            outfile: Some(PathBuf::from("/out/app.js")),
            exit_on_signal,
        }
    }

    fn coordinator(exit_on_signal: bool) -> (Coordinator<FakeLauncher>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Coordinator::new(
            options(exit_on_signal),
            recording_callbacks(&log),
            FakeLauncher {
                log: Arc::clone(&log),
                fail: false,
            },
            Box::new(FakeRegistration {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
        (coordinator, log)
    }

    fn take(log: &Log) -> Vec<Op> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    /// Replace measured durations so sequences can be compared exactly.
    fn without_durations(ops: Vec<Op>) -> Vec<Op> {
        ops.into_iter()
            .map(|op| match op {
                Op::RebuildEnd(_) => Op::RebuildEnd(0),
                other => other,
            })
            .collect()
    }

    #[test]
    fn test_missing_outfile_is_config_error() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let result = Coordinator::new(
            CoordinatorOptions {
                outfile: None,
                exit_on_signal: true,
            },
            recording_callbacks(&log),
            FakeLauncher {
                log: Arc::clone(&log),
                fail: false,
            },
            Box::new(FakeRegistration {
                log: Arc::clone(&log),
            }),
        );
        assert!(matches!(result, Err(ConfigError::MissingOutfile)));
        assert!(take(&log).is_empty());
    }

    #[test]
    fn test_successful_build_spawns_server() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        assert_eq!(c.phase(), Phase::Building);
        c.build_finished(BuildOutcome::Success).unwrap();
        assert_eq!(c.phase(), Phase::Idle);
        assert_eq!(c.current_generation(), Some(1));

        assert_eq!(
            without_durations(take(&log)),
            vec![
                Op::RebuildStart,
                Op::RebuildEnd(0),
                Op::Spawn {
                    generation: 1,
                    artifact: PathBuf::from("/out/app.js"),
                },
                Op::ServerStart,
            ]
        );
    }

    #[test]
    fn test_failed_build_reports_diagnostics_and_spawns_nothing() {
        let (mut c, log) = coordinator(true);
        let diagnostics = vec![Diagnostic::message("e1"), Diagnostic::message("e2")];
        c.build_started();
        c.build_finished(BuildOutcome::failure(diagnostics.clone()))
            .unwrap();

        assert_eq!(
            take(&log),
            vec![Op::RebuildStart, Op::RebuildFailed(diagnostics)]
        );
        assert_eq!(c.current_generation(), None);
        assert_eq!(c.phase(), Phase::Idle);
    }

    #[test]
    fn test_next_build_start_terminates_previous_server_without_waiting() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        c.build_started();
        assert_eq!(
            take(&log),
            vec![Op::Terminate { generation: 1 }, Op::RebuildStart]
        );
        // P1 has not reported an exit, and the slot still holds it.
        assert_eq!(c.current_generation(), Some(1));
    }

    #[test]
    fn test_replacement_does_not_terminate_twice() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();

        let terminations: Vec<_> = take(&log)
            .into_iter()
            .filter(|op| matches!(op, Op::Terminate { .. }))
            .collect();
        assert_eq!(terminations, vec![Op::Terminate { generation: 1 }]);
        assert_eq!(c.current_generation(), Some(2));
    }

    #[test]
    fn test_success_without_start_still_terminates_previous() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        c.build_finished(BuildOutcome::Success).unwrap();
        assert_eq!(
            take(&log),
            vec![
                Op::RebuildEnd(0),
                Op::Terminate { generation: 1 },
                Op::Spawn {
                    generation: 2,
                    artifact: PathBuf::from("/out/app.js"),
                },
                Op::ServerStart,
            ]
        );
    }

    #[test]
    fn test_reentrant_build_start_reissues_termination() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        c.build_started();
        c.build_started();
        assert_eq!(c.phase(), Phase::Building);
        assert_eq!(
            take(&log),
            vec![
                Op::Terminate { generation: 1 },
                Op::RebuildStart,
                Op::Terminate { generation: 1 },
                Op::RebuildStart,
            ]
        );
    }

    #[test]
    fn test_elapsed_time_measured_from_build_start() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        std::thread::sleep(Duration::from_millis(20));
        c.build_finished(BuildOutcome::Success).unwrap();

        let ends: Vec<u64> = take(&log)
            .into_iter()
            .filter_map(|op| match op {
                Op::RebuildEnd(ms) => Some(ms),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 1);
        assert!(ends[0] >= 20);
        assert!(ends[0] < 5_000);
    }

    #[test]
    fn test_reentrant_start_resets_timer_baseline() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        std::thread::sleep(Duration::from_millis(150));
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();

        let end = take(&log)
            .into_iter()
            .find_map(|op| match op {
                Op::RebuildEnd(ms) => Some(ms),
                _ => None,
            })
            .unwrap();
        assert!(end < 150);
    }

    #[test]
    fn test_natural_exit_is_observational_only() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        c.process_exited(ProcessExit {
            generation: 1,
            pid: 1001,
            code: Some(1),
        });
        assert_eq!(take(&log), vec![Op::ServerClosed(Some(1))]);
        assert_eq!(c.current_generation(), None);
        assert_eq!(c.phase(), Phase::Idle);
    }

    #[test]
    fn test_late_exit_of_superseded_generation_keeps_current() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        c.process_exited(ProcessExit {
            generation: 1,
            pid: 1001,
            code: None,
        });
        assert_eq!(take(&log), vec![Op::ServerClosed(None)]);
        assert_eq!(c.current_generation(), Some(2));
    }

    #[test]
    fn test_spawn_failure_is_returned() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut c = Coordinator::new(
            options(true),
            recording_callbacks(&log),
            FakeLauncher {
                log: Arc::clone(&log),
                fail: true,
            },
            Box::new(FakeRegistration {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();

        c.build_started();
        let err = c.build_finished(BuildOutcome::Success).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(c.current_generation(), None);
        assert!(!take(&log).contains(&Op::ServerStart));
    }

    #[test]
    fn test_shutdown_runs_teardown_once() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        assert_eq!(
            c.shutdown(ShutdownSignal::Interrupt),
            ShutdownAction::ExitSupervisor
        );
        assert_eq!(
            c.shutdown(ShutdownSignal::Interrupt),
            ShutdownAction::AlreadyHandled
        );
        assert_eq!(
            c.shutdown(ShutdownSignal::Hangup),
            ShutdownAction::AlreadyHandled
        );
        assert_eq!(c.phase(), Phase::Terminating);
        assert_eq!(
            take(&log),
            vec![Op::Uninstall, Op::Terminate { generation: 1 }]
        );
    }

    #[test]
    fn test_shutdown_without_exit_keeps_supervisor_but_stops_child() {
        let (mut c, log) = coordinator(false);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        assert_eq!(c.shutdown(ShutdownSignal::Terminate), ShutdownAction::Remain);
        assert_eq!(
            take(&log),
            vec![Op::Uninstall, Op::Terminate { generation: 1 }]
        );
    }

    #[test]
    fn test_shutdown_without_server() {
        let (mut c, log) = coordinator(true);
        assert_eq!(
            c.shutdown(ShutdownSignal::Hangup),
            ShutdownAction::ExitSupervisor
        );
        assert_eq!(take(&log), vec![Op::Uninstall]);
    }

    #[test]
    fn test_inert_after_shutdown() {
        let (mut c, log) = coordinator(false);
        c.shutdown(ShutdownSignal::Interrupt);
        take(&log);

        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        assert!(take(&log).is_empty());
        assert_eq!(c.phase(), Phase::Terminating);
    }

    #[test]
    fn test_drop_terminates_running_server() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        take(&log);

        drop(c);
        assert_eq!(take(&log), vec![Op::Terminate { generation: 1 }]);
    }

    #[test]
    fn test_drop_after_shutdown_does_not_terminate_again() {
        let (mut c, log) = coordinator(true);
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        c.shutdown(ShutdownSignal::Interrupt);
        take(&log);

        drop(c);
        assert!(take(&log).is_empty());
    }

    #[test]
    fn test_callbacks_are_optional() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut c = Coordinator::new(
            options(true),
            RebuildCallbacks::default(),
            FakeLauncher {
                log: Arc::clone(&log),
                fail: false,
            },
            Box::new(FakeRegistration {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
        c.build_started();
        c.build_finished(BuildOutcome::failure(vec![Diagnostic::message("x")]))
            .unwrap();
        c.build_started();
        c.build_finished(BuildOutcome::Success).unwrap();
        c.process_exited(ProcessExit {
            generation: 1,
            pid: 1,
            code: Some(0),
        });
        assert_eq!(
            take(&log),
            vec![Op::Spawn {
                generation: 1,
                artifact: PathBuf::from("/out/app.js"),
            }]
        );
    }

    #[derive(Debug, Clone)]
    enum Event {
        Start,
        Success,
        Failure,
        ExitCurrent,
    }

    fn event_strategy() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Start),
            Just(Event::Success),
            Just(Event::Failure),
            Just(Event::ExitCurrent),
        ]
    }

    proptest! {
        /// Every spawn happens only after all earlier servers were asked to stop or exited.
        #[test]
        fn prop_at_most_one_active_server(events in prop::collection::vec(event_strategy(), 0..40)) {
            let (mut c, log) = coordinator(true);
            let mut exits = Vec::new();
            for event in &events {
                match event {
                    Event::Start => c.build_started(),
                    Event::Success => c.build_finished(BuildOutcome::Success).unwrap(),
                    Event::Failure => c.build_finished(BuildOutcome::failure(Vec::new())).unwrap(),
                    Event::ExitCurrent => {
                        if let Some(generation) = c.current_generation() {
                            // Mark the exit in the log so it is ordered with the other ops.
                            exits.push(generation);
                            log.lock().unwrap().push(Op::ServerClosed(Some(generation as i32)));
                            c.process_exited(ProcessExit { generation, pid: 0, code: Some(0) });
                        }
                    }
                }
            }

            let mut active: Vec<u64> = Vec::new();
            for op in take(&log) {
                match op {
                    Op::Spawn { generation, .. } => {
                        prop_assert!(active.is_empty(), "spawned {} while {:?} still active", generation, active);
                        active.push(generation);
                    }
                    Op::Terminate { generation } => active.retain(|g| *g != generation),
                    // Only the markers pushed above carry a generation.
                    Op::ServerClosed(Some(marker)) if exits.contains(&(marker as u64)) => {
                        active.retain(|g| *g != marker as u64)
                    }
                    _ => {}
                }
            }
            prop_assert!(active.len() <= 1);
        }
    }
}
