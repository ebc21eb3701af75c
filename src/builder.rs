/// Build step: run the configured build command and turn its result into a
/// [`BuildOutcome`].
use crate::config::BuildConfig;
use crate::coordinator::BuildOutcome;
use crate::diagnostic::{self, Diagnostic};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::process::Command;

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("build command exited with code {code}"),
        None => "build command was terminated by a signal".to_string(),
    }
}

/// Run one build. Never fails: every problem becomes a failed outcome.
pub async fn run_build(build: &BuildConfig) -> BuildOutcome {
    tracing::debug!(command = %build.command, args = ?build.args, "running build");
    let start = Instant::now();

    let output = match Command::new(&build.command)
        .args(&build.args)
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            return BuildOutcome::failure(vec![Diagnostic::message(format!(
                "failed to run build command {:?}: {e}",
                build.command
            ))]);
        }
    };

    tracing::debug!(
        exit_code = ?output.status.code(),
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "build command finished"
    );

    if !output.status.success() {
        let mut diagnostics = diagnostic::parse(&String::from_utf8_lossy(&output.stderr));
        diagnostics.extend(diagnostic::parse(&String::from_utf8_lossy(&output.stdout)));
        if diagnostics.is_empty() {
            diagnostics.push(Diagnostic::message(describe_status(output.status)));
        }
        return BuildOutcome::failure(diagnostics);
    }

    if let Some(outfile) = &build.outfile {
        if !outfile.exists() {
            return BuildOutcome::failure(vec![Diagnostic::message(format!(
                "build succeeded but did not produce {}",
                outfile.display()
            ))]);
        }
    }

    BuildOutcome::Success
}
