/// Terminal reporter: the default rebuild callbacks.
///
/// Lines go to stderr so they never interleave with the server's forwarded
/// stdout on the same stream.
use crate::coordinator::RebuildCallbacks;
use crate::diagnostic::Diagnostic;

const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const YELLOW: &str = "\x1b[0;33m";
const NC: &str = "\x1b[0m";

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Format a build duration for humans: `850ms`, `1.25s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", ms as f64 / 1_000.0)
    }
}

pub fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(0) => "server exited cleanly".to_string(),
        Some(code) => format!("server exited with code {code}"),
        None => "server terminated by signal".to_string(),
    }
}

pub fn failure_summary(diagnostics: &[Diagnostic], ms: u64) -> String {
    let noun = if diagnostics.len() == 1 { "error" } else { "errors" };
    format!(
        "build failed in {} with {} {noun}",
        format_duration(ms),
        diagnostics.len()
    )
}

/// Callbacks that print lifecycle lines. With `quiet`, only failures print.
pub fn terminal_callbacks(quiet: bool) -> RebuildCallbacks {
    let mut callbacks = RebuildCallbacks {
        on_rebuild_failed: Some(Box::new(|diagnostics: &[Diagnostic], ms: u64| {
            eprintln!("{RED}[{}] {}{NC}", timestamp(), failure_summary(diagnostics, ms));
            for diagnostic in diagnostics {
                eprintln!("  {diagnostic}");
            }
        })),
        ..RebuildCallbacks::default()
    };
    if quiet {
        return callbacks;
    }

    callbacks.on_rebuild_start = Some(Box::new(|| {
        eprintln!("{YELLOW}[{}] rebuilding...{NC}", timestamp());
    }));
    callbacks.on_rebuild_end = Some(Box::new(|ms: u64| {
        eprintln!("{GREEN}[{}] build finished in {}{NC}", timestamp(), format_duration(ms));
    }));
    callbacks.on_server_start = Some(Box::new(|| {
        eprintln!("{GREEN}[{}] server started{NC}", timestamp());
    }));
    callbacks.on_server_closed = Some(Box::new(|code: Option<i32>| {
        let color = if code == Some(0) { YELLOW } else { RED };
        eprintln!("{color}[{}] {}{NC}", timestamp(), describe_exit(code));
    }));
    callbacks
}
