mod builder;
mod config;
mod coordinator;
mod diagnostic;
mod process;
mod report;
mod runner;
mod signals;
mod watch;

use clap::Parser;
use config::RelaunchConfig;
use std::path::PathBuf;
use std::process::ExitCode;

/// Rebuild on change and restart the server from the fresh artifact: stop the
/// old server as soon as a build starts, start a new one when it succeeds.
#[derive(Parser, Debug)]
#[command(name = "relaunch", version, about)]
pub struct Cli {
    /// Build command and its arguments (overrides config)
    #[arg(last = true, value_name = "BUILD_COMMAND")]
    build: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "relaunch.toml")]
    config: PathBuf,

    /// Artifact produced by the build (overrides config)
    #[arg(short, long)]
    outfile: Option<PathBuf>,

    /// Glob of files to watch; repeat for several (overrides config)
    #[arg(short, long = "watch", value_name = "GLOB")]
    watch: Vec<String>,

    /// Debounce window for source changes in milliseconds (overrides config)
    #[arg(long)]
    debounce: Option<u64>,

    /// Discard the server's stdout/stderr instead of forwarding them
    #[arg(long)]
    no_redirect: bool,

    /// Stay alive after the first shutdown signal (the server is still stopped)
    #[arg(long)]
    keep_running: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (build commands, termination requests, exits)
    #[arg(short, long)]
    verbose: bool,

    /// Only report failed builds
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RelaunchConfig) {
        if let Some((command, args)) = self.build.split_first() {
            config.build.command = command.clone();
            config.build.args = args.to_vec();
        }
        if let Some(outfile) = &self.outfile {
            config.build.outfile = Some(outfile.clone());
        }
        if !self.watch.is_empty() {
            config.watch.paths = self.watch.clone();
        }
        if let Some(ms) = self.debounce {
            config.watch.debounce_ms = ms;
        }
        if self.no_redirect {
            config.server.redirect_output = false;
        }
        if self.keep_running {
            config.shutdown.exit_on_signal = false;
        }
    }

    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "relaunch=debug"
        } else if self.quiet {
            "relaunch=warn"
        } else {
            "relaunch=info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_filter())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match RelaunchConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaunch: {e}");
            return ExitCode::from(2);
        }
    };
    cli.apply_overrides(&mut config);

    if cli.dry_run {
        if let Err(e) = config.validate() {
            eprintln!("relaunch: {e}");
            return ExitCode::from(2);
        }
        if config.build.outfile.is_none() {
            eprintln!("relaunch: {}", config::ConfigError::MissingOutfile);
            return ExitCode::from(2);
        }
        match toml::to_string_pretty(&config) {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("relaunch: failed to render config: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    match runner::run(config, report::terminal_callbacks(cli.quiet)).await {
        Ok(()) => {
            tracing::debug!("exiting after shutdown signal");
            std::process::exit(0);
        }
        Err(runner::RunError::Config(e)) => {
            eprintln!("relaunch: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("relaunch: {e}");
            ExitCode::FAILURE
        }
    }
}
