use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Top-level configuration loaded from relaunch.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct RelaunchConfig {
    pub build: BuildConfig,
    pub server: ServerConfig,
    pub watch: WatchConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildConfig {
    pub command: String,
    pub args: Vec<String>,
    /// The single artifact the build produces. Required.
    pub outfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program to run; `{artifact}` is replaced with the outfile path.
    pub command: String,
    pub args: Vec<String>,
    pub redirect_output: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    pub paths: Vec<String>,
    pub ignore: Vec<String>,
    /// Quiet period after the last filesystem event before a rebuild starts.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Exit the supervisor after handling the first termination signal.
    pub exit_on_signal: bool,
}

/// Errors that abort startup.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// No single output artifact is configured.
    MissingOutfile,
    EmptyBuildCommand,
    EmptyServerCommand,
    ZeroDebounce,
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::MissingOutfile => {
                write!(f, "relaunch supports exactly one output file (build.outfile)")
            }
            ConfigError::EmptyBuildCommand => write!(f, "build.command is empty"),
            ConfigError::EmptyServerCommand => write!(f, "server.command is empty"),
            ConfigError::ZeroDebounce => {
                write!(f, "watch.debounce_ms must be greater than zero")
            }
            ConfigError::InvalidPattern { pattern, source } => {
                write!(f, "invalid watch pattern {pattern:?}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidPattern { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl RelaunchConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check the settings the runner cannot work without.
    ///
    /// The outfile is checked separately when the coordinator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.command.trim().is_empty() {
            return Err(ConfigError::EmptyBuildCommand);
        }
        if self.server.command.trim().is_empty() {
            return Err(ConfigError::EmptyServerCommand);
        }
        if self.watch.debounce_ms == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        for pattern in self.watch.paths.iter().chain(&self.watch.ignore) {
            glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Make `path` absolute against the working directory and drop `.` and `..`
/// components lexically, without touching the filesystem.
pub fn absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

// --- Default implementations ---

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: vec!["build".to_string()],
            outfile: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "{artifact}".to_string(),
            args: Vec::new(),
            redirect_output: true,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: vec!["src/**/*.rs".to_string(), "Cargo.toml".to_string()],
            ignore: Vec::new(),
            debounce_ms: 500,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            exit_on_signal: true,
        }
    }
}
