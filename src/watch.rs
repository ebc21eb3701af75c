/// Source watcher: filesystem notifications for the files matched by the watch
/// patterns, debounced into one change set per burst of writes.
///
/// Patterns, ignore patterns and the outfile are all made absolute and
/// normalized up front, so `./dist/app.js`, `dist/app.js` and
/// `/project/dist/app.js` are the same file to the filter.
use crate::config::{absolute, WatchConfig};
use notify::{RecursiveMode, Watcher as _};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum WatchError {
    Pattern(glob::PatternError),
    Notify {
        path: PathBuf,
        source: notify::Error,
    },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Pattern(e) => write!(f, "invalid watch pattern: {e}"),
            WatchError::Notify { path, source } => {
                write!(f, "failed to watch {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Pattern(e) => Some(e),
            WatchError::Notify { source, .. } => Some(source),
        }
    }
}

impl From<glob::PatternError> for WatchError {
    fn from(e: glob::PatternError) -> Self {
        WatchError::Pattern(e)
    }
}

/// Compiled watch settings: which events count as source changes.
#[derive(Debug, Clone)]
pub struct Watcher {
    patterns: Vec<glob::Pattern>,
    ignore: Vec<glob::Pattern>,
    /// The build output; rewriting it must not trigger another build.
    outfile: Option<PathBuf>,
    debounce: Duration,
}

/// Keeps the notification backend alive. Dropping it stops watching.
pub struct WatchHandle {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

fn compile(pattern: &str) -> Result<glob::Pattern, glob::PatternError> {
    glob::Pattern::new(&absolute(Path::new(pattern)).to_string_lossy())
}

fn has_glob(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

impl Watcher {
    pub fn new(config: &WatchConfig, outfile: Option<&Path>) -> Result<Self, glob::PatternError> {
        let patterns = config
            .paths
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let ignore = config
            .ignore
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            ignore,
            outfile: outfile.map(absolute),
            debounce: Duration::from_millis(config.debounce_ms),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Whether a change to `path` should trigger a build.
    pub fn accepts(&self, path: &Path) -> bool {
        let path = absolute(path);
        if self.outfile.as_deref() == Some(path.as_path()) {
            return false;
        }
        if self.ignore.iter().any(|p| p.matches_path(&path)) {
            return false;
        }
        self.patterns.iter().any(|p| p.matches_path(&path))
    }

    /// Directories to register with the backend, one per pattern.
    ///
    /// The literal prefix of a pattern is watched recursively when it is a
    /// directory; a plain file is watched through its parent. Prefixes that
    /// do not exist yet are skipped.
    pub fn roots(&self) -> BTreeMap<PathBuf, RecursiveMode> {
        let mut roots = BTreeMap::new();
        for pattern in &self.patterns {
            let prefix: PathBuf = Path::new(pattern.as_str())
                .components()
                .take_while(|c| match c {
                    Component::Normal(part) => !has_glob(&part.to_string_lossy()),
                    _ => true,
                })
                .collect();

            let (root, mode) = if prefix.is_dir() {
                (prefix, RecursiveMode::Recursive)
            } else if prefix.is_file() {
                match prefix.parent() {
                    Some(parent) => (parent.to_path_buf(), RecursiveMode::NonRecursive),
                    None => continue,
                }
            } else {
                tracing::warn!(pattern = pattern.as_str(), "watch pattern matches no existing directory");
                continue;
            };

            let entry = roots.entry(root).or_insert(mode);
            if mode == RecursiveMode::Recursive {
                *entry = RecursiveMode::Recursive;
            }
        }
        roots
    }

    /// Start watching, sending each non-empty, sorted change set to `tx`.
    pub fn spawn(self, tx: mpsc::UnboundedSender<Vec<PathBuf>>) -> Result<WatchHandle, WatchError> {
        let roots = self.roots();
        let debounce = self.debounce;
        let filter = self.clone();

        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| {
            let events = match res {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = ?e, "file watcher error");
                    return;
                }
            };
            let mut changed: Vec<PathBuf> = events
                .into_iter()
                .map(|event| event.path)
                .filter(|path| filter.accepts(path))
                .collect();
            changed.sort();
            changed.dedup();
            if changed.is_empty() {
                return;
            }
            tracing::debug!(changed = ?changed, "detected source changes");
            let _ = tx.send(changed);
        })
        .map_err(|e| WatchError::Notify {
            path: PathBuf::new(),
            source: e,
        })?;

        for (root, mode) in &roots {
            debouncer
                .watcher()
                .watch(root, *mode)
                .map_err(|e| WatchError::Notify {
                    path: root.clone(),
                    source: e,
                })?;
        }

        tracing::info!(
            roots = roots.len(),
            debounce_ms = debounce.as_millis() as u64,
            "watching for changes"
        );
        Ok(WatchHandle {
            _debouncer: debouncer,
        })
    }
}
