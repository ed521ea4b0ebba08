//! Environment-gated allocation profiling.
//!
//! When enabled, every storage construction appends an `alloc` line to the
//! profiling log, every release a matching `free` line, and
//! [`Profiler::dump_live`] one `live` line per storage still alive. Lines have
//! the form `<kind> <label> <bytes>`.
//!
//! The enabled flag comes from an environment variable (presence enables it)
//! and is cached after the first query until [`Profiler::reset`].
//!
//! ```text
//! alloc cpu 4096
//! alloc accel 256
//! live cpu 4096
//! free accel 256
//! ```

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Environment variable that enables profiling when present.
pub const PROFILE_ENV: &str = "ORCHARD_TENSOR_PROFILE";

/// Where the profiling log is written by default.
pub const DEFAULT_LOG_PATH: &str = "/tmp/orchard_tensor_profile.log";

/// Profiler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Variable whose presence turns profiling on.
    pub env_var: String,
    /// Append-only log file.
    pub log_path: PathBuf,
    /// Forces profiling on or off, bypassing the environment.
    pub enabled: Option<bool>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            env_var: PROFILE_ENV.to_string(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            enabled: None,
        }
    }
}

impl ProfilerConfig {
    /// Default settings logging to `path`.
    pub fn with_log_path(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
            ..Self::default()
        }
    }
}

/// Kind of a profiling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Alloc,
    Free,
    Live,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Alloc => "alloc",
            EventKind::Free => "free",
            EventKind::Live => "live",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveStorage {
    label: &'static str,
    nbytes: usize,
}

/// Allocation event log plus the registry of live storages.
#[derive(Debug)]
pub struct Profiler {
    config: Mutex<ProfilerConfig>,
    enabled: Mutex<Option<bool>>,
    live: Mutex<BTreeMap<u64, LiveStorage>>,
    sink: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            enabled: Mutex::new(None),
            live: Mutex::new(BTreeMap::new()),
            sink: Mutex::new(()),
        }
    }

    /// Current settings.
    pub fn config(&self) -> ProfilerConfig {
        lock(&self.config).clone()
    }

    /// Replace the settings and drop the cached enabled flag.
    pub fn reconfigure(&self, config: ProfilerConfig) {
        *lock(&self.config) = config;
        self.reset();
    }

    pub fn log_path(&self) -> PathBuf {
        lock(&self.config).log_path.clone()
    }

    /// Whether events are being logged.
    ///
    /// The first call reads the environment; later calls reuse that answer.
    pub fn enabled(&self) -> bool {
        let mut cached = lock(&self.enabled);
        if let Some(enabled) = *cached {
            return enabled;
        }
        let config = lock(&self.config);
        let enabled = config
            .enabled
            .unwrap_or_else(|| std::env::var_os(&config.env_var).is_some());
        *cached = Some(enabled);
        enabled
    }

    /// Forget the cached flag so the next query re-reads the environment.
    pub fn reset(&self) {
        *lock(&self.enabled) = None;
    }

    /// Number of storages currently alive under this profiler.
    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Append one `live` line per storage still alive.
    pub fn dump_live(&self) {
        if !self.enabled() {
            return;
        }
        let lines: String = lock(&self.live)
            .values()
            .map(|entry| format_event(EventKind::Live, entry.label, entry.nbytes))
            .collect();
        self.append(&lines);
    }

    /// Delete the log file. A missing file is not an error.
    pub fn clear_log(&self) -> io::Result<()> {
        let path = self.log_path();
        let _guard = lock(&self.sink);
        match fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Register a new storage; returns whether an `alloc` line was written.
    pub(crate) fn track_alloc(&self, id: u64, label: &'static str, nbytes: usize) -> bool {
        lock(&self.live).insert(id, LiveStorage { label, nbytes });
        if !self.enabled() {
            return false;
        }
        self.append(&format_event(EventKind::Alloc, label, nbytes));
        true
    }

    /// Unregister a storage; the `free` line mirrors a logged `alloc`.
    pub(crate) fn track_free(&self, id: u64, label: &'static str, nbytes: usize, logged: bool) {
        lock(&self.live).remove(&id);
        if logged {
            self.append(&format_event(EventKind::Free, label, nbytes));
        }
    }

    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let path = self.log_path();
        let _guard = lock(&self.sink);
        if let Err(err) = append_to(&path, text) {
            warn!(path = %path.display(), error = %err, "failed to append to profiling log");
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

fn format_event(kind: EventKind, label: &str, size: usize) -> String {
    format!("{kind} {label} {size}\n")
}

fn append_to(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}

static GLOBAL: Lazy<Arc<Profiler>> = Lazy::new(|| Arc::new(Profiler::default()));

/// The process-wide profiler used by storages that were not given one.
pub fn global() -> &'static Arc<Profiler> {
    &GLOBAL
}

/// Reconfigure the process-wide profiler.
pub fn configure(config: ProfilerConfig) {
    GLOBAL.reconfigure(config);
}

/// Whether the process-wide profiler is logging.
pub fn profile_enabled() -> bool {
    GLOBAL.enabled()
}

/// Re-read the enable variable on the next query.
pub fn profile_reset() {
    GLOBAL.reset();
}

/// Delete the process-wide profiling log.
pub fn clear_log() -> io::Result<()> {
    GLOBAL.clear_log()
}

/// Append `live` lines for every storage alive under the process-wide profiler.
pub fn dump_live() {
    GLOBAL.dump_live();
}
