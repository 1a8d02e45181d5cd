//! Manager builder and event hooks

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tidemark_core::{Clock, Error, IndexConfig, Result, SystemClock, CONFIG_FILE_NAME};
use tidemark_storage::Range;

use super::Manager;

/// Called after a range file is read from disk, with its load time.
pub type OnLoaded = Arc<dyn Fn(&Path, Duration) + Send + Sync>;

/// Called after every save attempt with bytes written (0 on failure), the
/// error if any, and the elapsed time.
pub type OnSaved = Arc<dyn Fn(&Path, usize, Option<&Error>, Duration) + Send + Sync>;

/// Supplies a range newer than any persisted file at the head of a
/// descending walk. Receives the walk's start in milliseconds.
pub type OnMissing = Arc<dyn Fn(i64) -> Result<Option<Arc<Range>>> + Send + Sync>;

/// Optional hooks fired by the manager.
///
/// Hooks run on the thread that triggered them, including the save worker.
/// They must not call `Manager::saver`.
#[derive(Clone, Default)]
pub struct ManagerEvents {
    pub(crate) on_loaded: Option<OnLoaded>,
    pub(crate) on_saved: Option<OnSaved>,
    pub(crate) on_missing: Option<OnMissing>,
}

impl fmt::Debug for ManagerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerEvents")
            .field("on_loaded", &self.on_loaded.is_some())
            .field("on_saved", &self.on_saved.is_some())
            .field("on_missing", &self.on_missing.is_some())
            .finish()
    }
}

/// Builder for a [`Manager`].
///
/// ```ignore
/// let manager = Manager::builder()
///     .dir("/data/index")
///     .on_missing(move |_| Ok(Some(hot.clone())))
///     .open()?;
/// ```
///
/// Without an explicit config the builder reads `tidemark.toml` from the
/// directory, falling back to defaults when the file is absent.
#[derive(Default)]
pub struct ManagerBuilder {
    dir: Option<PathBuf>,
    config: Option<IndexConfig>,
    clock: Option<Arc<dyn Clock>>,
    events: ManagerEvents,
}

impl ManagerBuilder {
    /// Create a builder with no directory set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding the range files. Required.
    pub fn dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Use `config` instead of the directory's `tidemark.toml`.
    pub fn config(mut self, config: IndexConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Time source; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Install the load hook.
    pub fn on_loaded<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, Duration) + Send + Sync + 'static,
    {
        self.events.on_loaded = Some(Arc::new(f));
        self
    }

    /// Install the save hook.
    pub fn on_saved<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, usize, Option<&Error>, Duration) + Send + Sync + 'static,
    {
        self.events.on_saved = Some(Arc::new(f));
        self
    }

    /// Install the hot-range hook used by descending walks.
    pub fn on_missing<F>(mut self, f: F) -> Self
    where
        F: Fn(i64) -> Result<Option<Arc<Range>>> + Send + Sync + 'static,
    {
        self.events.on_missing = Some(Arc::new(f));
        self
    }

    /// Open the directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if no directory was set, the config is invalid, the directory
    /// holds a file that is not a range file, or the latest range file
    /// cannot be read.
    pub fn open(self) -> Result<Manager> {
        let dir = self
            .dir
            .ok_or_else(|| Error::Config("ManagerBuilder::open() requires a dir".to_string()))?;
        let config = match self.config {
            Some(config) => config,
            None => IndexConfig::load(&dir.join(CONFIG_FILE_NAME))?,
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        Manager::open_with(dir, config, clock, self.events)
    }
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}
