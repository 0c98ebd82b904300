use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use super::{Config, ConfigError, PipelineConfig};

type CacheKey = (PathBuf, Option<SystemTime>);

/// Pipeline configuration memoized by file path and modification time.
///
/// Owned by whoever constructs it; there is no process-wide instance. A
/// changed mtime reloads on the next `get`, and `invalidate` forces it.
#[derive(Debug, Default)]
pub struct PipelineConfigCache {
    entry: Mutex<Option<(CacheKey, Arc<PipelineConfig>)>>,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl PipelineConfigCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped pipeline section of the config at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file changed and no longer parses; the stale
    /// entry is kept in that case.
    pub fn get(&self, path: &Path) -> Result<Arc<PipelineConfig>, ConfigError> {
        let key = (path.to_path_buf(), mtime(path));
        let mut slot = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_key, value)) = slot.as_ref()
            && *cached_key == key
        {
            return Ok(Arc::clone(value));
        }

        let pipeline = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Config::parse(&content)?.pipeline
        } else {
            PipelineConfig::default()
        };
        let value = Arc::new(pipeline);
        tracing::debug!(path = %path.display(), "pipeline config (re)loaded");
        *slot = Some((key, Arc::clone(&value)));
        Ok(value)
    }

    pub fn invalidate(&self) {
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
