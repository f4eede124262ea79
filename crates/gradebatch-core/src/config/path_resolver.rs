use super::Settings;
use std::path::{Component, Path, PathBuf};

/// SQLite's in-memory database name; never a file on disk.
const SQLITE_MEMORY: &str = ":memory:";

/// Anchors the file paths named in an experiment config to the config's
/// directory, so runs behave the same from any working directory.
#[derive(Clone)]
pub struct PathResolver {
    config_dir: PathBuf,
}

impl PathResolver {
    pub fn new(config_path: &Path) -> Self {
        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self { config_dir }
    }

    /// Rewrites `settings.questions` and `settings.cache` in place.
    pub fn resolve_settings(&self, settings: &mut Settings) {
        if let Some(q) = settings.questions.as_mut() {
            self.anchor(q);
        }
        if let Some(cache) = settings.cache.as_mut() {
            if cache.as_str() != SQLITE_MEMORY {
                self.anchor(cache);
            }
        }
    }

    fn anchor(&self, raw: &mut String) {
        let trimmed = raw.trim();
        if trimmed.is_empty() || Path::new(trimmed).is_absolute() {
            return;
        }
        *raw = lexical_join(&self.config_dir, Path::new(trimmed))
            .to_string_lossy()
            .into_owned();
    }
}

/// `base/rel` with `.` dropped and `..` folded, without touching the disk
/// (the target may not exist yet).
fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in base.join(rel).components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                out.push(c.as_os_str())
            }
        }
    }
    out
}
