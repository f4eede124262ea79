use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const SENTINEL_SUFFIX: &str = ".processing";

/// `<output_path>.processing`, holding the in-flight batch id on one line.
///
/// There is no locking: one driver process per logical batch is assumed.
#[derive(Debug, Clone)]
pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    pub fn for_output(output_path: &Path) -> Self {
        let mut s = output_path.as_os_str().to_os_string();
        s.push(SENTINEL_SUFFIX);
        Self { path: PathBuf::from(s) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let id = s.lines().next().unwrap_or("").trim().to_string();
                if id.is_empty() {
                    tracing::warn!(sentinel = %self.path.display(), "sentinel file is empty; ignoring");
                    Ok(None)
                } else {
                    Ok(Some(id))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    pub fn write(&self, batch_id: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, format!("{}\n", batch_id))
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn remove(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }

    /// Time since the sentinel was written, i.e. since submission. Survives
    /// process restarts because it comes from the file's mtime.
    pub fn age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }
}
