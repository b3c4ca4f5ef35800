//! On-disk audio segments.
//!
//! Segments are named `<entry_id>_<index>.mp3` inside one directory, so the
//! set belonging to an entry can be rebuilt from its id and expected count.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const SEGMENT_EXTENSION: &str = "mp3";

#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub fn path(&self, entry_id: &str, index: usize) -> PathBuf {
        self.dir
            .join(format!("{}_{:04}.{}", entry_id, index, SEGMENT_EXTENSION))
    }

    pub fn paths(&self, entry_id: &str, count: usize) -> Vec<PathBuf> {
        (0..count).map(|i| self.path(entry_id, i)).collect()
    }

    /// True when `expected` is positive and every segment file exists.
    pub fn is_complete(&self, entry_id: &str, expected: i64) -> bool {
        expected > 0
            && self
                .paths(entry_id, expected as usize)
                .iter()
                .all(|p| p.is_file())
    }

    /// Remove every segment file belonging to `entry_id`, including any left
    /// beyond the expected count by an earlier run.
    pub fn delete_for_entry(&self, entry_id: &str) -> io::Result<usize> {
        let prefix = format!("{}_", entry_id);
        let mut removed = 0;
        for path in self.list()? {
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false);
            if owned {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove segment files last modified more than `max_age` before `now`.
    pub fn sweep_orphans(&self, max_age: Duration, now: SystemTime) -> io::Result<usize> {
        let cutoff = now.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for path in self.list()? {
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Cannot stat segment {:?}: {}", path, e);
                    continue;
                }
            };
            if modified < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => log::warn!("Failed to remove orphan segment {:?}: {}", path, e),
                }
            }
        }
        Ok(removed)
    }

    fn list(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_segment = path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION);
            if is_segment {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}
