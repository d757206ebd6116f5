//! Removal of abandoned staging files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::FileService;
use crate::path::{absolute_base, is_part_file};
use crate::transport::Transport;

/// Time between sweeps.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Delete `.part` files under `base` older than `ttl`, skipping `active`.
///
/// Returns how many files were removed. Unreadable entries are skipped.
pub fn sweep_once(base: &Path, ttl: Duration, active: &HashSet<PathBuf>) -> usize {
    let Ok(base) = absolute_base(base) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut cleaned = 0;

    for entry in WalkDir::new(&base).into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if !is_part_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if active.contains(path) {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() <= ttl {
            continue;
        }

        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to delete stale staging file"
            );
        } else {
            tracing::debug!(path = %path.display(), "Deleted stale staging file");
            cleaned += 1;
        }
    }

    if cleaned > 0 {
        tracing::info!(count = cleaned, "Cleaned up stale staging files");
    }
    cleaned
}

impl<T: Transport> FileService<T> {
    /// Start the periodic sweep unless it is already running.
    pub(crate) fn ensure_janitor(&self) {
        let token = {
            let mut slot = self.inner.janitor.lock();
            if slot.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                FileService { inner }.sweep_staging().await;
            }
            tracing::debug!("Janitor stopped");
        });
    }

    async fn sweep_staging(&self) -> usize {
        let config = self.config();
        let active = self.inner.registry.active_part_paths();
        let task = tokio::task::spawn_blocking(move || {
            sweep_once(&config.base_dir, config.incomplete_ttl, &active)
        });
        match task.await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Janitor sweep panicked: {e}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - by).expect("set mtime");
    }

    #[test]
    fn test_sweep_removes_only_stale_orphans() {
        let temp = TempDir::new().expect("create temp dir");
        let base = absolute_base(temp.path()).expect("base");
        std::fs::create_dir_all(base.join("nested")).expect("mkdir");

        let stale = base.join("nested/old.bin.PART");
        let fresh = base.join("new.bin.part");
        let owned = base.join("owned.bin.part");
        let regular = base.join("keep.bin");
        for path in [&stale, &fresh, &owned, &regular] {
            std::fs::write(path, b"x").expect("write");
        }
        age(&stale, Duration::from_secs(7200));
        age(&owned, Duration::from_secs(7200));
        age(&regular, Duration::from_secs(7200));

        let active: HashSet<PathBuf> = [owned.clone()].into_iter().collect();
        let removed = sweep_once(&base, Duration::from_secs(3600), &active);

        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(owned.exists());
        assert!(regular.exists());
    }

    #[test]
    fn test_sweep_missing_base() {
        let temp = TempDir::new().expect("create temp dir");
        let missing = temp.path().join("absent");
        assert_eq!(
            sweep_once(&missing, Duration::from_secs(1), &HashSet::new()),
            0
        );
    }
}
