//! File-change notifications for scratchpad sections.
//!
//! Backed by `notify`'s recommended platform watcher. A subscription is a
//! guard; dropping it stops the watcher and detaches the callback.

use crate::errors::ScratchpadError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A change to a file under the watched subtree.
#[derive(Debug, Clone)]
pub struct SectionChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Keeps the underlying watcher alive; unsubscribes on drop.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

/// Watch `root` recursively, invoking `callback` for every change under
/// `filter` (a path prefix). Lock sidecars and temp files are ignored.
pub fn watch(
    root: &Path,
    filter: PathBuf,
    callback: impl Fn(SectionChange) + Send + 'static,
) -> Result<WatchGuard, ScratchpadError> {
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else { return };
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Modify(_) => ChangeKind::Modified,
            EventKind::Remove(_) => ChangeKind::Removed,
            _ => return,
        };
        for path in event.paths {
            if !path.starts_with(&filter) || is_bookkeeping(&path) {
                continue;
            }
            callback(SectionChange {
                path: path.clone(),
                kind,
            });
        }
    })
    .map_err(|e| ScratchpadError::Io {
        action: "create watcher",
        path: root.to_path_buf(),
        source: std::io::Error::other(e),
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| ScratchpadError::Io {
            action: "watch directory",
            path: root.to_path_buf(),
            source: std::io::Error::other(e),
        })?;

    Ok(WatchGuard { _watcher: watcher })
}

fn is_bookkeeping(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.ends_with(".lock") || name.starts_with(".tmp-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn reports_changes_under_the_filter_prefix() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("scratchpad");
        std::fs::create_dir_all(&watched).unwrap();

        let (tx, rx) = mpsc::channel();
        let guard = watch(dir.path(), watched.clone(), move |change| {
            let _ = tx.send(change);
        })
        .unwrap();

        // Give the platform watcher a moment to arm.
        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(watched.join("prd.md"), "# PRD").unwrap();

        let change = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a change event");
        assert!(change.path.ends_with("prd.md"));
        drop(guard);
    }

    #[test]
    fn lock_sidecars_are_filtered_out() {
        assert!(is_bookkeeping(Path::new("/a/b/state.yaml.lock")));
        assert!(is_bookkeeping(Path::new("/a/b/.tmp-123")));
        assert!(!is_bookkeeping(Path::new("/a/b/state.yaml")));
    }

    #[test]
    fn dropping_the_guard_stops_notifications() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("scratchpad");
        std::fs::create_dir_all(&watched).unwrap();

        let (tx, rx) = mpsc::channel();
        let guard = watch(dir.path(), watched.clone(), move |change| {
            let _ = tx.send(change);
        })
        .unwrap();
        drop(guard);

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(watched.join("srs.md"), "# SRS").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }
}
