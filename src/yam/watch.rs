// Copyright (c) 2020 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The filesystem change pipeline.
//!
//! Raw watcher events are queued into a coalescing table: at most one
//! effective change per path per drain, renames decomposed into a removal
//! and an addition, and a queue overflow wiping everything. Consumption
//! happens on the main thread between builds and marks the matching mirror
//! nodes dirty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use notify::{DebouncedEvent, RecursiveMode, Watcher};

use crate::context::ExecutionContext;
use crate::logbook::{LogAspect, LogRecord};
use crate::node::{NodeId, NodeKind, NodeState};

/// What happened to a path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChangeAction {
    Added,
    Removed,
    Modified,
    /// The OS event queue overflowed; everything may have changed.
    Overflow,
}

/// A normalized change. `path` is absolute.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub action: ChangeAction,
    pub path: PathBuf,
    pub last_write_time: Option<SystemTime>,
}

/// The coalescing table. Multi-producer (watcher callbacks), drained by the
/// main thread.
#[derive(Default)]
pub struct CollapsedChanges {
    state: Mutex<CollapsedState>,
}

#[derive(Default)]
struct CollapsedState {
    changes: BTreeMap<PathBuf, FileChange>,
    overflowed: bool,
}

impl CollapsedChanges {
    pub fn new() -> CollapsedChanges {
        CollapsedChanges::default()
    }

    pub fn add(&self, change: FileChange) {
        let mut state = self.state.lock().unwrap();

        if change.action == ChangeAction::Overflow {
            state.changes.clear();
            state.overflowed = true;
            return;
        }
        if state.overflowed {
            return;
        }

        match state.changes.get_mut(&change.path) {
            None => {
                state.changes.insert(change.path.clone(), change);
            }
            Some(previous) => {
                previous.action =
                    collapse(previous.action, change.action);
                previous.last_write_time = change.last_write_time;
            }
        }
    }

    /// Records a rename as a removal of the old path and an addition of
    /// the new one.
    pub fn add_rename(
        &self,
        old: PathBuf,
        new: PathBuf,
        last_write_time: Option<SystemTime>,
    ) {
        self.add(FileChange {
            action: ChangeAction::Removed,
            path: old,
            last_write_time,
        });
        self.add(FileChange {
            action: ChangeAction::Added,
            path: new,
            last_write_time,
        });
    }

    /// Whether anything is pending for `path` (or an overflow is pending).
    pub fn has_changed(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.overflowed || state.changes.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.overflowed && state.changes.is_empty()
    }

    /// Drains the table. Returns the coalesced changes and whether an
    /// overflow occurred.
    pub fn drain(&self) -> (Vec<FileChange>, bool) {
        let mut state = self.state.lock().unwrap();
        let overflowed = state.overflowed;
        state.overflowed = false;
        let changes = std::mem::take(&mut state.changes);
        (changes.into_iter().map(|(_, c)| c).collect(), overflowed)
    }
}

/// The collapse table: two events on the same path reduce to one, keeping
/// the most recent write time.
fn collapse(previous: ChangeAction, new: ChangeAction) -> ChangeAction {
    match (previous, new) {
        (_, ChangeAction::Added) => ChangeAction::Added,
        (_, ChangeAction::Removed) => ChangeAction::Removed,
        (ChangeAction::Added, ChangeAction::Modified) => ChangeAction::Added,
        (ChangeAction::Removed, ChangeAction::Modified) => {
            // Modified after Removed should not happen, but sometimes does.
            ChangeAction::Removed
        }
        (ChangeAction::Modified, ChangeAction::Modified) => {
            ChangeAction::Modified
        }
        (ChangeAction::Overflow, _) | (_, ChangeAction::Overflow) => {
            ChangeAction::Overflow
        }
    }
}

/// Keeps a recursive OS watcher alive, forwarding normalized events into a
/// coalescing table.
pub struct DirectoryWatcher {
    // Held for their drop side effects: stopping the watch and the
    // forwarding thread.
    _watcher: notify::RecommendedWatcher,
    _forwarder: Option<thread::JoinHandle<()>>,
}

impl DirectoryWatcher {
    pub fn new(
        directory: &Path,
        changes: Arc<CollapsedChanges>,
    ) -> Result<DirectoryWatcher, crate::error::Error> {
        use crate::error::ResultExt;

        let (tx, rx) = mpsc::channel();
        let mut watcher =
            notify::watcher(tx, Duration::from_millis(50)).with_context(
                |_| format!("could not create watcher for {:?}", directory),
            )?;
        watcher
            .watch(directory, RecursiveMode::Recursive)
            .with_context(|_| {
                format!("could not watch directory {:?}", directory)
            })?;

        let forwarder = thread::Builder::new()
            .name("yam-watcher".to_string())
            .spawn(move || {
                for event in rx {
                    forward(event, &changes);
                }
            })
            .context("could not spawn watcher thread")?;

        Ok(DirectoryWatcher {
            _watcher: watcher,
            _forwarder: Some(forwarder),
        })
    }
}

fn forward(event: DebouncedEvent, changes: &CollapsedChanges) {
    let stat = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();

    match event {
        DebouncedEvent::Create(path) => {
            let last_write_time = stat(&path);
            changes.add(FileChange {
                action: ChangeAction::Added,
                path,
                last_write_time,
            });
        }
        DebouncedEvent::Write(path) | DebouncedEvent::Chmod(path) => {
            let last_write_time = stat(&path);
            changes.add(FileChange {
                action: ChangeAction::Modified,
                path,
                last_write_time,
            });
        }
        DebouncedEvent::Remove(path) => {
            changes.add(FileChange {
                action: ChangeAction::Removed,
                path,
                last_write_time: Some(SystemTime::now()),
            });
        }
        DebouncedEvent::Rename(old, new) => {
            let last_write_time = stat(&new);
            changes.add_rename(old, new, last_write_time);
        }
        DebouncedEvent::Rescan => {
            changes.add(FileChange {
                action: ChangeAction::Overflow,
                path: PathBuf::new(),
                last_write_time: None,
            });
        }
        DebouncedEvent::Error(_, _) => {
            changes.add(FileChange {
                action: ChangeAction::Overflow,
                path: PathBuf::new(),
                last_write_time: None,
            });
        }
        DebouncedEvent::NoticeWrite(_) | DebouncedEvent::NoticeRemove(_) => {}
    }
}

/// Applies the drained changes of one repository to the mirror. Main
/// thread only, and never during a build.
pub fn consume_changes(
    ctx: &mut ExecutionContext,
    repo_name: &str,
    repo_root: &Path,
    changes: &CollapsedChanges,
) {
    let (drained, overflowed) = changes.drain();

    if overflowed {
        ctx.log(LogRecord::new(
            LogAspect::FileChanges,
            format!("watcher overflow in repository {:?}", repo_name),
        ));
        let repo_prefix = Path::new(repo_name).to_path_buf();
        let in_repo = ctx
            .nodes
            .find_where(|node| node.name().starts_with(&repo_prefix));
        for id in in_repo {
            ctx.set_node_state(id, NodeState::Dirty);
        }
        return;
    }

    for change in drained {
        let symbolic = match change.path.strip_prefix(repo_root) {
            Ok(rest) => Path::new(repo_name).join(rest),
            Err(_) => continue,
        };

        if ctx.log_book().must_log_aspect(LogAspect::FileChanges) {
            ctx.log(LogRecord::new(
                LogAspect::FileChanges,
                format!("{:?}: {:?}", change.action, symbolic),
            ));
        }

        match change.action {
            ChangeAction::Added | ChangeAction::Removed => {
                // The event's write time applies to the child, not to the
                // parent directory that must re-enumerate; stat the parent
                // now.
                if let Some(parent) = symbolic.parent() {
                    if let Some(parent_id) = ctx.nodes.find(parent) {
                        let parent_abs = change
                            .path
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_default();
                        let current = std::fs::metadata(&parent_abs)
                            .and_then(|m| m.modified())
                            .ok();
                        invalidate(ctx, parent_id, current);
                    }
                }

                if change.action == ChangeAction::Removed {
                    if let Some(id) = ctx.nodes.find(&symbolic) {
                        ctx.mark_subtree_dirty(id);
                    }
                } else if let Some(id) = ctx.nodes.find(&symbolic) {
                    // A node for the path may predate the file itself
                    // (ignore-file nodes are created eagerly); it must be
                    // revisited like a modification.
                    invalidate(ctx, id, change.last_write_time);
                }
            }
            ChangeAction::Modified => {
                if let Some(id) = ctx.nodes.find(&symbolic) {
                    invalidate(ctx, id, change.last_write_time);
                }
            }
            ChangeAction::Overflow => unreachable!("drained separately"),
        }
    }
}

/// Marks a file or directory node dirty when the stored write time differs
/// from the observed one. The comparison suppresses spurious events and
/// the events caused by the build's own generated-file writes.
fn invalidate(
    ctx: &mut ExecutionContext,
    id: NodeId,
    observed: Option<SystemTime>,
) {
    let stored = match &ctx.nodes[id].kind {
        NodeKind::SourceFile(data) | NodeKind::GeneratedFile(data) => {
            data.last_write_time
        }
        NodeKind::Directory(data) => data.last_write_time,
        _ => return,
    };

    if stored != observed {
        ctx.set_node_state(id, NodeState::Dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(action: ChangeAction, path: &str) -> FileChange {
        FileChange {
            action,
            path: PathBuf::from(path),
            last_write_time: Some(SystemTime::now()),
        }
    }

    #[test]
    fn collapse_table_matches_the_design() {
        use ChangeAction::*;

        assert_eq!(collapse(Added, Added), Added);
        assert_eq!(collapse(Added, Removed), Removed);
        assert_eq!(collapse(Added, Modified), Added);
        assert_eq!(collapse(Removed, Added), Added);
        assert_eq!(collapse(Removed, Removed), Removed);
        assert_eq!(collapse(Removed, Modified), Removed);
        assert_eq!(collapse(Modified, Added), Added);
        assert_eq!(collapse(Modified, Removed), Removed);
        assert_eq!(collapse(Modified, Modified), Modified);
    }

    #[test]
    fn one_effective_change_per_path() {
        let changes = CollapsedChanges::new();
        changes.add(change(ChangeAction::Added, "/r/a"));
        changes.add(change(ChangeAction::Modified, "/r/a"));
        changes.add(change(ChangeAction::Modified, "/r/b"));

        let (drained, overflowed) = changes.drain();
        assert!(!overflowed);
        assert_eq!(drained.len(), 2);

        let a = drained
            .iter()
            .find(|c| c.path == Path::new("/r/a"))
            .unwrap();
        assert_eq!(a.action, ChangeAction::Added);
    }

    #[test]
    fn rename_decomposes_into_remove_and_add() {
        let changes = CollapsedChanges::new();
        changes.add_rename(
            PathBuf::from("/r/old"),
            PathBuf::from("/r/new"),
            None,
        );

        let (drained, _) = changes.drain();
        let old = drained
            .iter()
            .find(|c| c.path == Path::new("/r/old"))
            .unwrap();
        let new = drained
            .iter()
            .find(|c| c.path == Path::new("/r/new"))
            .unwrap();
        assert_eq!(old.action, ChangeAction::Removed);
        assert_eq!(new.action, ChangeAction::Added);
    }

    #[test]
    fn overflow_wipes_pending_changes() {
        let changes = CollapsedChanges::new();
        changes.add(change(ChangeAction::Added, "/r/a"));
        changes.add(change(ChangeAction::Overflow, ""));
        changes.add(change(ChangeAction::Modified, "/r/b"));

        assert!(changes.has_changed(Path::new("/r/zzz")));
        let (drained, overflowed) = changes.drain();
        assert!(overflowed);
        assert!(drained.is_empty());

        // After the drain, the table accepts changes again.
        changes.add(change(ChangeAction::Added, "/r/c"));
        let (drained, overflowed) = changes.drain();
        assert!(!overflowed);
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn drain_empties_the_table() {
        let changes = CollapsedChanges::new();
        changes.add(change(ChangeAction::Added, "/r/a"));
        assert!(!changes.is_empty());
        changes.drain();
        assert!(changes.is_empty());
    }
}
