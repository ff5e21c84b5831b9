// Copyright (c) 2019 Jason White
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

//! Source-directory nodes.
//!
//! A directory node mirrors one filesystem directory: it enumerates the
//! entries, filters them through the effective dot-ignore chain and the
//! repository exclude patterns, and keeps a child node per surviving entry.
//! The execution hash is a fingerprint of the sorted child names, so adding
//! or removing an entry changes it while touching a file does not.
//!
//! Enumeration runs on a worker; reusing, creating and removing child nodes
//! happens on the main thread when the result is committed. The children
//! are the node's post-requisites, which is how a build recursively visits
//! and rehashes everything below a dirty directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use ignore::gitignore::Gitignore;

use crate::aspect::RegexSet;
use crate::context::ExecutionContext;
use crate::dispatch::Priority;
use crate::hash::Hash64;
use crate::logbook::{LogAspect, LogRecord};
use crate::node::{self, dotignore, NodeId, NodeState, SelfResult};

pub struct DirectoryData {
    /// Parent directory node; `None` for a repository root.
    pub parent: Option<NodeId>,

    /// The colocated dot-ignore node.
    pub dot_ignore: NodeId,

    /// Symbolic child name → child node (sub-directory or source file).
    pub content: BTreeMap<PathBuf, NodeId>,

    pub last_write_time: Option<SystemTime>,

    /// Hash over the sorted child-name list.
    pub execution_hash: Hash64,
}

impl DirectoryData {
    pub fn new(parent: Option<NodeId>, dot_ignore: NodeId) -> DirectoryData {
        DirectoryData {
            parent,
            dot_ignore,
            content: BTreeMap::new(),
            last_write_time: None,
            execution_hash: Hash64::random(),
        }
    }
}

/// One surviving directory entry, as seen by the enumeration worker.
pub struct DirEntry {
    /// Leaf name.
    pub name: PathBuf,
    pub is_dir: bool,
}

pub struct DirectorySelfResult {
    pub new_state: NodeState,
    pub last_write_time: Option<SystemTime>,

    /// Surviving entries, or `None` when the directory's write time was
    /// unchanged and re-enumeration was skipped.
    pub entries: Option<Vec<DirEntry>>,

    pub execution_hash: Hash64,
}

/// Enumerates `abs_dir`, filtering ignored entries. Runs on a worker.
///
/// `matchers` is the effective dot-ignore chain, outermost first; each
/// matcher applies to paths below its own root, which is how gitignore
/// precedence reaches into subdirectories.
pub fn enumerate(
    abs_dir: &Path,
    sym_dir: &Path,
    stored_lwt: Option<SystemTime>,
    matchers: &[Arc<Gitignore>],
    excludes: &RegexSet,
) -> DirectorySelfResult {
    let lwt = fs::metadata(abs_dir).and_then(|m| m.modified()).ok();

    if lwt.is_none() {
        // The directory vanished. Report an empty listing; the parent's
        // next enumeration removes this node.
        return DirectorySelfResult {
            new_state: NodeState::Ok,
            last_write_time: None,
            entries: Some(Vec::new()),
            execution_hash: Hash64::combine(Vec::new()),
        };
    }

    if lwt == stored_lwt {
        return DirectorySelfResult {
            new_state: NodeState::Ok,
            last_write_time: lwt,
            entries: None,
            execution_hash: Hash64::default(),
        };
    }

    let read = match fs::read_dir(abs_dir) {
        Ok(read) => read,
        Err(_) => {
            return DirectorySelfResult {
                new_state: NodeState::Failed,
                last_write_time: lwt,
                entries: None,
                execution_hash: Hash64::default(),
            };
        }
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                return DirectorySelfResult {
                    new_state: NodeState::Failed,
                    last_write_time: lwt,
                    entries: None,
                    execution_hash: Hash64::default(),
                };
            }
        };

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        // Symlinks and special files are not mirrored.
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }

        let leaf = PathBuf::from(entry.file_name());
        if dotignore::DotIgnoreData::is_ignore_file(&leaf) {
            continue;
        }

        let sym_child = sym_dir.join(&leaf);
        if excludes.matches(&sym_child.to_string_lossy()) {
            continue;
        }

        let abs_child = entry.path();
        let is_dir = file_type.is_dir();
        if matchers
            .iter()
            .any(|m| m.matched_path_or_any_parents(&abs_child, is_dir).is_ignore())
        {
            continue;
        }

        entries.push(DirEntry { name: leaf, is_dir });
    }

    // Directory iteration order is filesystem-specific; sort to keep the
    // execution hash deterministic.
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let execution_hash = Hash64::combine(entries.iter().map(|e| {
        Hash64::from_str(&sym_dir.join(&e.name).to_string_lossy())
    }));

    DirectorySelfResult {
        new_state: NodeState::Ok,
        last_write_time: lwt,
        entries: Some(entries),
        execution_hash,
    }
}

pub(super) fn start_self(ctx: &mut ExecutionContext, id: NodeId) {
    let sym_dir = ctx.nodes[id].name().to_path_buf();
    let abs_dir = ctx.absolute_path(&sym_dir);
    let stored_lwt = data(ctx, id).last_write_time;
    let matchers = effective_matchers(ctx, id);
    let excludes = ctx.excludes_for(&sym_dir);

    let main_queue = ctx.main_queue();
    ctx.worker_queue().push(
        Box::new(move || {
            let result =
                enumerate(&abs_dir, &sym_dir, stored_lwt, &matchers, &excludes);
            main_queue.push(Box::new(move |ctx: &mut ExecutionContext| {
                ctx.handle_self_completion(id, SelfResult::Directory(result));
            }));
        }),
        Priority::High,
    );
}

/// The dot-ignore matcher chain from the repository root down to this
/// directory, outermost first.
fn effective_matchers(
    ctx: &ExecutionContext,
    id: NodeId,
) -> Vec<Arc<Gitignore>> {
    let mut chain = Vec::new();
    let mut current = Some(id);
    while let Some(dir) = current {
        let d = data(ctx, dir);
        if let node::NodeKind::DotIgnore(di) = &ctx.nodes[d.dot_ignore].kind {
            if let Some(matcher) = &di.matcher {
                chain.push(matcher.clone());
            }
        }
        current = d.parent;
    }
    chain.reverse();
    chain
}

pub(super) fn commit_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
    result: DirectorySelfResult,
) -> NodeState {
    if result.new_state != NodeState::Ok {
        return result.new_state;
    }

    let entries = match result.entries {
        Some(entries) => entries,
        None => {
            // Unchanged write time; the stored content is still valid.
            return NodeState::Ok;
        }
    };

    let sym_dir = ctx.nodes[id].name().to_path_buf();
    let old_content = data(ctx, id).content.clone();

    let mut new_content: BTreeMap<PathBuf, NodeId> = BTreeMap::new();
    for entry in &entries {
        let sym_child = sym_dir.join(&entry.name);
        let child = match old_content.get(&sym_child) {
            Some(&existing) => existing,
            None => {
                if entry.is_dir {
                    create_directory_node(ctx, &sym_child, Some(id))
                } else {
                    let child = super::file::find_or_create_source_file(
                        ctx, &sym_child,
                    );
                    ctx.add_dependant(child, id);
                    ctx.add_post_parent(child, id);
                    child
                }
            }
        };
        new_content.insert(sym_child, child);
    }

    // Remove orphans recursively.
    for (name, child) in &old_content {
        if !new_content.contains_key(name) {
            remove_child_recursively(ctx, id, *child);
        }
    }

    {
        let node = &mut ctx.nodes[id];
        let d = match &mut node.kind {
            node::NodeKind::Directory(d) => d,
            _ => unreachable!("directory access on wrong node kind"),
        };
        d.last_write_time = result.last_write_time;
        d.content = new_content;
        d.execution_hash = result.execution_hash;
        node.modified = true;
    }

    ctx.statistics.register_updated_directory();
    if ctx.log_book().must_log_aspect(LogAspect::DirectoryChanges) {
        ctx.log(LogRecord::new(
            LogAspect::DirectoryChanges,
            format!("re-enumerated directory {:?}", sym_dir),
        ));
    }

    NodeState::Ok
}

/// Creates a directory node together with its dot-ignore machinery and
/// registers it with its parent.
pub fn create_directory_node(
    ctx: &mut ExecutionContext,
    sym_dir: &Path,
    parent: Option<NodeId>,
) -> NodeId {
    if let Some(existing) = ctx.nodes.find(sym_dir) {
        return existing;
    }

    // The dot-ignore node references the directory; insert the directory
    // first with a placeholder edge, then wire the dot-ignore node in.
    let id = ctx.nodes.add(node::Node::new(
        sym_dir.to_path_buf(),
        node::NodeKind::Directory(DirectoryData::new(parent, NodeId::dangling())),
    ));

    let dot_ignore = dotignore::create(ctx, id, sym_dir);
    match &mut ctx.nodes[id].kind {
        node::NodeKind::Directory(d) => d.dot_ignore = dot_ignore,
        _ => unreachable!("directory access on wrong node kind"),
    }

    if let Some(parent) = parent {
        ctx.add_dependant(id, parent);
        ctx.add_post_parent(id, parent);
    }

    id
}

/// Removes a child node (and, for directories, everything below it) from
/// the context. Nodes the persistent state knows about are dropped from
/// the store at the next commit.
pub fn remove_child_recursively(
    ctx: &mut ExecutionContext,
    parent: NodeId,
    child: NodeId,
) {
    if !ctx.nodes.contains(child) {
        return;
    }

    ctx.remove_dependant(child, parent);
    ctx.remove_post_parent(child, parent);

    if let node::NodeKind::Directory(d) = &ctx.nodes[child].kind {
        let dot_ignore = d.dot_ignore;
        let grandchildren: Vec<NodeId> = d.content.values().copied().collect();
        for grandchild in grandchildren {
            remove_child_recursively(ctx, child, grandchild);
        }
        dotignore::remove(ctx, dot_ignore);
    }

    // A parent directory's removal may already have taken this node out.
    ctx.nodes.remove_if_present(child);
}

pub fn data<'a>(ctx: &'a ExecutionContext, id: NodeId) -> &'a DirectoryData {
    match &ctx.nodes[id].kind {
        node::NodeKind::Directory(d) => d,
        _ => unreachable!("directory access on wrong node kind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_is_sorted_and_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let excludes = RegexSet::default();

        let first =
            enumerate(dir.path(), Path::new("repo"), None, &[], &excludes);
        let entries = first.entries.as_ref().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("sub")
            ]
        );

        let again =
            enumerate(dir.path(), Path::new("repo"), None, &[], &excludes);
        assert_eq!(first.execution_hash, again.execution_hash);
    }

    #[test]
    fn unchanged_write_time_skips_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let excludes = RegexSet::default();
        let first =
            enumerate(dir.path(), Path::new("repo"), None, &[], &excludes);
        let second = enumerate(
            dir.path(),
            Path::new("repo"),
            first.last_write_time,
            &[],
            &excludes,
        );
        assert!(second.entries.is_none());
    }

    #[test]
    fn ignore_matcher_filters_entries_without_changing_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.cpp"), b"x").unwrap();

        let excludes = RegexSet::default();
        let before =
            enumerate(dir.path(), Path::new("repo"), None, &[], &excludes);

        fs::write(dir.path().join(".gitignore"), "*.tmp\n").unwrap();
        fs::write(dir.path().join("noise.tmp"), b"y").unwrap();

        let matcher = dotignore::parse_ignore_files(dir.path()).unwrap();
        let after = enumerate(
            dir.path(),
            Path::new("repo"),
            None,
            &[matcher],
            &excludes,
        );

        // The ignored file and the .gitignore itself are invisible, so the
        // listing hash is unchanged.
        assert_eq!(before.execution_hash, after.execution_hash);
    }

    #[test]
    fn exclude_patterns_prune_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("generated")).unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();

        let excludes =
            RegexSet::new(vec![RegexSet::match_directory("generated")])
                .unwrap();
        let result =
            enumerate(dir.path(), Path::new("repo"), None, &[], &excludes);
        let names: Vec<_> = result
            .entries
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![PathBuf::from("src")]);
    }

    #[test]
    fn missing_directory_reports_empty_listing() {
        let result = enumerate(
            Path::new("/nonexistent/for/sure"),
            Path::new("repo"),
            None,
            &[],
            &RegexSet::default(),
        );
        assert_eq!(result.new_state, NodeState::Ok);
        assert!(result.entries.unwrap().is_empty());
    }
}
