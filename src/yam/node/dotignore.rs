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

//! Dot-ignore nodes.
//!
//! Each source directory owns one dot-ignore node which in turn owns two
//! source-file nodes: `.gitignore` and `.yamignore`. The node's hash is a
//! fingerprint of those files' contents; when it changes, the owning
//! directory re-enumerates and — because gitignore precedence affects all
//! descendants — the whole subtree is marked dirty (see the dirty
//! propagation hook in the node protocol).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::context::ExecutionContext;
use crate::dispatch::Priority;
use crate::hash::Hash64;
use crate::node::{self, NodeId, NodeState, SelfResult};

pub const GITIGNORE: &str = ".gitignore";
pub const YAMIGNORE: &str = ".yamignore";

/// The leaf name of a dot-ignore node below its directory.
pub const NODE_LEAF: &str = ".ignore";

pub struct DotIgnoreData {
    /// The directory this node belongs to.
    pub directory: NodeId,

    /// The `.gitignore` and `.yamignore` source-file nodes.
    pub files: Vec<NodeId>,

    /// Fingerprint of the concatenated, parsed patterns.
    pub hash: Hash64,

    /// Compiled matcher; rebuilt on commit and after deserialization.
    pub matcher: Option<Arc<Gitignore>>,
}

impl DotIgnoreData {
    pub fn new(directory: NodeId) -> DotIgnoreData {
        DotIgnoreData {
            directory,
            files: Vec::new(),
            hash: Hash64::random(),
            matcher: None,
        }
    }

    /// Whether a directory entry with the given leaf name is one of the
    /// ignore files themselves. Those never appear as directory content.
    pub fn is_ignore_file(leaf: &Path) -> bool {
        leaf == Path::new(GITIGNORE) || leaf == Path::new(YAMIGNORE)
    }
}

pub struct DotIgnoreSelfResult {
    pub new_state: NodeState,
    pub hash: Hash64,
    pub matcher: Option<Arc<Gitignore>>,
}

/// Parses the ignore files of `abs_dir` into a matcher. Missing files
/// contribute nothing. Runs on a worker thread.
pub fn parse_ignore_files(abs_dir: &Path) -> Option<Arc<Gitignore>> {
    let mut builder = GitignoreBuilder::new(abs_dir);
    let mut any = false;

    for name in &[GITIGNORE, YAMIGNORE] {
        let path = abs_dir.join(name);
        if path.is_file() {
            // `add` reports a parse error; gitignore semantics are to skip
            // bad lines, which the builder already does internally.
            let _ = builder.add(&path);
            any = true;
        }
    }

    if !any {
        return None;
    }

    builder.build().ok().map(Arc::new)
}

pub(super) fn pending_start_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> bool {
    stored_hash(ctx, id) != compute_hash(ctx, id)
}

fn stored_hash(ctx: &ExecutionContext, id: NodeId) -> Hash64 {
    match &ctx.nodes[id].kind {
        node::NodeKind::DotIgnore(data) => data.hash,
        _ => unreachable!("dot-ignore access on wrong node kind"),
    }
}

/// Fingerprint over the entire-file hashes of the ignore files.
fn compute_hash(ctx: &ExecutionContext, id: NodeId) -> Hash64 {
    let files = match &ctx.nodes[id].kind {
        node::NodeKind::DotIgnore(data) => data.files.clone(),
        _ => unreachable!("dot-ignore access on wrong node kind"),
    };

    Hash64::combine(files.iter().map(|&f| {
        node::file::hash_of(ctx, f, crate::aspect::ENTIRE_FILE_ASPECT)
    }))
}

pub(super) fn start_self(ctx: &mut ExecutionContext, id: NodeId) {
    let hash = compute_hash(ctx, id);
    let directory = match &ctx.nodes[id].kind {
        node::NodeKind::DotIgnore(data) => data.directory,
        _ => unreachable!("dot-ignore access on wrong node kind"),
    };
    let dir_name = ctx.nodes[directory].name().to_path_buf();
    let abs_dir = ctx.absolute_path(&dir_name);

    let main_queue = ctx.main_queue();
    ctx.worker_queue().push(
        Box::new(move || {
            let matcher = parse_ignore_files(&abs_dir);
            let result = DotIgnoreSelfResult {
                new_state: NodeState::Ok,
                hash,
                matcher,
            };
            main_queue.push(Box::new(move |ctx: &mut ExecutionContext| {
                ctx.handle_self_completion(id, SelfResult::DotIgnore(result));
            }));
        }),
        Priority::High,
    );
}

pub(super) fn commit_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
    result: DotIgnoreSelfResult,
) -> NodeState {
    if result.new_state != NodeState::Ok {
        return result.new_state;
    }

    let node = &mut ctx.nodes[id];
    match &mut node.kind {
        node::NodeKind::DotIgnore(data) => {
            data.hash = result.hash;
            data.matcher = result.matcher;
        }
        _ => unreachable!("dot-ignore access on wrong node kind"),
    }
    node.modified = true;

    result.new_state
}

/// Creates a dot-ignore node for `directory` together with its two ignore
/// source-file nodes, and registers the observer edges.
pub fn create(
    ctx: &mut ExecutionContext,
    directory: NodeId,
    directory_name: &Path,
) -> NodeId {
    let mut data = DotIgnoreData::new(directory);

    let gitignore =
        super::file::find_or_create_source_file(ctx, &directory_name.join(GITIGNORE));
    let yamignore =
        super::file::find_or_create_source_file(ctx, &directory_name.join(YAMIGNORE));
    data.files = vec![gitignore, yamignore];

    let name: PathBuf = directory_name.join(NODE_LEAF);
    let id = ctx.nodes.add(node::Node::new(
        name,
        node::NodeKind::DotIgnore(data),
    ));

    // The ignore files dirty the dot-ignore node; the dot-ignore node
    // dirties the directory (and, via the protocol hook, the subtree).
    ctx.add_dependant(gitignore, id);
    ctx.add_dependant(yamignore, id);
    ctx.add_dependant(id, directory);

    id
}

/// Removes a dot-ignore node and its ignore-file nodes from the context.
pub fn remove(ctx: &mut ExecutionContext, id: NodeId) {
    let files = match &ctx.nodes[id].kind {
        node::NodeKind::DotIgnore(data) => data.files.clone(),
        _ => unreachable!("dot-ignore access on wrong node kind"),
    };
    for f in files {
        ctx.nodes.remove_if_present(f);
    }
    ctx.nodes.remove_if_present(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_patterns_from_both_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(GITIGNORE), "*.tmp\n").unwrap();
        fs::write(dir.path().join(YAMIGNORE), "scratch/\n").unwrap();

        let matcher = parse_ignore_files(dir.path()).expect("matcher");

        assert!(matcher
            .matched(dir.path().join("foo.tmp"), false)
            .is_ignore());
        assert!(matcher
            .matched(dir.path().join("scratch"), true)
            .is_ignore());
        assert!(!matcher
            .matched(dir.path().join("foo.cpp"), false)
            .is_ignore());
    }

    #[test]
    fn no_ignore_files_means_no_matcher() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse_ignore_files(dir.path()).is_none());
    }

    #[test]
    fn ignore_file_names_are_recognized() {
        assert!(DotIgnoreData::is_ignore_file(Path::new(".gitignore")));
        assert!(DotIgnoreData::is_ignore_file(Path::new(".yamignore")));
        assert!(!DotIgnoreData::is_ignore_file(Path::new("gitignore")));
    }
}
