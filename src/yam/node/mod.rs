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

//! The node graph and its uniform execution protocol.
//!
//! Every build entity is a node in one table, keyed by its symbolic path.
//! Nodes execute through the same phase machine: prerequisites run first,
//! then the node's own work on a worker thread, then any pre-commit nodes
//! learned by that work, then the post-requisites. All state transitions
//! happen on the main thread; worker results are posted back as actions on
//! the main dispatcher.

pub mod buildfile;
pub mod command;
pub mod directory;
pub mod dotignore;
pub mod file;
pub mod group;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::logbook::LogRecord;

pub use self::buildfile::{CompilerData, ParserData};
pub use self::command::CommandData;
pub use self::directory::DirectoryData;
pub use self::dotignore::DotIgnoreData;
pub use self::file::{FileData, FileKind};
pub use self::group::GroupData;

/// Handle to a node in the node table. Stable for the lifetime of the node
/// within one context; not persisted (the store assigns its own keys).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// A placeholder id used while wiring mutually referencing nodes.
    /// Must be overwritten before use.
    pub(crate) fn dangling() -> NodeId {
        NodeId(u32::max_value())
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> NodeId {
        NodeId(raw)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The lifecycle state of a node.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
pub enum NodeState {
    /// Must (re-)execute.
    Dirty,
    /// Execution in progress.
    Executing,
    /// Last execution succeeded.
    Ok,
    /// Last execution errored.
    Failed,
    /// Last execution was aborted.
    Canceled,
    /// Pending removal from the persistent state.
    Deleted,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        match self {
            NodeState::Ok
            | NodeState::Failed
            | NodeState::Canceled
            | NodeState::Deleted => true,
            NodeState::Dirty | NodeState::Executing => false,
        }
    }
}

/// The phase a node is in while executing. Only meaningful when the node
/// state is `Executing`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExecutionPhase {
    Idle,
    Suspended,
    Prerequisites,
    SelfExecution,
    PreCommit,
    Postrequisites,
}

/// Per-execution bookkeeping. Reset when the node completes.
#[derive(Default)]
pub struct ExecBookkeeping {
    pub prerequisites: Vec<NodeId>,
    pub precommits: Vec<NodeId>,
    pub postrequisites: Vec<NodeId>,
    pub n_executing_prerequisites: usize,
    pub n_executing_precommits: usize,
    pub n_executing_postrequisites: usize,
    pub self_result: Option<SelfResult>,
}

/// Variant payload of a node.
pub enum NodeKind {
    SourceFile(FileData),
    GeneratedFile(FileData),
    Directory(DirectoryData),
    DotIgnore(DotIgnoreData),
    Command(CommandData),
    Group(GroupData),
    BuildFileParser(ParserData),
    BuildFileCompiler(CompilerData),
}

/// Discriminant of a node's variant, for dispatch without holding a borrow
/// of the payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KindTag {
    SourceFile,
    GeneratedFile,
    Directory,
    DotIgnore,
    Command,
    Group,
    BuildFileParser,
    BuildFileCompiler,
}

impl NodeKind {
    pub fn tag(&self) -> KindTag {
        match self {
            NodeKind::SourceFile(_) => KindTag::SourceFile,
            NodeKind::GeneratedFile(_) => KindTag::GeneratedFile,
            NodeKind::Directory(_) => KindTag::Directory,
            NodeKind::DotIgnore(_) => KindTag::DotIgnore,
            NodeKind::Command(_) => KindTag::Command,
            NodeKind::Group(_) => KindTag::Group,
            NodeKind::BuildFileParser(_) => KindTag::BuildFileParser,
            NodeKind::BuildFileCompiler(_) => KindTag::BuildFileCompiler,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::SourceFile(_) => "source file",
            NodeKind::GeneratedFile(_) => "generated file",
            NodeKind::Directory(_) => "directory",
            NodeKind::DotIgnore(_) => "dot-ignore",
            NodeKind::Command(_) => "command",
            NodeKind::Group(_) => "group",
            NodeKind::BuildFileParser(_) => "buildfile parser",
            NodeKind::BuildFileCompiler(_) => "buildfile compiler",
        }
    }
}

/// A node: symbolic name, state, edges, and the variant payload.
pub struct Node {
    name: PathBuf,
    pub state: NodeState,
    pub phase: ExecutionPhase,
    pub suspended: bool,
    pub canceling: bool,
    pub modified: bool,

    /// Nodes that have this node as a prerequisite or pre-commit node.
    /// Completion callbacks and dirtiness propagate along these.
    pub dependants: BTreeSet<NodeId>,

    /// Nodes that have this node as a post-requisite.
    pub post_parents: BTreeSet<NodeId>,

    pub exec: ExecBookkeeping,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(name: PathBuf, kind: NodeKind) -> Node {
        Node {
            name,
            state: NodeState::Dirty,
            phase: ExecutionPhase::Idle,
            suspended: false,
            canceling: false,
            modified: true,
            dependants: BTreeSet::new(),
            post_parents: BTreeSet::new(),
            exec: ExecBookkeeping::default(),
            kind,
        }
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Renames the node in place. Only deserialization does this; the
    /// caller must keep the node table's name index consistent.
    pub(crate) fn set_name(&mut self, name: PathBuf) {
        self.name = name;
    }

    pub fn busy(&self) -> bool {
        self.state == NodeState::Executing
    }
}

/// The node table: a slab of nodes indexed by `NodeId`, plus the symbolic
/// path index. Owned by the execution context; main-thread only.
///
/// Ids are never reused within a context, so a stale id can be detected
/// (e.g. by the persistent state's diffing) rather than silently aliasing
/// a newer node.
#[derive(Default)]
pub struct NodeSet {
    slots: Vec<Option<Node>>,
    index: HashMap<PathBuf, NodeId>,
}

impl NodeSet {
    pub fn new() -> NodeSet {
        NodeSet::default()
    }

    /// Adds a node. The symbolic name must not already be present.
    pub fn add(&mut self, node: Node) -> NodeId {
        assert!(
            !self.index.contains_key(&node.name),
            "duplicate node name {:?}",
            node.name
        );

        let id = self.add_placeholder(node);
        let name = self[id].name.clone();
        self.index.insert(name, id);
        id
    }

    /// Adds an anonymous placeholder; the name index entry is added later
    /// during `restore`. Used by deserialization, where a node's fields
    /// (including its name) arrive after the node object must already exist
    /// to resolve shared references.
    pub fn add_placeholder(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(node));
        id
    }

    /// Registers the node's current name in the path index.
    pub fn register_name(&mut self, id: NodeId) {
        let name = self[id].name.clone();
        let previous = self.index.insert(name, id);
        assert!(
            previous.is_none() || previous == Some(id),
            "conflicting node name {:?}",
            self[id].name
        );
    }

    /// Drops a name from the path index without removing the node. Only
    /// deserialization-in-place (rollback) does this.
    pub fn unregister_name(&mut self, name: &Path) {
        self.index.remove(name);
    }

    pub fn remove(&mut self, id: NodeId) -> Node {
        let node = self.slots[id.0 as usize]
            .take()
            .expect("removing vacant node slot");
        self.index.remove(&node.name);
        node
    }

    pub fn remove_if_present(&mut self, id: NodeId) -> Option<Node> {
        if self.contains(id) {
            Some(self.remove(id))
        } else {
            None
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map_or(false, Option::is_some)
    }

    pub fn find(&self, name: &Path) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.index.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|node| (NodeId(i as u32), node))
        })
    }

    /// Ids of nodes satisfying a predicate.
    pub fn find_where<F>(&self, mut pred: F) -> Vec<NodeId>
    where
        F: FnMut(&Node) -> bool,
    {
        self.iter()
            .filter(|(_, node)| pred(node))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}

impl Index<NodeId> for NodeSet {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("vacant node slot")
    }
}

impl IndexMut<NodeId> for NodeSet {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("vacant node slot")
    }
}

/// The outcome of a node's Self phase, produced on a worker thread and
/// applied on the main thread.
pub enum SelfResult {
    File(file::FileSelfResult),
    Directory(directory::DirectorySelfResult),
    DotIgnore(dotignore::DotIgnoreSelfResult),
    Command(command::CommandSelfResult),
    Parser(buildfile::ParserSelfResult),
    Compiler(buildfile::CompilerSelfResult),
}

impl SelfResult {
    pub fn new_state(&self) -> NodeState {
        match self {
            SelfResult::File(r) => r.new_state,
            SelfResult::Directory(r) => r.new_state,
            SelfResult::DotIgnore(r) => r.new_state,
            SelfResult::Command(r) => r.new_state,
            SelfResult::Parser(r) => r.new_state,
            SelfResult::Compiler(r) => r.new_state,
        }
    }
}

// The uniform execution protocol. Graph mutations and state transitions
// happen here, on the main thread only.
impl ExecutionContext {
    /// Begins execution of a dirty node.
    pub fn start(&mut self, id: NodeId) {
        {
            let node = &self.nodes[id];
            assert!(!node.busy(), "start() while busy: {:?}", node.name());
            assert!(
                node.state == NodeState::Dirty,
                "start() while not dirty: {:?}",
                node.name()
            );
        }

        self.statistics.register_started(id);
        self.set_node_state(id, NodeState::Executing);

        if self.nodes[id].suspended {
            self.nodes[id].phase = ExecutionPhase::Suspended;
        } else {
            self.continue_start(id);
        }
    }

    /// May only be invoked when the node is not executing. Gates the
    /// transition out of the `Suspended` phase.
    pub fn suspend(&mut self, id: NodeId) {
        assert!(
            !self.nodes[id].busy(),
            "suspend() while busy: {:?}",
            self.nodes[id].name()
        );
        self.nodes[id].suspended = true;
    }

    pub fn resume(&mut self, id: NodeId) {
        self.nodes[id].suspended = false;
        if self.nodes[id].phase == ExecutionPhase::Suspended {
            self.continue_start(id);
        }
    }

    /// Signals the node to abort. Cascades to the children of the current
    /// phase. Cancelling an idle node is a no-op.
    pub fn cancel(&mut self, id: NodeId) {
        if !self.nodes.contains(id) || !self.nodes[id].busy() {
            return;
        }
        if self.nodes[id].canceling {
            return;
        }
        self.nodes[id].canceling = true;

        match self.nodes[id].phase {
            ExecutionPhase::Idle => {}
            ExecutionPhase::Suspended => {
                self.post_completion(id, NodeState::Canceled);
            }
            ExecutionPhase::Prerequisites => {
                for child in self.nodes[id].exec.prerequisites.clone() {
                    self.cancel(child);
                }
            }
            ExecutionPhase::PreCommit => {
                for child in self.nodes[id].exec.precommits.clone() {
                    self.cancel(child);
                }
            }
            ExecutionPhase::Postrequisites => {
                for child in self.nodes[id].exec.postrequisites.clone() {
                    self.cancel(child);
                }
            }
            ExecutionPhase::SelfExecution => {
                self.cancel_self(id);
            }
        }
    }

    fn continue_start(&mut self, id: NodeId) {
        if self.nodes[id].state == NodeState::Deleted {
            self.post_completion(id, NodeState::Deleted);
        } else {
            self.start_prerequisites(id);
        }
    }

    fn start_prerequisites(&mut self, id: NodeId) {
        self.nodes[id].phase = ExecutionPhase::Prerequisites;

        let prerequisites = self.prerequisites_of(id);
        self.nodes[id].exec.prerequisites = prerequisites.clone();
        self.nodes[id].exec.n_executing_prerequisites = 0;

        for p in prerequisites {
            match self.nodes[p].state {
                NodeState::Dirty => {
                    self.nodes[id].exec.n_executing_prerequisites += 1;
                    self.start(p);
                }
                NodeState::Executing => {
                    // Multiply referenced node, already started by another
                    // executor. Wait for its completion callback.
                    self.nodes[id].exec.n_executing_prerequisites += 1;
                }
                _ => {}
            }
        }

        if self.nodes[id].exec.n_executing_prerequisites == 0 {
            self.handle_prerequisites_completion(id);
        }
    }

    /// Called on every dependant when a node completes. Dependants outside
    /// the build scope ignore the callback via the phase check.
    pub(crate) fn handle_prerequisite_completion(
        &mut self,
        id: NodeId,
        prerequisite: NodeId,
    ) {
        if self.nodes[id].phase != ExecutionPhase::Prerequisites {
            return;
        }
        if !self.nodes[id].exec.prerequisites.contains(&prerequisite) {
            return;
        }

        assert!(
            self.nodes[id].exec.n_executing_prerequisites > 0,
            "prerequisite completion underflow"
        );
        self.nodes[id].exec.n_executing_prerequisites -= 1;

        let preq_state = self.nodes[prerequisite].state;
        assert!(
            preq_state.is_terminal(),
            "completed prerequisite in non-terminal state"
        );

        if preq_state != NodeState::Ok && !self.log_book().keep_working() {
            self.cancel(id);
        }

        if self.nodes[id].exec.n_executing_prerequisites == 0 {
            self.handle_prerequisites_completion(id);
        }
    }

    fn handle_prerequisites_completion(&mut self, id: NodeId) {
        if self.nodes[id].canceling {
            self.post_completion(id, NodeState::Canceled);
        } else if !self.all_ok(&self.nodes[id].exec.prerequisites.clone()) {
            self.post_completion(id, NodeState::Failed);
        } else if self.pending_start_self(id) {
            self.nodes[id].phase = ExecutionPhase::SelfExecution;
            self.start_self(id);
        } else {
            self.start_postrequisites(id);
        }
    }

    /// Delivers a worker's Self result back into the phase machine.
    pub(crate) fn handle_self_completion(
        &mut self,
        id: NodeId,
        result: SelfResult,
    ) {
        if !self.nodes.contains(id)
            || self.nodes[id].phase != ExecutionPhase::SelfExecution
        {
            // The node was removed or reset while its work was in flight.
            return;
        }

        let new_state = result.new_state();
        self.nodes[id].exec.self_result = Some(result);

        if new_state == NodeState::Ok {
            self.start_precommit_nodes(id);
        } else {
            let state = self.commit_self(id);
            self.notify_completion(id, state);
        }
    }

    fn start_precommit_nodes(&mut self, id: NodeId) {
        self.nodes[id].phase = ExecutionPhase::PreCommit;

        let precommits = self.precommits_of(id);
        self.nodes[id].exec.precommits = precommits.clone();
        self.nodes[id].exec.n_executing_precommits = 0;

        for p in &precommits {
            self.add_dependant(*p, id);
        }

        for p in precommits {
            match self.nodes[p].state {
                NodeState::Dirty => {
                    self.nodes[id].exec.n_executing_precommits += 1;
                    self.start(p);
                }
                NodeState::Executing => {
                    self.nodes[id].exec.n_executing_precommits += 1;
                }
                _ => {}
            }
        }

        if self.nodes[id].exec.n_executing_precommits == 0 {
            self.handle_precommits_completion(id);
        }
    }

    pub(crate) fn handle_precommit_node_completion(
        &mut self,
        id: NodeId,
        precommit: NodeId,
    ) {
        if self.nodes[id].phase != ExecutionPhase::PreCommit {
            return;
        }
        if !self.nodes[id].exec.precommits.contains(&precommit) {
            return;
        }

        assert!(
            self.nodes[id].exec.n_executing_precommits > 0,
            "pre-commit completion underflow"
        );
        self.nodes[id].exec.n_executing_precommits -= 1;

        let state = self.nodes[precommit].state;
        assert!(
            state.is_terminal(),
            "completed pre-commit node in non-terminal state"
        );

        if state != NodeState::Ok && !self.log_book().keep_working() {
            self.cancel(id);
        }

        if self.nodes[id].exec.n_executing_precommits == 0 {
            self.handle_precommits_completion(id);
        }
    }

    fn handle_precommits_completion(&mut self, id: NodeId) {
        if self.nodes[id].canceling {
            self.post_completion(id, NodeState::Canceled);
        } else if !self.all_ok(&self.nodes[id].exec.precommits.clone()) {
            self.post_completion(id, NodeState::Failed);
        } else {
            let state = self.commit_self(id);
            if state != NodeState::Ok {
                self.post_completion(id, state);
            } else {
                self.start_postrequisites(id);
            }
        }
    }

    fn start_postrequisites(&mut self, id: NodeId) {
        self.nodes[id].phase = ExecutionPhase::Postrequisites;

        let postrequisites = self.postrequisites_of(id);
        self.nodes[id].exec.postrequisites = postrequisites.clone();
        self.nodes[id].exec.n_executing_postrequisites = 0;

        for p in postrequisites {
            match self.nodes[p].state {
                NodeState::Dirty => {
                    self.nodes[id].exec.n_executing_postrequisites += 1;
                    self.start(p);
                }
                NodeState::Executing => {
                    self.nodes[id].exec.n_executing_postrequisites += 1;
                }
                _ => {}
            }
        }

        if self.nodes[id].exec.n_executing_postrequisites == 0 {
            self.handle_postrequisites_completion(id);
        }
    }

    pub(crate) fn handle_postrequisite_completion(
        &mut self,
        id: NodeId,
        postrequisite: NodeId,
    ) {
        if self.nodes[id].phase != ExecutionPhase::Postrequisites {
            return;
        }
        if !self.nodes[id]
            .exec
            .postrequisites
            .contains(&postrequisite)
        {
            return;
        }

        assert!(
            self.nodes[id].exec.n_executing_postrequisites > 0,
            "post-requisite completion underflow"
        );
        self.nodes[id].exec.n_executing_postrequisites -= 1;

        let state = self.nodes[postrequisite].state;
        assert!(
            state.is_terminal(),
            "completed post-requisite in non-terminal state"
        );

        if state != NodeState::Ok && !self.log_book().keep_working() {
            self.cancel(id);
        }

        if self.nodes[id].exec.n_executing_postrequisites == 0 {
            self.handle_postrequisites_completion(id);
        }
    }

    fn handle_postrequisites_completion(&mut self, id: NodeId) {
        if self.nodes[id].canceling {
            self.post_completion(id, NodeState::Canceled);
        } else if !self.all_ok(&self.nodes[id].exec.postrequisites.clone()) {
            self.post_completion(id, NodeState::Failed);
        } else {
            self.post_completion(id, NodeState::Ok);
        }
    }

    /// Defers completion through the main queue. Keeps deep dependency
    /// chains from recursing and serializes completions in arrival order.
    pub(crate) fn post_completion(&mut self, id: NodeId, state: NodeState) {
        self.main_queue()
            .push(Box::new(move |ctx: &mut ExecutionContext| {
                ctx.notify_completion(id, state);
            }));
    }

    /// Resets bookkeeping, applies the terminal state and notifies all
    /// observers.
    pub(crate) fn notify_completion(&mut self, id: NodeId, state: NodeState) {
        if !self.nodes.contains(id) {
            return;
        }

        let (dependants, post_parents) = {
            let node = &mut self.nodes[id];
            node.phase = ExecutionPhase::Idle;
            node.canceling = false;
            node.exec = ExecBookkeeping::default();
            (
                node.dependants.iter().copied().collect::<Vec<_>>(),
                node.post_parents.iter().copied().collect::<Vec<_>>(),
            )
        };

        self.set_node_state(id, state);

        for d in dependants {
            if self.nodes.contains(d) {
                self.handle_prerequisite_completion(d, id);
                self.handle_precommit_node_completion(d, id);
            }
        }
        for p in post_parents {
            if self.nodes.contains(p) {
                self.handle_postrequisite_completion(p, id);
            }
        }

        self.fire_completion_observers(id, state);
    }

    /// Sets a node state. Transitioning to `Dirty` propagates to every
    /// dependant transitively; a dot-ignore node turning dirty additionally
    /// dirties its whole owning directory subtree, since ignore precedence
    /// affects all descendants.
    pub fn set_node_state(&mut self, id: NodeId, new_state: NodeState) {
        if !self.nodes.contains(id) || self.nodes[id].state == new_state {
            return;
        }
        self.nodes[id].state = new_state;
        if new_state == NodeState::Dirty {
            let mut stack: Vec<NodeId> =
                self.nodes[id].dependants.iter().copied().collect();
            self.push_dirty_subtree(id, &mut stack);
            self.propagate_dirty(&mut stack);
        }
    }

    fn propagate_dirty(&mut self, stack: &mut Vec<NodeId>) {
        while let Some(current) = stack.pop() {
            let node = match self.nodes.get_mut(current) {
                Some(node) => node,
                None => continue,
            };
            if node.state == NodeState::Dirty || node.busy() {
                continue;
            }
            node.state = NodeState::Dirty;
            let dependants: Vec<_> = node.dependants.iter().copied().collect();
            stack.extend(dependants);
            self.push_dirty_subtree(current, stack);
        }
    }

    /// Ignore precedence: when a dot-ignore node turns dirty, every node in
    /// its owning directory subtree must be revisited.
    fn push_dirty_subtree(&mut self, id: NodeId, stack: &mut Vec<NodeId>) {
        let directory = match &self.nodes[id].kind {
            NodeKind::DotIgnore(data) => data.directory,
            _ => return,
        };

        if self
            .log_book()
            .must_log_aspect(crate::logbook::LogAspect::FileChanges)
        {
            let message = match self.nodes.get(directory) {
                Some(dir) => format!(
                    "ignore patterns changed below {:?}",
                    dir.name()
                ),
                None => "ignore patterns changed".to_string(),
            };
            self.log(LogRecord::new(
                crate::logbook::LogAspect::FileChanges,
                message,
            ));
        }

        let mut dirs = vec![directory];
        while let Some(d) = dirs.pop() {
            stack.push(d);
            if let Some(node) = self.nodes.get(d) {
                if let NodeKind::Directory(data) = &node.kind {
                    dirs.extend(data.content.values().copied());
                }
            }
        }
    }

    /// Marks a directory node and every node below it dirty, with normal
    /// dependant propagation. Used by the watcher for removed subtrees and
    /// for queue overflow.
    pub fn mark_subtree_dirty(&mut self, id: NodeId) {
        let mut stack = Vec::new();
        let mut dirs = vec![id];
        while let Some(d) = dirs.pop() {
            stack.push(d);
            if let Some(node) = self.nodes.get(d) {
                if let NodeKind::Directory(data) = &node.kind {
                    dirs.extend(data.content.values().copied());
                    dirs.push(data.dot_ignore);
                }
            }
        }
        self.propagate_dirty(&mut stack);
    }

    /// Registers `dependant` as an observer of `of`. Dirtiness and
    /// completion callbacks flow from `of` to `dependant`.
    pub fn add_dependant(&mut self, of: NodeId, dependant: NodeId) {
        self.nodes[of].dependants.insert(dependant);
    }

    pub fn remove_dependant(&mut self, of: NodeId, dependant: NodeId) {
        self.nodes[of].dependants.remove(&dependant);
    }

    pub fn add_post_parent(&mut self, of: NodeId, parent: NodeId) {
        self.nodes[of].post_parents.insert(parent);
    }

    pub fn remove_post_parent(&mut self, of: NodeId, parent: NodeId) {
        self.nodes[of].post_parents.remove(&parent);
    }

    fn all_ok(&self, nodes: &[NodeId]) -> bool {
        nodes
            .iter()
            .all(|&n| self.nodes[n].state == NodeState::Ok)
    }

    // Kind dispatch.

    fn prerequisites_of(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::SourceFile(_) => Vec::new(),
            NodeKind::GeneratedFile(data) => {
                data.producer.into_iter().collect()
            }
            NodeKind::Directory(data) => vec![data.dot_ignore],
            NodeKind::DotIgnore(data) => data.files.clone(),
            NodeKind::Command(data) => data.prerequisites(),
            NodeKind::Group(data) => data.members.clone(),
            NodeKind::BuildFileParser(data) => vec![data.buildfile],
            NodeKind::BuildFileCompiler(data) => data.prerequisites(),
        }
    }

    fn postrequisites_of(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Directory(data) => {
                data.content.values().copied().collect()
            }
            _ => Vec::new(),
        }
    }

    fn pending_start_self(&mut self, id: NodeId) -> bool {
        match self.nodes[id].kind.tag() {
            // File hashes may be stale whenever the node is dirty.
            KindTag::SourceFile | KindTag::GeneratedFile => true,
            KindTag::Directory => true,
            KindTag::DotIgnore => dotignore::pending_start_self(self, id),
            KindTag::Command => command::pending_start_self(self, id),
            KindTag::Group => false,
            KindTag::BuildFileParser => {
                buildfile::parser_pending_start_self(self, id)
            }
            KindTag::BuildFileCompiler => {
                buildfile::compiler_pending_start_self(self, id)
            }
        }
    }

    fn start_self(&mut self, id: NodeId) {
        self.statistics.register_self_executed(id);
        match self.nodes[id].kind.tag() {
            KindTag::SourceFile | KindTag::GeneratedFile => {
                file::start_self(self, id)
            }
            KindTag::Directory => directory::start_self(self, id),
            KindTag::DotIgnore => dotignore::start_self(self, id),
            KindTag::Command => command::start_self(self, id),
            KindTag::Group => unreachable!("groups have no self work"),
            KindTag::BuildFileParser => {
                buildfile::parser_start_self(self, id)
            }
            KindTag::BuildFileCompiler => {
                buildfile::compiler_start_self(self, id)
            }
        }
    }

    fn cancel_self(&mut self, id: NodeId) {
        if let NodeKind::Command(data) = &self.nodes[id].kind {
            data.cancel_running();
        }
        // Other kinds observe cancellation at the next phase boundary.
    }

    /// Pre-commit nodes derived from the stashed Self result. May create
    /// nodes (e.g. newly discovered command inputs).
    fn precommits_of(&mut self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id].kind.tag() {
            KindTag::Command => command::precommit_nodes(self, id),
            _ => Vec::new(),
        }
    }

    /// Applies the stashed Self result to the node's fields. Returns the
    /// state the execution finishes with.
    fn commit_self(&mut self, id: NodeId) -> NodeState {
        let result = self.nodes[id]
            .exec
            .self_result
            .take()
            .expect("commit without a self result");

        match result {
            SelfResult::File(r) => file::commit_self(self, id, r),
            SelfResult::Directory(r) => directory::commit_self(self, id, r),
            SelfResult::DotIgnore(r) => dotignore::commit_self(self, id, r),
            SelfResult::Command(r) => command::commit_self(self, id, r),
            SelfResult::Parser(r) => buildfile::parser_commit_self(self, id, r),
            SelfResult::Compiler(r) => {
                buildfile::compiler_commit_self(self, id, r)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(name: &str) -> Node {
        Node::new(
            PathBuf::from(name),
            NodeKind::SourceFile(FileData::new(FileKind::Source)),
        )
    }

    #[test]
    fn node_set_add_find_remove() {
        let mut set = NodeSet::new();
        let a = set.add(file_node("repo/a.c"));
        let b = set.add(file_node("repo/b.c"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.find(Path::new("repo/a.c")), Some(a));
        assert_eq!(set.find(Path::new("repo/b.c")), Some(b));
        assert_eq!(set.find(Path::new("repo/c.c")), None);

        set.remove(a);
        assert_eq!(set.find(Path::new("repo/a.c")), None);
        assert!(!set.contains(a));
        assert!(set.contains(b));

        // Ids are never reused; the removed id stays dead.
        let c = set.add(file_node("repo/c.c"));
        assert_ne!(a, c);
        assert!(!set.contains(a));
        assert_eq!(set.find(Path::new("repo/c.c")), Some(c));
        assert_eq!(set.len(), 2);
    }

    #[test]
    #[should_panic(expected = "duplicate node name")]
    fn node_set_rejects_duplicates() {
        let mut set = NodeSet::new();
        set.add(file_node("repo/a.c"));
        set.add(file_node("repo/a.c"));
    }

    #[test]
    fn new_nodes_start_dirty_and_modified() {
        let node = file_node("repo/a.c");
        assert_eq!(node.state, NodeState::Dirty);
        assert_eq!(node.phase, ExecutionPhase::Idle);
        assert!(node.modified);
        assert!(!node.busy());
    }

    #[test]
    fn terminal_states() {
        assert!(NodeState::Ok.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(NodeState::Canceled.is_terminal());
        assert!(NodeState::Deleted.is_terminal());
        assert!(!NodeState::Dirty.is_terminal());
        assert!(!NodeState::Executing.is_terminal());
    }
}
