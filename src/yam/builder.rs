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

//! The builder: orchestrates one build from request to result.
//!
//! A build runs in phases, each executed as one ephemeral scope group over
//! the dirty nodes of one kind: the mirror phase refreshes directory and
//! file nodes, the parser phase re-parses changed build files, the compiler
//! phase re-materializes command nodes (with a cycle check over the
//! build-file dependency edges first), and the command phase runs the dirty
//! commands. On success the persistent state commits.
//!
//! The builder owns the main-thread loop: it pumps the context's main
//! dispatcher until the current scope completes. Cancellation arrives as an
//! action pushed onto that same dispatcher from another thread.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::dispatch::DispatcherFrame;
use crate::error::{Error, ResultExt, RuleViolation};
use crate::logbook::{LogAspect, LogBook, LogRecord};
use crate::node::{
    buildfile, directory, group, NodeId, NodeKind, NodeState,
};
use crate::repo::{self, FileRepository, RepoKind};
use crate::storage::PersistentBuildState;
use crate::watch;

/// What a client asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestKind {
    /// Create the `.yam` state directory.
    Init,
    /// Execute the dirty nodes in scope.
    Build,
    /// Delete generated files and reset command state.
    Clean,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BuildRequest {
    pub kind: RequestKind,

    /// The directory the request was issued from.
    pub directory: PathBuf,

    /// Optional scope restriction (carried, not yet interpreted).
    pub scope_paths: Vec<PathBuf>,
}

impl BuildRequest {
    pub fn new(kind: RequestKind, directory: PathBuf) -> BuildRequest {
        BuildRequest {
            kind,
            directory,
            scope_paths: Vec::new(),
        }
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq,
)]
pub enum BuildResultState {
    Ok,
    Failed,
    Canceled,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BuildResult {
    pub state: BuildResultState,

    /// Nodes started / nodes whose Self phase actually ran.
    pub n_started: usize,
    pub n_self_executed: usize,

    /// Command scripts that actually ran.
    pub n_commands_executed: usize,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BuildResult {
    fn begun() -> BuildResult {
        BuildResult {
            state: BuildResultState::Failed,
            n_started: 0,
            n_self_executed: 0,
            n_commands_executed: 0,
            start_time: Utc::now(),
            end_time: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == BuildResultState::Ok
    }
}

/// Cancels the in-flight build from another thread by pushing a cancel
/// action onto the main dispatcher.
#[derive(Clone)]
pub struct CancelHandle {
    main_queue: Arc<crate::dispatch::Dispatcher<crate::context::MainAction>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.main_queue.push(Box::new(|ctx: &mut ExecutionContext| {
            if let Some(scope) = ctx.build_scope() {
                ctx.cancel(scope);
            }
        }));
    }
}

pub struct Builder {
    context: ExecutionContext,
    home_dir: Option<PathBuf>,
    storage: Option<PersistentBuildState>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            context: ExecutionContext::new(),
            home_dir: None,
            storage: None,
        }
    }

    pub fn with_log_book(log_book: Arc<dyn LogBook>) -> Builder {
        Builder {
            context: ExecutionContext::with_log_book(log_book),
            home_dir: None,
            storage: None,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    pub fn home_dir(&self) -> Option<&Path> {
        self.home_dir.as_deref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            main_queue: self.context.main_queue(),
        }
    }

    /// Handles one request start to finish. Runs on the main thread.
    pub fn handle(&mut self, request: BuildRequest) -> BuildResult {
        let mut result = BuildResult::begun();

        let outcome = match request.kind {
            RequestKind::Init => self.init(&request.directory, true),
            RequestKind::Build => self.build(&request, &mut result),
            RequestKind::Clean => self.clean(&request),
        };

        match outcome {
            Ok(state) => result.state = state,
            Err(err) => {
                self.context.log(LogRecord::error(format!("{}", err)));
                result.state = BuildResultState::Failed;
            }
        }

        result.n_started = self.context.statistics.n_started();
        result.n_self_executed = self.context.statistics.n_self_executed();
        result.end_time = Utc::now();

        if self
            .context
            .log_book()
            .must_log_aspect(LogAspect::Performance)
        {
            self.context.log(LogRecord::new(
                LogAspect::Performance,
                format!(
                    "{} node(s) started, {} executed, {} command(s) ran",
                    result.n_started,
                    result.n_self_executed,
                    result.n_commands_executed,
                ),
            ));
        }

        result
    }

    /// Creates the `.yam` directory and the home repository.
    fn init(
        &mut self,
        directory: &Path,
        fail_if_initialized: bool,
    ) -> Result<BuildResultState, Error> {
        if let Some(home) = repo::find_dot_yam(directory) {
            if fail_if_initialized {
                return Err(failure::format_err!(
                    "a .yam directory already exists in {:?}",
                    home
                ));
            }
            self.open_home(&home)?;
            return Ok(BuildResultState::Ok);
        }

        std::fs::create_dir_all(directory.join(repo::DOT_YAM))
            .with_context(|_| {
                format!("could not create {:?}", directory.join(repo::DOT_YAM))
            })?;
        self.open_home(directory)?;
        Ok(BuildResultState::Ok)
    }

    /// Opens the home repository: the persistent state, the repositories
    /// config, the mirror roots and the watchers.
    fn open_home(&mut self, home: &Path) -> Result<(), Error> {
        if self.home_dir.as_deref() == Some(home) {
            return Ok(());
        }

        let log_book = self.context.log_book_arc();
        let log = move |record| log_book.add(record);

        let mut storage =
            PersistentBuildState::open(&repo::build_state_dir(home), &log)?;
        if !storage.is_empty() {
            storage.retrieve(&mut self.context)?;
        }

        self.home_dir = Some(home.to_path_buf());
        self.storage = Some(storage);

        // The home repository, unless the retrieved state brought it back.
        let home_name = repo::repository_name(home)?;
        if self.context.find_repository(&home_name).is_none() {
            let mut excludes = FileRepository::default_excludes();
            excludes.add(crate::aspect::RegexSet::match_directory(
                "generated",
            ))?;
            self.context.add_repository(FileRepository::new(
                &home_name,
                home.to_path_buf(),
                RepoKind::Integrated,
                excludes,
            ));
        }

        self.sync_repositories_config()?;
        self.ensure_mirrors()?;

        Ok(())
    }

    /// Reads `yamConfig/repos.txt` and syncs the repository registry.
    fn sync_repositories_config(&mut self) -> Result<(), Error> {
        let home = match &self.home_dir {
            Some(home) => home.clone(),
            None => return Ok(()),
        };
        let home_name = repo::repository_name(&home)?;

        let config_path =
            home.join(repo::CONFIG_DIR).join(repo::REPOSITORIES_FILE);
        let entries = if config_path.is_file() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|_| {
                    format!("could not read {:?}", config_path)
                })?;
            repo::parse_repositories_config(
                &content,
                &config_path.to_string_lossy(),
                &home,
            )?
        } else {
            Vec::new()
        };

        for entry in &entries {
            if !entry.directory.is_dir() {
                return Err(failure::format_err!(
                    "repository {:?}: directory {:?} does not exist",
                    entry.name,
                    entry.directory
                ));
            }

            match self.context.find_repository_mut(&entry.name) {
                Some(existing) => {
                    if existing.directory != entry.directory
                        || existing.kind != entry.kind
                        || existing.inputs != entry.inputs
                    {
                        existing.directory = entry.directory.clone();
                        existing.kind = entry.kind;
                        existing.inputs = entry.inputs.clone();
                        existing.modified = true;
                    }
                }
                None => {
                    let mut repository = FileRepository::new(
                        &entry.name,
                        entry.directory.clone(),
                        entry.kind,
                        FileRepository::default_excludes(),
                    );
                    repository.inputs = entry.inputs.clone();
                    self.context.add_repository(repository);
                }
            }
        }

        // Repositories that vanished from the config (except home).
        let configured: Vec<String> =
            entries.iter().map(|e| e.name.clone()).collect();
        for name in self.context.repository_names() {
            if name != home_name && !configured.contains(&name) {
                if let Some(removed) = self.context.remove_repository(&name)
                {
                    if let Some(root) = removed.root_node {
                        self.context.mark_subtree_dirty(root);
                    }
                }
            }
        }

        Ok(())
    }

    /// Gives every non-ignored repository a mirror root and a watcher.
    fn ensure_mirrors(&mut self) -> Result<(), Error> {
        let names = self.context.repository_names();
        for name in names {
            let (kind, has_root) = {
                let repository = self
                    .context
                    .find_repository(&name)
                    .expect("repository exists");
                (repository.kind, repository.root_node.is_some())
            };
            if kind == RepoKind::Ignored {
                continue;
            }

            if !has_root {
                let root = directory::create_directory_node(
                    &mut self.context,
                    Path::new(&name),
                    None,
                );
                let repository = self
                    .context
                    .find_repository_mut(&name)
                    .expect("repository exists");
                repository.root_node = Some(root);
                repository.modified = true;
            }

            self.context
                .find_repository_mut(&name)
                .expect("repository exists")
                .start_watching()?;
        }
        Ok(())
    }

    /// Runs an incremental build.
    fn build(
        &mut self,
        request: &BuildRequest,
        result: &mut BuildResult,
    ) -> Result<BuildResultState, Error> {
        self.init(&request.directory, false)?;
        self.sync_repositories_config()?;
        self.ensure_mirrors()?;

        // Apply actions queued while idle (e.g. stale cancellations) before
        // a scope exists for them to hit.
        let queue = self.context.main_queue();
        while let Some(action) = queue.try_pop() {
            action(&mut self.context);
        }

        self.context.statistics.reset();
        self.context.set_build_request(Some(request.clone()));

        let commands_before = self.commands_executed();

        let state = self.build_phases();

        self.context.set_build_request(None);
        result.n_commands_executed =
            self.commands_executed() - commands_before;

        if state == BuildResultState::Ok {
            let storage =
                self.storage.as_mut().expect("storage opened by init");
            let stored = storage.store(&mut self.context)?;
            self.context.log(LogRecord::progress(format!(
                "build state committed ({} object(s))",
                stored
            )));
        }

        Ok(state)
    }

    fn build_phases(&mut self) -> BuildResultState {
        // Changes are consumed on the main thread, never during a build.
        self.consume_changes();

        // Mirror phase: refresh dirty directories and files.
        let dirty_mirror = self.dirty_mirror_nodes();
        match self.run_scope("mirror", dirty_mirror) {
            NodeState::Ok => {}
            NodeState::Canceled => return BuildResultState::Canceled,
            _ => return BuildResultState::Failed,
        }

        // Parser phase: re-parse changed build files.
        self.sync_buildfile_nodes();
        let dirty_parsers = self.dirty_of_kind(|kind| {
            matches!(kind, NodeKind::BuildFileParser(_))
        });
        match self.run_scope("parsers", dirty_parsers) {
            NodeState::Ok => {}
            NodeState::Canceled => return BuildResultState::Canceled,
            _ => return BuildResultState::Failed,
        }

        // Compiler phase: materialize command nodes. Group membership can
        // cascade across build files, so run to a fixpoint.
        let mut rounds = 0;
        loop {
            if let Err(cycle) = self.check_buildfile_cycles() {
                self.context
                    .log(LogRecord::error(format!("{}", cycle)));
                return BuildResultState::Failed;
            }

            let dirty_compilers = self.dirty_of_kind(|kind| {
                matches!(kind, NodeKind::BuildFileCompiler(_))
            });
            if dirty_compilers.is_empty() {
                break;
            }
            match self.run_scope("compilers", dirty_compilers) {
                NodeState::Ok => {}
                NodeState::Canceled => return BuildResultState::Canceled,
                _ => return BuildResultState::Failed,
            }

            // A compiler whose consumed groups changed must run again.
            let compilers = self.context.nodes.find_where(|node| {
                matches!(node.kind, NodeKind::BuildFileCompiler(_))
            });
            for compiler in compilers {
                if self.context.nodes[compiler].state == NodeState::Ok
                    && buildfile::compiler_needs_recompile(
                        &mut self.context,
                        compiler,
                    )
                {
                    self.context
                        .set_node_state(compiler, NodeState::Dirty);
                }
            }

            rounds += 1;
            if rounds > 8 {
                self.context.log(LogRecord::error(
                    "build file compilation did not converge".to_string(),
                ));
                return BuildResultState::Failed;
            }
        }

        // Command phase: execute the dirty commands.
        let dirty_commands = self
            .dirty_of_kind(|kind| matches!(kind, NodeKind::Command(_)));
        match self.run_scope("commands", dirty_commands) {
            NodeState::Ok => BuildResultState::Ok,
            NodeState::Canceled => BuildResultState::Canceled,
            _ => BuildResultState::Failed,
        }
    }

    fn consume_changes(&mut self) {
        let repos: Vec<(String, PathBuf, Arc<watch::CollapsedChanges>)> =
            self.context
                .repositories()
                .filter(|(_, r)| r.kind != RepoKind::Ignored)
                .map(|(name, r)| {
                    (name.clone(), r.directory.clone(), r.changes.clone())
                })
                .collect();

        for (name, root, changes) in repos {
            watch::consume_changes(
                &mut self.context,
                &name,
                &root,
                &changes,
            );
        }
    }

    /// Dirty mirror nodes (directories and source files), found by walking
    /// each repository's mirror from the root.
    fn dirty_mirror_nodes(&self) -> Vec<NodeId> {
        let mut dirty = Vec::new();
        let mut stack: Vec<NodeId> = self
            .context
            .repositories()
            .filter_map(|(_, r)| r.root_node)
            .collect();

        while let Some(id) = stack.pop() {
            let node = match self.context.nodes.get(id) {
                Some(node) => node,
                None => continue,
            };
            if node.state == NodeState::Dirty {
                dirty.push(id);
            }
            if let NodeKind::Directory(d) = &node.kind {
                stack.extend(d.content.values().copied());
                stack.push(d.dot_ignore);
            }
        }

        dirty
    }

    fn dirty_of_kind<F>(&self, pred: F) -> Vec<NodeId>
    where
        F: Fn(&NodeKind) -> bool,
    {
        self.context.nodes.find_where(|node| {
            node.state == NodeState::Dirty && pred(&node.kind)
        })
    }

    /// Keeps the parser/compiler pairs in sync with the build files found
    /// in the mirror.
    fn sync_buildfile_nodes(&mut self) {
        let buildfiles = self.context.nodes.find_where(|node| {
            matches!(node.kind, NodeKind::SourceFile(_))
                && node.name().file_name().map_or(false, |leaf| {
                    leaf == crate::buildfile::BUILD_FILE_NAME
                })
        });

        let mut live_dirs = Vec::new();
        for buildfile_node in buildfiles {
            buildfile::find_or_create_nodes(&mut self.context, buildfile_node);
            if let Some(dir) =
                self.context.nodes[buildfile_node].name().parent()
            {
                live_dirs.push(dir.to_path_buf());
            }
        }

        // Parser pairs whose build file vanished.
        let stale: Vec<PathBuf> = self
            .context
            .nodes
            .find_where(|node| {
                matches!(node.kind, NodeKind::BuildFileParser(_))
            })
            .into_iter()
            .filter_map(|parser| {
                self.context.nodes[parser]
                    .name()
                    .parent()
                    .map(Path::to_path_buf)
            })
            .filter(|dir| !live_dirs.contains(dir))
            .collect();

        for dir in stale {
            buildfile::remove_nodes(&mut self.context, &dir);
        }
    }

    /// Refreshes the compiled-before edges between build files and rejects
    /// cyclic dependencies by Tarjan-style SCC decomposition.
    fn check_buildfile_cycles(&mut self) -> Result<(), RuleViolation> {
        let compilers = self.context.nodes.find_where(|node| {
            matches!(node.kind, NodeKind::BuildFileCompiler(_))
        });

        // Which compiler produces which group.
        let mut producers: BTreeMap<PathBuf, Vec<NodeId>> = BTreeMap::new();
        for &compiler in &compilers {
            let data = buildfile::compiler_data(&self.context, compiler);
            for group_name in &data.output_groups {
                producers
                    .entry(group_name.clone())
                    .or_default()
                    .push(compiler);
            }
        }

        let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &compiler in &compilers {
            let referenced = buildfile::compiler_data(&self.context, compiler)
                .referenced_groups
                .clone();
            let mut group_producers = Vec::new();
            for group_name in &referenced {
                for &producer in
                    producers.get(group_name).into_iter().flatten()
                {
                    if producer != compiler
                        && !group_producers.contains(&producer)
                    {
                        group_producers.push(producer);
                    }
                }
            }
            edges.insert(compiler, group_producers.clone());

            let mut changed = false;
            if let NodeKind::BuildFileCompiler(data) =
                &mut self.context.nodes[compiler].kind
            {
                if data.group_producers != group_producers {
                    data.group_producers = group_producers;
                    changed = true;
                }
            }
            if changed {
                self.context.nodes[compiler].modified = true;
            }
        }

        // Tarjan SCC over the compiled-before edges.
        if let Some(cycle) = find_cycle(&compilers, &edges) {
            let names = cycle
                .into_iter()
                .map(|id| self.context.nodes[id].name().to_path_buf())
                .collect();
            return Err(RuleViolation::Cycle { cycle: names });
        }

        Ok(())
    }

    /// Runs one build phase: an ephemeral scope group over the given
    /// members, pumped to completion on this thread.
    fn run_scope(&mut self, label: &str, members: Vec<NodeId>) -> NodeState {
        if members.is_empty() {
            return NodeState::Ok;
        }

        if self
            .context
            .log_book()
            .must_log_aspect(LogAspect::Scope)
        {
            self.context.log(LogRecord::new(
                LogAspect::Scope,
                format!("{} phase: {} node(s)", label, members.len()),
            ));
        }

        let scope_name = PathBuf::from(format!("__scope_{}__", label));
        let scope = group::find_or_create(&mut self.context, &scope_name);
        group::set_members(&mut self.context, scope, members);
        self.context.set_node_state(scope, NodeState::Dirty);
        self.context.set_build_scope(Some(scope));

        let frame = DispatcherFrame::new();
        let state = Arc::new(Mutex::new(NodeState::Failed));
        {
            let frame = frame.clone();
            let state = state.clone();
            self.context.observe_completion(
                scope,
                Box::new(move |_, completed| {
                    *state.lock().unwrap() = completed;
                    frame.stop();
                }),
            );
        }

        self.context.start(scope);
        self.pump(&frame);

        // The scope is ephemeral: unlink and drop it.
        group::set_members(&mut self.context, scope, Vec::new());
        self.context.nodes.remove(scope);
        self.context.set_build_scope(None);

        let state = *state.lock().unwrap();
        state
    }

    /// Drains the main dispatcher until the frame stops. Re-entrant with
    /// respect to nested frames.
    fn pump(&mut self, frame: &DispatcherFrame) {
        let queue = self.context.main_queue();
        while !frame.stopped() {
            match queue.pop() {
                Some(action) => action(&mut self.context),
                None => break,
            }
        }
    }

    fn commands_executed(&self) -> usize {
        self.context
            .statistics
            .self_executed
            .iter()
            .filter(|&&id| {
                self.context
                    .nodes
                    .get(id)
                    .map_or(false, |n| matches!(n.kind, NodeKind::Command(_)))
            })
            .count()
    }

    /// Deletes the generated outputs and dirties their producers.
    fn clean(
        &mut self,
        request: &BuildRequest,
    ) -> Result<BuildResultState, Error> {
        self.init(&request.directory, false)?;

        let generated = self.context.nodes.find_where(|node| {
            matches!(node.kind, NodeKind::GeneratedFile(_))
        });

        for id in generated {
            let name = self.context.nodes[id].name().to_path_buf();
            let absolute = self.context.absolute_path(&name);
            match std::fs::remove_file(&absolute) {
                Ok(()) => {
                    self.context.log(LogRecord::progress(format!(
                        "deleted {:?}",
                        name
                    )));
                }
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::from(err)
                            .context(format!(
                                "could not delete {:?}",
                                absolute
                            ))
                            .into());
                    }
                }
            }
            self.context.set_node_state(id, NodeState::Dirty);
        }

        let commands = self
            .context
            .nodes
            .find_where(|node| matches!(node.kind, NodeKind::Command(_)));
        for id in commands {
            self.context.set_node_state(id, NodeState::Dirty);
        }

        if let Some(storage) = self.storage.as_mut() {
            storage.store(&mut self.context)?;
        }

        Ok(BuildResultState::Ok)
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Tarjan-style strongly-connected-component search. Returns one cycle
/// (an SCC with more than one member, or a self-loop) if any exists.
fn find_cycle(
    nodes: &[NodeId],
    edges: &HashMap<NodeId, Vec<NodeId>>,
) -> Option<Vec<NodeId>> {
    struct Tarjan<'a> {
        edges: &'a HashMap<NodeId, Vec<NodeId>>,
        index: HashMap<NodeId, usize>,
        lowlink: HashMap<NodeId, usize>,
        on_stack: HashMap<NodeId, bool>,
        stack: Vec<NodeId>,
        counter: usize,
        cycle: Option<Vec<NodeId>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, v: NodeId) {
            self.index.insert(v, self.counter);
            self.lowlink.insert(v, self.counter);
            self.counter += 1;
            self.stack.push(v);
            self.on_stack.insert(v, true);

            for &w in self.edges.get(&v).into_iter().flatten() {
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let low = self.lowlink[&w].min(self.lowlink[&v]);
                    self.lowlink.insert(v, low);
                } else if self.on_stack.get(&w).copied().unwrap_or(false) {
                    let low = self.index[&w].min(self.lowlink[&v]);
                    self.lowlink.insert(v, low);
                }
            }

            if self.lowlink[&v] == self.index[&v] {
                let mut component = Vec::new();
                loop {
                    let w = self.stack.pop().expect("stack underflow");
                    self.on_stack.insert(w, false);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }

                let self_loop = component.len() == 1
                    && self
                        .edges
                        .get(&component[0])
                        .map_or(false, |e| e.contains(&component[0]));
                if (component.len() > 1 || self_loop)
                    && self.cycle.is_none()
                {
                    component.reverse();
                    self.cycle = Some(component);
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        edges,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashMap::new(),
        stack: Vec::new(),
        counter: 0,
        cycle: None,
    };

    for &v in nodes {
        if !tarjan.index.contains_key(&v) {
            tarjan.visit(v);
        }
    }

    tarjan.cycle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        // Ids for pure graph tests; the values never touch a node table.
        NodeId::from_raw(n)
    }

    #[test]
    fn cycle_detection_finds_sccs() {
        let a = id(1);
        let b = id(2);
        let c = id(3);

        let mut edges = HashMap::new();
        edges.insert(a, vec![b]);
        edges.insert(b, vec![c]);
        edges.insert(c, vec![a]);

        let cycle = find_cycle(&[a, b, c], &edges).expect("cycle");
        assert_eq!(cycle.len(), 3);

        let mut acyclic = HashMap::new();
        acyclic.insert(a, vec![b]);
        acyclic.insert(b, vec![c]);
        acyclic.insert(c, Vec::new());
        assert!(find_cycle(&[a, b, c], &acyclic).is_none());
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let a = id(1);
        let mut edges = HashMap::new();
        edges.insert(a, vec![a]);
        assert_eq!(find_cycle(&[a], &edges), Some(vec![a]));
    }

    // ----------------------------------------------------------------------
    // End-to-end builds against a scripted monitor.
    // ----------------------------------------------------------------------

    use crate::logbook::MemoryLogBook;
    use crate::monitor::testing::ScriptedMonitor;
    use crate::node::command;
    use crate::watch::{ChangeAction, FileChange};
    use std::collections::BTreeSet;
    use std::fs;

    /// A home repository named `proj` with a scripted monitor and an
    /// in-memory log book.
    struct Fixture {
        _tmp: tempfile::TempDir,
        home: PathBuf,
        log: Arc<MemoryLogBook>,
        monitor: Arc<ScriptedMonitor>,
        builder: Builder,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tmp = tempfile::tempdir().unwrap();
            let home = tmp.path().join("proj");
            fs::create_dir_all(home.join("src")).unwrap();
            fs::create_dir_all(home.join("generated")).unwrap();

            let log = Arc::new(MemoryLogBook::new());
            let monitor = Arc::new(ScriptedMonitor::new());
            let mut builder = Builder::with_log_book(log.clone());
            builder.context_mut().set_monitor(monitor.clone());

            Fixture {
                _tmp: tmp,
                home,
                log,
                monitor,
                builder,
            }
        }

        fn write(&self, relative: &str, content: &str) {
            let path = self.home.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn declare(&self, script: &str, reads: &[&str], writes: &[&str]) {
            self.monitor.declare(
                script,
                reads.iter().map(|r| self.home.join(r)).collect(),
                writes.iter().map(|w| self.home.join(w)).collect(),
            );
        }

        fn build(&mut self) -> BuildResult {
            self.builder.handle(BuildRequest::new(
                RequestKind::Build,
                self.home.clone(),
            ))
        }

        /// Feeds a change into the repository's coalescing table directly,
        /// as the platform watcher would.
        fn inject(&mut self, action: ChangeAction, relative: &str) {
            let path = self.home.join(relative);
            let last_write_time =
                fs::metadata(&path).and_then(|m| m.modified()).ok();
            let changes = self
                .builder
                .context()
                .find_repository("proj")
                .expect("home repository")
                .changes
                .clone();
            changes.add(FileChange {
                action,
                path,
                last_write_time,
            });
        }

        fn detected_input_names(&self, command_name: &str) -> BTreeSet<PathBuf> {
            let ctx = self.builder.context();
            let id = ctx
                .nodes
                .find(Path::new(command_name))
                .unwrap_or_else(|| panic!("no node {:?}", command_name));
            command::data(ctx, id)
                .detected_inputs
                .keys()
                .map(|&input| ctx.nodes[input].name().to_path_buf())
                .collect()
        }
    }

    /// The pipeline of scenario "simple link": two compiles feeding a link.
    fn link_fixture() -> Fixture {
        let fx = Fixture::new();

        fx.write("src/piet.cpp", "int piet(int x){return jan(x)+3;}\n");
        fx.write("src/jan.cpp", "int jan(int x){return x+5;}\n");
        fx.write("src/piet.h", "int piet(int);\n");
        fx.write("src/jan.h", "int jan(int);\n");
        fx.write(
            "buildfile.yam",
            ": foreach src/*.cpp |> cat %f src/%B.h > generated/%B.obj |> \
             generated/%B.obj\n\
             : generated/piet.obj generated/jan.obj |> cat \
             generated/jan.obj generated/piet.obj > generated/pietjan.dll \
             |> generated/pietjan.dll\n",
        );

        fx.declare(
            "cat src/piet.cpp src/piet.h > generated/piet.obj",
            &["src/piet.cpp", "src/piet.h"],
            &["generated/piet.obj"],
        );
        fx.declare(
            "cat src/jan.cpp src/jan.h > generated/jan.obj",
            &["src/jan.cpp", "src/jan.h"],
            &["generated/jan.obj"],
        );
        fx.declare(
            "cat generated/jan.obj generated/piet.obj > \
             generated/pietjan.dll",
            &["generated/jan.obj", "generated/piet.obj"],
            &["generated/pietjan.dll"],
        );

        fx
    }

    fn paths(names: &[&str]) -> BTreeSet<PathBuf> {
        names.iter().copied().map(PathBuf::from).collect()
    }

    #[test]
    fn simple_link_builds_once_then_is_idempotent() {
        let mut fx = link_fixture();

        let first = fx.build();
        assert!(first.succeeded(), "log: {:?}", fx.log.records());
        assert_eq!(first.n_commands_executed, 3);

        // The outputs exist with the expected content.
        let dll =
            fs::read_to_string(fx.home.join("generated/pietjan.dll"))
                .unwrap();
        assert!(dll.contains("return jan(x)+3;"));
        assert!(dll.contains("return x+5;"));

        // Inputs were learned per command from the access reports.
        assert_eq!(
            fx.detected_input_names("proj/.cmd-0-piet"),
            paths(&["proj/src/piet.cpp", "proj/src/piet.h"])
        );
        assert_eq!(
            fx.detected_input_names("proj/.cmd-0-jan"),
            paths(&["proj/src/jan.cpp", "proj/src/jan.h"])
        );
        assert_eq!(
            fx.detected_input_names("proj/.cmd-1"),
            paths(&["proj/generated/jan.obj", "proj/generated/piet.obj"])
        );

        // A second build with no changes does nothing at all.
        let second = fx.build();
        assert!(second.succeeded());
        assert_eq!(second.n_commands_executed, 0);
        assert_eq!(second.n_self_executed, 0);
    }

    #[test]
    fn editing_one_header_rebuilds_exactly_its_pipeline() {
        let mut fx = link_fixture();
        assert!(fx.build().succeeded());

        // Force a distinct write time even on coarse filesystems.
        std::thread::sleep(std::time::Duration::from_millis(20));
        fx.write("src/piet.h", "int piet(int);\n \n");
        fx.inject(ChangeAction::Modified, "src/piet.h");

        let result = fx.build();
        assert!(result.succeeded(), "log: {:?}", fx.log.records());

        // Exactly the piet compile and the link ran; jan's pipeline was
        // untouched.
        assert_eq!(result.n_commands_executed, 2);
    }

    #[test]
    fn gitignore_hides_matching_files_from_the_mirror() {
        let mut fx = Fixture::new();
        fx.write("src/keep.cpp", "int x;\n");
        assert!(fx.build().succeeded());

        let dir_hash_before = {
            let ctx = fx.builder.context();
            let src = ctx.nodes.find(Path::new("proj/src")).unwrap();
            crate::node::directory::data(ctx, src).execution_hash
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        fx.write("src/.gitignore", "*.tmp\n");
        fx.write("src/foo.tmp", "scratch\n");
        fx.inject(ChangeAction::Added, "src/.gitignore");
        fx.inject(ChangeAction::Added, "src/foo.tmp");

        assert!(fx.build().succeeded());

        let ctx = fx.builder.context();
        assert!(
            ctx.nodes.find(Path::new("proj/src/foo.tmp")).is_none(),
            "ignored file must not enter the mirror"
        );

        let src = ctx.nodes.find(Path::new("proj/src")).unwrap();
        assert_eq!(
            crate::node::directory::data(ctx, src).execution_hash,
            dir_hash_before,
            "directory hash is unchanged once the ignore applies"
        );
    }

    #[test]
    fn undeclared_write_fails_the_command() {
        let mut fx = Fixture::new();
        fx.write("src/piet.cpp", "int piet;\n");
        fx.write(
            "buildfile.yam",
            ": src/piet.cpp |> cat src/piet.cpp > generated/out.o |> \
             generated/out.o\n",
        );
        // The monitor observes a write the rule never declared.
        fx.declare(
            "cat src/piet.cpp > generated/out.o",
            &["src/piet.cpp"],
            &["generated/out.o", "generated/stray.log"],
        );
        fx.write("generated/stray.log", "oops\n");

        let result = fx.build();
        assert_eq!(result.state, BuildResultState::Failed);

        let errors: Vec<String> = fx
            .log
            .records()
            .into_iter()
            .filter(|r| r.aspect == crate::logbook::LogAspect::Error)
            .map(|r| r.message)
            .collect();
        assert!(
            errors.iter().any(|m| m.contains("undeclared output")),
            "errors: {:?}",
            errors
        );

        // No snapshot was committed for the failed build.
        assert!(!crate::repo::build_state_dir(&fx.home)
            .join("buildstate_1.bt")
            .is_file());
    }

    #[test]
    fn reads_outside_all_repositories_fail_the_command() {
        let mut fx = Fixture::new();
        fx.write("src/a.txt", "x\n");
        fx.write(
            "buildfile.yam",
            ": src/a.txt |> cat src/a.txt > generated/a.out |> \
             generated/a.out\n",
        );

        // A file that belongs to no known repository.
        let foreign = fx._tmp.path().join("outside.txt");
        fs::write(&foreign, "outside\n").unwrap();

        fx.monitor.declare(
            "cat src/a.txt > generated/a.out",
            vec![fx.home.join("src/a.txt"), foreign],
            vec![fx.home.join("generated/a.out")],
        );

        let result = fx.build();
        assert_eq!(result.state, BuildResultState::Failed);

        let errors: Vec<String> = fx
            .log
            .records()
            .into_iter()
            .filter(|r| r.aspect == crate::logbook::LogAspect::Error)
            .map(|r| r.message)
            .collect();
        assert!(
            errors
                .iter()
                .any(|m| m.contains("outside all known repositories")),
            "errors: {:?}",
            errors
        );
    }

    #[test]
    fn build_state_roundtrips_into_a_fresh_context() {
        let mut fx = link_fixture();
        assert!(fx.build().succeeded());

        let exec_hash_before = {
            let ctx = fx.builder.context();
            let cmd = ctx.nodes.find(Path::new("proj/.cmd-1")).unwrap();
            command::data(ctx, cmd).execution_hash
        };

        // A new builder retrieves the committed state and has nothing to
        // do.
        let log = Arc::new(MemoryLogBook::new());
        let mut fresh = Builder::with_log_book(log);
        fresh
            .context_mut()
            .set_monitor(fx.monitor.clone());

        let result = fresh.handle(BuildRequest::new(
            RequestKind::Build,
            fx.home.clone(),
        ));
        assert!(result.succeeded());
        assert_eq!(result.n_commands_executed, 0);
        assert_eq!(result.n_self_executed, 0);

        let ctx = fresh.context();
        let cmd = ctx.nodes.find(Path::new("proj/.cmd-1")).unwrap();
        assert_eq!(
            command::data(ctx, cmd).execution_hash,
            exec_hash_before
        );
        assert_eq!(
            fresh_detected(ctx, cmd),
            paths(&["proj/generated/jan.obj", "proj/generated/piet.obj"])
        );

        for (_, node) in ctx.nodes.iter() {
            assert!(
                !node.modified,
                "retrieved node {:?} must not be modified",
                node.name()
            );
        }
    }

    fn fresh_detected(
        ctx: &crate::context::ExecutionContext,
        cmd: NodeId,
    ) -> BTreeSet<PathBuf> {
        command::data(ctx, cmd)
            .detected_inputs
            .keys()
            .map(|&input| ctx.nodes[input].name().to_path_buf())
            .collect()
    }

    #[test]
    fn cancellation_terminates_a_running_command() {
        let fx = Fixture::new();
        fx.write(
            "buildfile.yam",
            ": |> sleep 30 |> generated/slow.out\n",
        );
        fx.declare("sleep 30", &[], &[]);

        let cancel = fx.builder.cancel_handle();
        let log = fx.log.clone();
        let home = fx.home.clone();

        let worker = std::thread::spawn(move || {
            let mut fx = fx;
            let result = fx.build();
            (result, fx)
        });

        // Wait for the command script to start, then cancel.
        let started = std::time::Instant::now();
        while !log.contains_aspect(crate::logbook::LogAspect::Script) {
            assert!(
                started.elapsed() < std::time::Duration::from_secs(10),
                "command never started"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let canceled_at = std::time::Instant::now();
        cancel.cancel();

        let (result, _fx) = worker.join().unwrap();
        assert_eq!(result.state, BuildResultState::Canceled);
        assert!(
            canceled_at.elapsed() < std::time::Duration::from_secs(2),
            "cancellation took {:?}",
            canceled_at.elapsed()
        );

        // No output node is Ok and nothing was committed.
        assert!(!crate::repo::build_state_dir(&home)
            .join("buildstate_1.bt")
            .is_file());
    }
}
