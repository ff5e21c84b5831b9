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

//! The execution context: the single-writer home of the node table, the
//! repositories, the aspect registry, the queues and the log sink.
//!
//! Everything in here is owned by the main thread. Worker threads never
//! touch the context; they receive plain data and post actions back onto
//! the main dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aspect::{FileAspect, FileAspectSet, RegexSet};
use crate::builder::BuildRequest;
use crate::dispatch::{
    Dispatcher, PriorityDispatcher, ThreadPool, WorkerAction,
};
use crate::logbook::{ConsoleLogBook, LogBook, LogRecord};
use crate::monitor::ProcessMonitor;
use crate::node::{NodeId, NodeSet, NodeState};
use crate::repo::{FileRepository, RepoKind};
use crate::stats::ExecutionStatistics;

/// An action executed on the main thread with exclusive context access.
pub type MainAction = Box<dyn FnOnce(&mut ExecutionContext) + Send>;

/// A one-shot observer of a node's completion. Invoked on the main thread;
/// `Send` so the owning context can migrate between service threads.
pub type CompletionObserver =
    Box<dyn FnOnce(&mut ExecutionContext, NodeState) + Send>;

pub struct ExecutionContext {
    pub nodes: NodeSet,
    pub statistics: ExecutionStatistics,

    repositories: BTreeMap<String, FileRepository>,
    aspect_sets: BTreeMap<String, FileAspectSet>,

    main_queue: Arc<Dispatcher<MainAction>>,
    pool: ThreadPool,

    log_book: Arc<dyn LogBook>,
    monitor: Arc<dyn ProcessMonitor>,

    build_request: Option<BuildRequest>,
    build_scope: Option<NodeId>,

    completion_observers: HashMap<NodeId, Vec<CompletionObserver>>,
}

impl ExecutionContext {
    pub fn new() -> ExecutionContext {
        Self::with_log_book(Arc::new(ConsoleLogBook::new()))
    }

    pub fn with_log_book(log_book: Arc<dyn LogBook>) -> ExecutionContext {
        let mut aspect_sets = BTreeMap::new();
        let entire = FileAspectSet::entire_file_set();
        aspect_sets.insert(entire.name().to_string(), entire);

        ExecutionContext {
            nodes: NodeSet::new(),
            statistics: ExecutionStatistics::new(),
            repositories: BTreeMap::new(),
            aspect_sets,
            main_queue: Arc::new(Dispatcher::new()),
            pool: ThreadPool::with_default_size(),
            log_book,
            monitor: crate::monitor::default_monitor(),
            build_request: None,
            build_scope: None,
            completion_observers: HashMap::new(),
        }
    }

    // Queues ----------------------------------------------------------------

    pub fn main_queue(&self) -> Arc<Dispatcher<MainAction>> {
        self.main_queue.clone()
    }

    pub fn worker_queue(&self) -> Arc<PriorityDispatcher<WorkerAction>> {
        self.pool.queue().clone()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    // Logging ---------------------------------------------------------------

    pub fn log_book(&self) -> &dyn LogBook {
        self.log_book.as_ref()
    }

    pub fn log_book_arc(&self) -> Arc<dyn LogBook> {
        self.log_book.clone()
    }

    pub fn set_log_book(&mut self, log_book: Arc<dyn LogBook>) {
        self.log_book = log_book;
    }

    pub fn log(&self, record: LogRecord) {
        self.log_book.add(record);
    }

    // Monitor ---------------------------------------------------------------

    pub fn monitor(&self) -> Arc<dyn ProcessMonitor> {
        self.monitor.clone()
    }

    pub fn set_monitor(&mut self, monitor: Arc<dyn ProcessMonitor>) {
        self.monitor = monitor;
    }

    // Repositories ----------------------------------------------------------

    /// Registers a repository. Fails on a duplicate name.
    pub fn add_repository(&mut self, repo: FileRepository) -> bool {
        if self.repositories.contains_key(&repo.name) {
            return false;
        }
        self.repositories.insert(repo.name.clone(), repo);
        true
    }

    pub fn remove_repository(&mut self, name: &str) -> Option<FileRepository> {
        self.repositories.remove(name)
    }

    pub fn find_repository(&self, name: &str) -> Option<&FileRepository> {
        self.repositories.get(name)
    }

    pub fn find_repository_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut FileRepository> {
        self.repositories.get_mut(name)
    }

    pub fn repositories(
        &self,
    ) -> impl Iterator<Item = (&String, &FileRepository)> {
        self.repositories.iter()
    }

    pub fn repositories_mut(
        &mut self,
    ) -> impl Iterator<Item = (&String, &mut FileRepository)> {
        self.repositories.iter_mut()
    }

    pub fn repository_names(&self) -> Vec<String> {
        self.repositories.keys().cloned().collect()
    }

    pub fn find_repository_containing(
        &self,
        absolute: &Path,
    ) -> Option<&FileRepository> {
        self.repositories
            .values()
            .find(|repo| repo.lexically_contains(absolute))
    }

    /// (name, absolute root, kind) of every repository, for worker-side
    /// path classification.
    pub fn repository_roots(&self) -> Vec<(String, PathBuf, RepoKind)> {
        self.repositories
            .values()
            .map(|r| (r.name.clone(), r.directory.clone(), r.kind))
            .collect()
    }

    /// Maps a symbolic path to the absolute path via its repository
    /// prefix. Unknown prefixes resolve below the current directory so
    /// that errors surface as missing files rather than panics.
    pub fn absolute_path(&self, symbolic: &Path) -> PathBuf {
        let mut components = symbolic.components();
        if let Some(first) = components.next() {
            let name = first.as_os_str().to_string_lossy();
            if let Some(repo) = self.repositories.get(name.as_ref()) {
                return repo.directory.join(components.as_path());
            }
        }
        symbolic.to_path_buf()
    }

    /// Maps an absolute path to its symbolic form, if any repository
    /// contains it.
    pub fn symbolic_path(&self, absolute: &Path) -> Option<PathBuf> {
        self.find_repository_containing(absolute)
            .and_then(|repo| repo.symbolic_path(absolute))
    }

    /// Exclude patterns effective for a symbolic path (its repository's).
    pub fn excludes_for(&self, symbolic: &Path) -> RegexSet {
        let mut components = symbolic.components();
        if let Some(first) = components.next() {
            let name = first.as_os_str().to_string_lossy();
            if let Some(repo) = self.repositories.get(name.as_ref()) {
                return repo.excludes.clone();
            }
        }
        RegexSet::default()
    }

    // Aspects ---------------------------------------------------------------

    pub fn add_aspect_set(&mut self, set: FileAspectSet) {
        self.aspect_sets.insert(set.name().to_string(), set);
    }

    /// The aspect set by name; unknown names fall back to the entire-file
    /// set.
    pub fn aspect_set(&self, name: &str) -> FileAspectSet {
        self.aspect_sets
            .get(name)
            .cloned()
            .unwrap_or_else(FileAspectSet::entire_file_set)
    }

    /// The aspects applicable to a file, across all registered sets,
    /// ordered by name. At minimum the entire-file aspect applies.
    pub fn file_aspects_for(&self, file_name: &Path) -> Vec<FileAspect> {
        let mut by_name: BTreeMap<String, FileAspect> = BTreeMap::new();
        by_name.insert(
            crate::aspect::ENTIRE_FILE_ASPECT.to_string(),
            FileAspect::entire_file(),
        );
        for set in self.aspect_sets.values() {
            for aspect in set.aspects() {
                if aspect.applies_to(file_name) {
                    by_name
                        .entry(aspect.name().to_string())
                        .or_insert_with(|| aspect.clone());
                }
            }
        }
        by_name.into_iter().map(|(_, a)| a).collect()
    }

    // Build request / scope -------------------------------------------------

    pub fn build_request(&self) -> Option<&BuildRequest> {
        self.build_request.as_ref()
    }

    pub fn set_build_request(&mut self, request: Option<BuildRequest>) {
        self.build_request = request;
    }

    pub fn build_scope(&self) -> Option<NodeId> {
        self.build_scope
    }

    pub fn set_build_scope(&mut self, scope: Option<NodeId>) {
        self.build_scope = scope;
    }

    /// All currently dirty nodes.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .find_where(|node| node.state == NodeState::Dirty)
    }

    // Completion observers --------------------------------------------------

    /// Registers a one-shot callback invoked when the node completes.
    pub fn observe_completion(
        &mut self,
        id: NodeId,
        observer: CompletionObserver,
    ) {
        self.completion_observers
            .entry(id)
            .or_insert_with(Vec::new)
            .push(observer);
    }

    pub(crate) fn fire_completion_observers(
        &mut self,
        id: NodeId,
        state: NodeState,
    ) {
        if let Some(observers) = self.completion_observers.remove(&id) {
            for observer in observers {
                observer(self, state);
            }
        }
    }

    // Build state (for persistence) ------------------------------------------

    /// Empties the in-memory build state prior to a retrieve.
    pub fn clear_build_state(&mut self) {
        self.nodes.clear();
        self.repositories.clear();
        self.completion_observers.clear();
        self.build_scope = None;
    }
}

impl Default for ExecutionContext {
    fn default() -> ExecutionContext {
        ExecutionContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_absolute_mapping() {
        let mut ctx = ExecutionContext::with_log_book(Arc::new(
            crate::logbook::MemoryLogBook::new(),
        ));

        ctx.add_repository(FileRepository::new(
            "main",
            PathBuf::from("/abs/main"),
            RepoKind::Integrated,
            RegexSet::default(),
        ));

        assert_eq!(
            ctx.absolute_path(Path::new("main/src/a.cpp")),
            Path::new("/abs/main/src/a.cpp")
        );
        assert_eq!(
            ctx.symbolic_path(Path::new("/abs/main/src/a.cpp")),
            Some(PathBuf::from("main/src/a.cpp"))
        );
        assert_eq!(ctx.symbolic_path(Path::new("/elsewhere/a")), None);
    }

    #[test]
    fn duplicate_repository_names_are_rejected() {
        let mut ctx = ExecutionContext::with_log_book(Arc::new(
            crate::logbook::MemoryLogBook::new(),
        ));

        assert!(ctx.add_repository(FileRepository::new(
            "main",
            PathBuf::from("/a"),
            RepoKind::Integrated,
            RegexSet::default(),
        )));
        assert!(!ctx.add_repository(FileRepository::new(
            "main",
            PathBuf::from("/b"),
            RepoKind::Integrated,
            RegexSet::default(),
        )));
    }

    #[test]
    fn aspect_fallback_is_entire_file() {
        let ctx = ExecutionContext::with_log_book(Arc::new(
            crate::logbook::MemoryLogBook::new(),
        ));
        let set = ctx.aspect_set("no-such-set");
        assert_eq!(set.name(), crate::aspect::ENTIRE_FILE_SET);

        let aspects = ctx.file_aspects_for(Path::new("main/a.cpp"));
        assert_eq!(aspects.len(), 1);
        assert_eq!(
            aspects[0].name(),
            crate::aspect::ENTIRE_FILE_ASPECT
        );
    }
}
