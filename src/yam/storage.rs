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

//! The persistent build state.
//!
//! A type-tagged key/value store: a 64-bit key carries the object's type in
//! the high 8 bits and a monotonically assigned id in the low 56 bits, and
//! each type gets its own tree so bulk retrieval walks in type × id order.
//!
//! Retrieval is two-phase. First every key instantiates an empty object so
//! that shared references (serialized as keys) can resolve even through
//! cycles; then each record deserializes into its object; finally a restore
//! pass re-binds the computed state: names in the node table, observer
//! back-references, cleared modified flags.
//!
//! Storing diffs the in-memory state against the stored image into insert,
//! replace and remove sets. Keys for new objects are allocated before any
//! serialization so references never recurse. The snapshot commits
//! atomically via a temp file; a failed commit rolls the in-memory state
//! back to the last committed image.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::aspect::RegexSet;
use crate::context::ExecutionContext;
use crate::error::{Error, IncompatibleVersion, ResultExt};
use crate::hash::Hash64;
use crate::logbook::LogRecord;
use crate::node::{
    buildfile, command, directory, dotignore, file, group, Node, NodeId,
    NodeKind, NodeState,
};
use crate::repo::{FileRepository, RepoKind};

pub type Key = u64;

const TYPE_BITS: u32 = 8;
const ID_BITS: u32 = 64 - TYPE_BITS;
const ID_MASK: u64 = (1u64 << ID_BITS) - 1;

/// Splits and joins the (type, id) halves of a key.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeyCode {
    pub key: Key,
    pub id: u64,
    pub type_id: u8,
}

impl KeyCode {
    pub fn from_key(key: Key) -> KeyCode {
        KeyCode {
            key,
            id: key & ID_MASK,
            type_id: (key >> ID_BITS) as u8,
        }
    }

    pub fn new(id: u64, type_id: u8) -> KeyCode {
        assert!(id <= ID_MASK, "object id out of bounds");
        KeyCode {
            key: (u64::from(type_id) << ID_BITS) | id,
            id,
            type_id,
        }
    }
}

/// Type tags. Each node variant and the repository get their own tree.
pub mod type_id {
    pub const COMMAND: u8 = 1;
    pub const DOT_IGNORE: u8 = 2;
    pub const GENERATED_FILE: u8 = 3;
    pub const SOURCE_DIRECTORY: u8 = 4;
    pub const SOURCE_FILE: u8 = 5;
    pub const GROUP: u8 = 6;
    pub const BUILDFILE_PARSER: u8 = 7;
    pub const BUILDFILE_COMPILER: u8 = 8;
    pub const FILE_REPOSITORY: u8 = 9;

    pub const ALL: &[u8] = &[
        COMMAND,
        DOT_IGNORE,
        GENERATED_FILE,
        SOURCE_DIRECTORY,
        SOURCE_FILE,
        GROUP,
        BUILDFILE_PARSER,
        BUILDFILE_COMPILER,
        FILE_REPOSITORY,
    ];
}

/// Version handling for `buildstate_<N>.bt` snapshots.
pub const WRITE_VERSION: u32 = 1;
pub const READABLE_VERSIONS: &[u32] = &[1];

fn snapshot_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("buildstate_{}.bt", version))
}

/// Scans the build-state directory for the snapshot to read and write.
/// A readable but older version is upgraded by copy; an unreadable one
/// refuses the build with instructions.
pub fn select_snapshot(
    dir: &Path,
    log: &dyn Fn(LogRecord),
) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir).with_context(|_| {
        format!("could not create build state directory {:?}", dir)
    })?;

    let name_re = Regex::new(r"^buildstate_([0-9]+)\.bt$")
        .expect("static pattern compiles");

    let mut found: Option<(PathBuf, u32)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(caps) = name_re.captures(&file_name) {
            let version: u32 = caps[1].parse().unwrap_or(0);
            if found.as_ref().map_or(true, |(_, v)| version >= *v) {
                found = Some((entry.path(), version));
            }
        }
    }

    match found {
        None => Ok(snapshot_path(dir, WRITE_VERSION)),
        Some((path, version)) => {
            if !READABLE_VERSIONS.contains(&version) {
                log(LogRecord::error(format!(
                    "build state {:?} has an incompatible version; delete \
                     it and all generated outputs, then rebuild",
                    path
                )));
                Err(IncompatibleVersion { path, version }.into())
            } else if version != WRITE_VERSION {
                let upgraded = snapshot_path(dir, WRITE_VERSION);
                fs::copy(&path, &upgraded).with_context(|_| {
                    format!("could not upgrade {:?} to {:?}", path, upgraded)
                })?;
                log(LogRecord::progress(format!(
                    "build state {:?} upgraded to {:?}",
                    path, upgraded
                )));
                Ok(upgraded)
            } else {
                Ok(path)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized records
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
struct NodeRecord {
    name: PathBuf,
    state: NodeState,
    kind: KindRecord,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
enum KindRecord {
    SourceFile {
        hashes: BTreeMap<String, Hash64>,
        last_write_time: Option<SystemTime>,
    },
    GeneratedFile {
        producer: Option<Key>,
        hashes: BTreeMap<String, Hash64>,
        last_write_time: Option<SystemTime>,
    },
    Directory {
        parent: Option<Key>,
        dot_ignore: Key,
        content: Vec<Key>,
        last_write_time: Option<SystemTime>,
        execution_hash: Hash64,
    },
    DotIgnore {
        directory: Key,
        files: Vec<Key>,
        hash: Hash64,
    },
    Command {
        script: String,
        working_dir: PathBuf,
        outputs: Vec<Key>,
        declared_inputs: Vec<Key>,
        input_producers: Vec<Key>,
        detected_inputs: Vec<(Key, Hash64)>,
        input_aspects: String,
        execution_hash: Hash64,
    },
    Group {
        members: Vec<Key>,
        hash: Hash64,
    },
    BuildFileParser {
        buildfile: Key,
        hash: Hash64,
        ast: Option<crate::buildfile::BuildFile>,
    },
    BuildFileCompiler {
        parser: Key,
        buildfile_dir: PathBuf,
        commands: Vec<Key>,
        output_groups: Vec<PathBuf>,
        referenced_groups: Vec<PathBuf>,
        hash: Hash64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct RepoRecord {
    name: String,
    directory: PathBuf,
    kind: RepoKind,
    excludes: Vec<String>,
    inputs: Vec<String>,
    root_node: Option<Key>,
}

type Trees = BTreeMap<u8, BTreeMap<u64, Vec<u8>>>;

// ---------------------------------------------------------------------------
// The store
// ---------------------------------------------------------------------------

pub struct PersistentBuildState {
    snapshot: PathBuf,

    /// The committed on-disk image: one tree per type id.
    trees: Trees,

    key_to_node: HashMap<Key, NodeId>,
    node_to_key: HashMap<NodeId, Key>,
    key_to_repo: HashMap<Key, String>,
    repo_to_key: HashMap<String, Key>,

    next_id: u64,
}

impl PersistentBuildState {
    /// Opens (or initializes) the store below the build-state directory.
    pub fn open(
        dir: &Path,
        log: &dyn Fn(LogRecord),
    ) -> Result<PersistentBuildState, Error> {
        let snapshot = select_snapshot(dir, log)?;

        let trees: Trees = match fs::File::open(&snapshot) {
            Ok(f) => bincode::deserialize_from(io::BufReader::new(f))
                .with_context(|_| {
                    format!(
                        "build state {:?} is corrupt; delete it and all \
                         generated outputs, then rebuild",
                        snapshot
                    )
                })?,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    Trees::new()
                } else {
                    return Err(err.into());
                }
            }
        };

        Ok(PersistentBuildState {
            snapshot,
            trees,
            key_to_node: HashMap::new(),
            node_to_key: HashMap::new(),
            key_to_repo: HashMap::new(),
            repo_to_key: HashMap::new(),
            next_id: 1,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.trees.values().all(BTreeMap::is_empty)
    }

    /// Rebuilds the whole build state into the context.
    pub fn retrieve(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> Result<(), Error> {
        self.key_to_node.clear();
        self.node_to_key.clear();
        self.key_to_repo.clear();
        self.repo_to_key.clear();
        self.next_id = 1;
        ctx.clear_build_state();

        // Phase 1: instantiate placeholders so references resolve, even
        // through cycles.
        for (&type_id, tree) in &self.trees {
            for (&id, _) in tree {
                let code = KeyCode::new(id, type_id);
                if id >= self.next_id {
                    self.next_id = id + 1;
                }
                if type_id == type_id::FILE_REPOSITORY {
                    // Repositories are instantiated during deserialization;
                    // nothing references them by key.
                    continue;
                }
                let placeholder = placeholder_node(type_id);
                let node_id = ctx.nodes.add_placeholder(placeholder);
                self.key_to_node.insert(code.key, node_id);
                self.node_to_key.insert(node_id, code.key);
            }
        }

        // Phase 2: deserialize fields, in type × id order.
        let keys: Vec<Key> = self
            .trees
            .iter()
            .flat_map(|(&type_id, tree)| {
                tree.keys()
                    .map(move |&id| KeyCode::new(id, type_id).key)
            })
            .collect();

        for key in keys {
            self.retrieve_key(ctx, key)?;
        }

        // Phase 3: restore computed state.
        let node_ids: Vec<NodeId> =
            self.key_to_node.values().copied().collect();
        for id in &node_ids {
            restore_node(ctx, *id);
        }
        for name in ctx.repository_names() {
            if let Some(repo) = ctx.find_repository_mut(&name) {
                repo.excludes.recompile();
                repo.modified = false;
            }
        }

        Ok(())
    }

    fn retrieve_key(
        &mut self,
        ctx: &mut ExecutionContext,
        key: Key,
    ) -> Result<(), Error> {
        let code = KeyCode::from_key(key);
        let bytes = self
            .trees
            .get(&code.type_id)
            .and_then(|tree| tree.get(&code.id))
            .cloned()
            .ok_or_else(|| {
                failure::format_err!("dangling build state key {:#x}", key)
            })?;

        if code.type_id == type_id::FILE_REPOSITORY {
            let record: RepoRecord = bincode::deserialize(&bytes)
                .context("corrupt repository record")?;
            let repo = self.decode_repository(&record)?;
            self.key_to_repo.insert(key, repo.name.clone());
            self.repo_to_key.insert(repo.name.clone(), key);
            ctx.add_repository(repo);
        } else {
            let record: NodeRecord = bincode::deserialize(&bytes)
                .context("corrupt node record")?;
            let id = self.key_to_node[&key];
            self.decode_node(ctx, id, &record)?;
        }

        Ok(())
    }

    /// Commits the difference between the in-memory state and the stored
    /// image. Returns the number of stored objects, or rolls back on a
    /// commit failure.
    pub fn store(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> Result<usize, Error> {
        let (to_insert, to_replace, to_remove, repos_insert, repos_replace, repos_remove) =
            self.diff(ctx);

        // Allocate keys for new objects before serializing anything, so a
        // reference to a new object already has a key.
        for &id in &to_insert {
            let type_id = node_type_id(&ctx.nodes[id]);
            let code = KeyCode::new(self.next_id, type_id);
            self.next_id += 1;
            self.key_to_node.insert(code.key, id);
            self.node_to_key.insert(id, code.key);
        }
        for name in &repos_insert {
            let code = KeyCode::new(self.next_id, type_id::FILE_REPOSITORY);
            self.next_id += 1;
            self.key_to_repo.insert(code.key, name.clone());
            self.repo_to_key.insert(name.clone(), code.key);
        }

        // Build the next image from the committed one.
        let mut next = self.trees.clone();

        for &(key, _) in &to_remove {
            let code = KeyCode::from_key(key);
            if let Some(tree) = next.get_mut(&code.type_id) {
                tree.remove(&code.id);
            }
        }
        for &key in &repos_remove {
            let code = KeyCode::from_key(key);
            if let Some(tree) = next.get_mut(&code.type_id) {
                tree.remove(&code.id);
            }
        }

        for &id in to_insert.iter().chain(to_replace.iter()) {
            let key = self.node_to_key[&id];
            let code = KeyCode::from_key(key);
            let record = self.encode_node(ctx, id);
            let bytes = bincode::serialize(&record)
                .context("could not serialize node record")?;
            next.entry(code.type_id).or_default().insert(code.id, bytes);
        }
        for name in repos_insert.iter().chain(repos_replace.iter()) {
            let key = self.repo_to_key[name];
            let code = KeyCode::from_key(key);
            let repo = ctx
                .find_repository(name)
                .expect("diffed repository exists");
            let record = self.encode_repository(repo);
            let bytes = bincode::serialize(&record)
                .context("could not serialize repository record")?;
            next.entry(code.type_id).or_default().insert(code.id, bytes);
        }

        let stored = to_insert.len()
            + to_replace.len()
            + to_remove.len()
            + repos_insert.len()
            + repos_replace.len()
            + repos_remove.len();

        // Atomic commit.
        if let Err(err) = self.commit(&next) {
            // Undo the key allocations of this attempt, then restore the
            // in-memory state to the last committed image.
            for &id in &to_insert {
                if let Some(key) = self.node_to_key.remove(&id) {
                    self.key_to_node.remove(&key);
                }
            }
            for name in &repos_insert {
                if let Some(key) = self.repo_to_key.remove(name) {
                    self.key_to_repo.remove(&key);
                }
            }
            self.rollback(ctx)?;
            return Err(err);
        }

        self.trees = next;

        // Mappings for removed objects die with the commit.
        for (key, _) in to_remove {
            if let Some(id) = self.key_to_node.remove(&key) {
                self.node_to_key.remove(&id);
            }
        }
        for key in repos_remove {
            if let Some(name) = self.key_to_repo.remove(&key) {
                self.repo_to_key.remove(&name);
            }
        }

        for &id in to_insert.iter().chain(to_replace.iter()) {
            ctx.nodes[id].modified = false;
        }
        for name in repos_insert.iter().chain(repos_replace.iter()) {
            if let Some(repo) = ctx.find_repository_mut(name) {
                repo.modified = false;
            }
        }

        Ok(stored)
    }

    /// Restores the in-memory build state to the last committed image:
    /// removed objects are re-created, inserted objects dropped, and
    /// modified objects re-deserialized in place.
    pub fn rollback(
        &mut self,
        ctx: &mut ExecutionContext,
    ) -> Result<(), Error> {
        let (to_insert, to_replace, to_remove, repos_insert, _repos_replace, repos_remove) =
            self.diff(ctx);

        // Objects that were removed from the build state come back from
        // their stored records.
        for (key, _) in to_remove {
            let code = KeyCode::from_key(key);
            let placeholder = placeholder_node(code.type_id);
            let id = ctx.nodes.add_placeholder(placeholder);
            self.key_to_node.insert(key, id);
            self.node_to_key.insert(id, key);
            self.retrieve_key(ctx, key)?;
            restore_node(ctx, id);
        }
        for key in repos_remove {
            self.retrieve_key(ctx, key)?;
        }

        // Freshly inserted objects are dropped again.
        for id in to_insert {
            unregister_node_edges(ctx, id);
            ctx.nodes.remove_if_present(id);
        }
        for name in repos_insert {
            ctx.remove_repository(&name);
        }

        // Modified objects are re-streamed from the committed image.
        for id in to_replace.iter().copied() {
            let key = self.node_to_key[&id];
            unregister_node_edges(ctx, id);
            let name = ctx.nodes[id].name().to_path_buf();
            ctx.nodes.unregister_name(&name);
            self.retrieve_key(ctx, key)?;
        }
        for id in to_replace {
            restore_node(ctx, id);
        }

        Ok(())
    }

    fn commit(&self, trees: &Trees) -> Result<(), Error> {
        let dir = self
            .snapshot
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .context("could not create build state temp file")?;
        bincode::serialize_into(io::BufWriter::new(&mut temp), trees)
            .context("could not write build state")?;
        temp.persist(&self.snapshot).with_context(|_| {
            format!("could not commit build state {:?}", self.snapshot)
        })?;
        Ok(())
    }

    /// Diffs the in-memory state against the stored image.
    #[allow(clippy::type_complexity)]
    fn diff(
        &self,
        ctx: &ExecutionContext,
    ) -> (
        Vec<NodeId>,
        Vec<NodeId>,
        Vec<(Key, NodeId)>,
        Vec<String>,
        Vec<String>,
        Vec<Key>,
    ) {
        let mut to_insert = Vec::new();
        let mut to_replace = Vec::new();

        for (id, node) in ctx.nodes.iter() {
            if is_transient(node) {
                continue;
            }
            match self.node_to_key.get(&id) {
                None => to_insert.push(id),
                Some(_) if node.modified => to_replace.push(id),
                Some(_) => {}
            }
        }

        let to_remove: Vec<(Key, NodeId)> = self
            .key_to_node
            .iter()
            .filter(|(_, &id)| !ctx.nodes.contains(id))
            .map(|(&key, &id)| (key, id))
            .collect();

        let mut repos_insert = Vec::new();
        let mut repos_replace = Vec::new();
        for (name, repo) in ctx.repositories() {
            match self.repo_to_key.get(name) {
                None => repos_insert.push(name.clone()),
                Some(_) if repo.modified => repos_replace.push(name.clone()),
                Some(_) => {}
            }
        }
        let repos_remove: Vec<Key> = self
            .repo_to_key
            .iter()
            .filter(|(name, _)| ctx.find_repository(name).is_none())
            .map(|(_, &key)| key)
            .collect();

        (
            to_insert,
            to_replace,
            to_remove,
            repos_insert,
            repos_replace,
            repos_remove,
        )
    }

    // Encoding --------------------------------------------------------------

    fn key_of(&self, id: NodeId) -> Option<Key> {
        self.node_to_key.get(&id).copied()
    }

    fn keys_of(&self, ids: &[NodeId]) -> Vec<Key> {
        ids.iter().filter_map(|&id| self.key_of(id)).collect()
    }

    fn encode_node(&self, ctx: &ExecutionContext, id: NodeId) -> NodeRecord {
        let node = &ctx.nodes[id];
        let state = match node.state {
            NodeState::Executing => NodeState::Dirty,
            other => other,
        };

        let kind = match &node.kind {
            NodeKind::SourceFile(d) => KindRecord::SourceFile {
                hashes: d.hashes.clone(),
                last_write_time: d.last_write_time,
            },
            NodeKind::GeneratedFile(d) => KindRecord::GeneratedFile {
                producer: d.producer.and_then(|p| self.key_of(p)),
                hashes: d.hashes.clone(),
                last_write_time: d.last_write_time,
            },
            NodeKind::Directory(d) => KindRecord::Directory {
                parent: d.parent.and_then(|p| self.key_of(p)),
                dot_ignore: self.key_of(d.dot_ignore).unwrap_or(0),
                content: self.keys_of(
                    &d.content.values().copied().collect::<Vec<_>>(),
                ),
                last_write_time: d.last_write_time,
                execution_hash: d.execution_hash,
            },
            NodeKind::DotIgnore(d) => KindRecord::DotIgnore {
                directory: self.key_of(d.directory).unwrap_or(0),
                files: self.keys_of(&d.files),
                hash: d.hash,
            },
            NodeKind::Command(d) => KindRecord::Command {
                script: d.script.clone(),
                working_dir: d.working_dir.clone(),
                outputs: self.keys_of(&d.outputs),
                declared_inputs: self.keys_of(&d.declared_inputs),
                input_producers: self.keys_of(&d.input_producers),
                detected_inputs: d
                    .detected_inputs
                    .iter()
                    .filter_map(|(&input, &hash)| {
                        self.key_of(input).map(|k| (k, hash))
                    })
                    .collect(),
                input_aspects: d.input_aspects.clone(),
                execution_hash: d.execution_hash,
            },
            NodeKind::Group(d) => KindRecord::Group {
                members: self.keys_of(&d.members),
                hash: d.hash,
            },
            NodeKind::BuildFileParser(d) => KindRecord::BuildFileParser {
                buildfile: self.key_of(d.buildfile).unwrap_or(0),
                hash: d.hash,
                ast: d.ast.as_ref().map(|a| (**a).clone()),
            },
            NodeKind::BuildFileCompiler(d) => KindRecord::BuildFileCompiler {
                parser: self.key_of(d.parser).unwrap_or(0),
                buildfile_dir: d.buildfile_dir.clone(),
                commands: self.keys_of(&d.commands),
                output_groups: d.output_groups.clone(),
                referenced_groups: d.referenced_groups.clone(),
                hash: d.hash,
            },
        };

        NodeRecord {
            name: node.name().to_path_buf(),
            state,
            kind,
        }
    }

    fn encode_repository(&self, repo: &FileRepository) -> RepoRecord {
        RepoRecord {
            name: repo.name.clone(),
            directory: repo.directory.clone(),
            kind: repo.kind,
            excludes: repo.excludes.patterns().to_vec(),
            inputs: repo.inputs.clone(),
            root_node: repo.root_node.and_then(|n| self.key_of(n)),
        }
    }

    // Decoding --------------------------------------------------------------

    fn node_ref(&self, key: Key) -> Option<NodeId> {
        if key == 0 {
            return None;
        }
        self.key_to_node.get(&key).copied()
    }

    fn node_refs(&self, keys: &[Key]) -> Vec<NodeId> {
        keys.iter().filter_map(|&k| self.node_ref(k)).collect()
    }

    fn decode_node(
        &self,
        ctx: &mut ExecutionContext,
        id: NodeId,
        record: &NodeRecord,
    ) -> Result<(), Error> {
        let kind = match &record.kind {
            KindRecord::SourceFile {
                hashes,
                last_write_time,
            } => {
                let mut data = file::FileData::new(file::FileKind::Source);
                data.hashes = hashes.clone();
                data.last_write_time = *last_write_time;
                NodeKind::SourceFile(data)
            }
            KindRecord::GeneratedFile {
                producer,
                hashes,
                last_write_time,
            } => {
                let mut data =
                    file::FileData::new(file::FileKind::Generated);
                data.producer = producer.and_then(|k| self.node_ref(k));
                data.hashes = hashes.clone();
                data.last_write_time = *last_write_time;
                NodeKind::GeneratedFile(data)
            }
            KindRecord::Directory {
                parent,
                dot_ignore,
                content,
                last_write_time,
                execution_hash,
            } => {
                let dot_ignore =
                    self.node_ref(*dot_ignore).unwrap_or_else(NodeId::dangling);
                let mut data = directory::DirectoryData::new(
                    parent.and_then(|k| self.node_ref(k)),
                    dot_ignore,
                );
                // Referenced children may not have their names yet; the
                // restore pass rebuilds the map keyed by real names.
                for (index, child) in
                    self.node_refs(content).into_iter().enumerate()
                {
                    data.content
                        .insert(PathBuf::from(format!("{}", index)), child);
                }
                data.last_write_time = *last_write_time;
                data.execution_hash = *execution_hash;
                NodeKind::Directory(data)
            }
            KindRecord::DotIgnore {
                directory,
                files,
                hash,
            } => {
                let mut data = dotignore::DotIgnoreData::new(
                    self.node_ref(*directory).unwrap_or_else(NodeId::dangling),
                );
                data.files = self.node_refs(files);
                data.hash = *hash;
                NodeKind::DotIgnore(data)
            }
            KindRecord::Command {
                script,
                working_dir,
                outputs,
                declared_inputs,
                input_producers,
                detected_inputs,
                input_aspects,
                execution_hash,
            } => {
                let mut data = command::CommandData::new(
                    script.clone(),
                    working_dir.clone(),
                );
                data.outputs = self.node_refs(outputs);
                data.declared_inputs = self.node_refs(declared_inputs);
                data.input_producers = self.node_refs(input_producers);
                data.detected_inputs = detected_inputs
                    .iter()
                    .filter_map(|&(k, h)| {
                        self.node_ref(k).map(|id| (id, h))
                    })
                    .collect();
                data.input_aspects = input_aspects.clone();
                data.execution_hash = *execution_hash;
                NodeKind::Command(data)
            }
            KindRecord::Group { members, hash } => {
                let mut data = group::GroupData::new();
                data.members = self.node_refs(members);
                data.hash = *hash;
                NodeKind::Group(data)
            }
            KindRecord::BuildFileParser {
                buildfile,
                hash,
                ast,
            } => {
                let mut data = buildfile::ParserData::new(
                    self.node_ref(*buildfile).unwrap_or_else(NodeId::dangling),
                );
                data.hash = *hash;
                data.ast = ast.clone().map(std::sync::Arc::new);
                NodeKind::BuildFileParser(data)
            }
            KindRecord::BuildFileCompiler {
                parser,
                buildfile_dir,
                commands,
                output_groups,
                referenced_groups,
                hash,
            } => {
                let mut data = buildfile::CompilerData::new(
                    self.node_ref(*parser).unwrap_or_else(NodeId::dangling),
                    buildfile_dir.clone(),
                );
                data.commands = self.node_refs(commands);
                data.output_groups = output_groups.clone();
                data.referenced_groups = referenced_groups.clone();
                data.hash = *hash;
                NodeKind::BuildFileCompiler(data)
            }
        };

        let node = &mut ctx.nodes[id];
        node.set_name(record.name.clone());
        node.state = record.state;
        node.kind = kind;
        Ok(())
    }

    fn decode_repository(
        &self,
        record: &RepoRecord,
    ) -> Result<FileRepository, Error> {
        let mut excludes = RegexSet::default();
        for pattern in &record.excludes {
            excludes.add(pattern.clone())?;
        }

        let mut repo = FileRepository::new(
            &record.name,
            record.directory.clone(),
            record.kind,
            excludes,
        );
        repo.inputs = record.inputs.clone();
        repo.root_node = record.root_node.and_then(|k| self.node_ref(k));
        repo.modified = false;
        Ok(repo)
    }
}

/// An empty node of the given type, to be filled by deserialization.
fn placeholder_node(type_id: u8) -> Node {
    let kind = match type_id {
        type_id::COMMAND => NodeKind::Command(command::CommandData::new(
            String::new(),
            PathBuf::new(),
        )),
        type_id::DOT_IGNORE => NodeKind::DotIgnore(
            dotignore::DotIgnoreData::new(NodeId::dangling()),
        ),
        type_id::GENERATED_FILE => NodeKind::GeneratedFile(
            file::FileData::new(file::FileKind::Generated),
        ),
        type_id::SOURCE_DIRECTORY => NodeKind::Directory(
            directory::DirectoryData::new(None, NodeId::dangling()),
        ),
        type_id::SOURCE_FILE => {
            NodeKind::SourceFile(file::FileData::new(file::FileKind::Source))
        }
        type_id::GROUP => NodeKind::Group(group::GroupData::new()),
        type_id::BUILDFILE_PARSER => NodeKind::BuildFileParser(
            buildfile::ParserData::new(NodeId::dangling()),
        ),
        type_id::BUILDFILE_COMPILER => NodeKind::BuildFileCompiler(
            buildfile::CompilerData::new(NodeId::dangling(), PathBuf::new()),
        ),
        other => panic!("unknown build state type id {}", other),
    };

    Node::new(PathBuf::new(), kind)
}

fn node_type_id(node: &Node) -> u8 {
    match &node.kind {
        NodeKind::Command(_) => type_id::COMMAND,
        NodeKind::DotIgnore(_) => type_id::DOT_IGNORE,
        NodeKind::GeneratedFile(_) => type_id::GENERATED_FILE,
        NodeKind::Directory(_) => type_id::SOURCE_DIRECTORY,
        NodeKind::SourceFile(_) => type_id::SOURCE_FILE,
        NodeKind::Group(_) => type_id::GROUP,
        NodeKind::BuildFileParser(_) => type_id::BUILDFILE_PARSER,
        NodeKind::BuildFileCompiler(_) => type_id::BUILDFILE_COMPILER,
    }
}

/// Ephemeral scope groups are never persisted.
fn is_transient(node: &Node) -> bool {
    node.name()
        .file_name()
        .map_or(false, |leaf| leaf.to_string_lossy().starts_with("__scope"))
}

/// Rebuilds the redundant state of one node after its fields have been
/// deserialized: the name index entry, the observer back-references, the
/// dot-ignore matcher, and the directory content map keyed by real names.
fn restore_node(ctx: &mut ExecutionContext, id: NodeId) {
    ctx.nodes.register_name(id);
    ctx.nodes[id].modified = false;

    register_node_edges(ctx, id);

    match &ctx.nodes[id].kind {
        NodeKind::Directory(d) => {
            let children: Vec<NodeId> = d.content.values().copied().collect();
            let mut content = BTreeMap::new();
            for child in children {
                if ctx.nodes.contains(child) {
                    content.insert(
                        ctx.nodes[child].name().to_path_buf(),
                        child,
                    );
                }
            }
            if let NodeKind::Directory(d) = &mut ctx.nodes[id].kind {
                d.content = content;
            }
        }
        NodeKind::DotIgnore(d) => {
            let dir = d.directory;
            if ctx.nodes.contains(dir) {
                let dir_name = ctx.nodes[dir].name().to_path_buf();
                let abs = ctx.absolute_path(&dir_name);
                let matcher = dotignore::parse_ignore_files(&abs);
                if let NodeKind::DotIgnore(d) = &mut ctx.nodes[id].kind {
                    d.matcher = matcher;
                }
            }
        }
        _ => {}
    }
}

/// Registers the observer edges implied by a node's forward references.
fn register_node_edges(ctx: &mut ExecutionContext, id: NodeId) {
    let targets: Vec<(NodeId, bool)> = match &ctx.nodes[id].kind {
        NodeKind::Directory(d) => {
            let mut t: Vec<(NodeId, bool)> =
                d.content.values().map(|&c| (c, true)).collect();
            t.push((d.dot_ignore, false));
            t
        }
        NodeKind::DotIgnore(d) => {
            d.files.iter().map(|&f| (f, false)).collect()
        }
        NodeKind::Command(d) => d
            .declared_inputs
            .iter()
            .chain(d.detected_inputs.keys())
            .chain(d.input_producers.iter())
            .chain(d.outputs.iter())
            .map(|&n| (n, false))
            .collect(),
        NodeKind::GeneratedFile(d) => {
            // The generated file waits on its producer, so it must be in
            // the producer's dependant set for the completion callback.
            match d.producer {
                Some(producer) => {
                    if ctx.nodes.contains(producer) {
                        ctx.add_dependant(producer, id);
                    }
                    Vec::new()
                }
                None => Vec::new(),
            }
        }
        NodeKind::Group(d) => d.members.iter().map(|&m| (m, false)).collect(),
        NodeKind::BuildFileParser(d) => vec![(d.buildfile, false)],
        NodeKind::BuildFileCompiler(d) => vec![(d.parser, false)],
        NodeKind::SourceFile(_) => Vec::new(),
    };

    for (target, post) in targets {
        if ctx.nodes.contains(target) {
            ctx.add_dependant(target, id);
            if post {
                ctx.add_post_parent(target, id);
            }
        }
    }

    // A command's outputs also observe the command.
    if let NodeKind::Command(d) = &ctx.nodes[id].kind {
        let outputs = d.outputs.clone();
        for output in outputs {
            if ctx.nodes.contains(output) {
                ctx.add_dependant(id, output);
            }
        }
    }
}

/// Removes the observer edges a node registered, prior to dropping or
/// re-deserializing it.
fn unregister_node_edges(ctx: &mut ExecutionContext, id: NodeId) {
    let targets: Vec<NodeId> = match &ctx.nodes[id].kind {
        NodeKind::Directory(d) => {
            let mut t: Vec<NodeId> = d.content.values().copied().collect();
            t.push(d.dot_ignore);
            t
        }
        NodeKind::DotIgnore(d) => d.files.clone(),
        NodeKind::Command(d) => d
            .declared_inputs
            .iter()
            .chain(d.detected_inputs.keys())
            .chain(d.input_producers.iter())
            .chain(d.outputs.iter())
            .copied()
            .collect(),
        NodeKind::Group(d) => d.members.clone(),
        NodeKind::BuildFileParser(d) => vec![d.buildfile],
        NodeKind::BuildFileCompiler(d) => vec![d.parser],
        NodeKind::GeneratedFile(_) | NodeKind::SourceFile(_) => Vec::new(),
    };

    for target in targets {
        if ctx.nodes.contains(target) {
            ctx.remove_dependant(target, id);
            ctx.remove_post_parent(target, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbook::MemoryLogBook;
    use std::sync::Arc;

    fn test_ctx() -> ExecutionContext {
        ExecutionContext::with_log_book(Arc::new(MemoryLogBook::new()))
    }

    fn no_log() -> impl Fn(LogRecord) {
        |_| {}
    }

    #[test]
    fn key_code_roundtrip() {
        let code = KeyCode::new(42, type_id::COMMAND);
        let back = KeyCode::from_key(code.key);
        assert_eq!(back.id, 42);
        assert_eq!(back.type_id, type_id::COMMAND);

        let big = KeyCode::new(ID_MASK, type_id::FILE_REPOSITORY);
        let back = KeyCode::from_key(big.key);
        assert_eq!(back.id, ID_MASK);
        assert_eq!(back.type_id, type_id::FILE_REPOSITORY);
    }

    #[test]
    fn snapshot_selection_prefers_highest_readable() {
        let dir = tempfile::tempdir().unwrap();
        let selected = select_snapshot(dir.path(), &no_log()).unwrap();
        assert_eq!(selected, snapshot_path(dir.path(), WRITE_VERSION));
    }

    #[test]
    fn snapshot_selection_rejects_unreadable_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(snapshot_path(dir.path(), 999), b"future").unwrap();
        assert!(select_snapshot(dir.path(), &no_log()).is_err());
    }

    #[test]
    fn store_and_retrieve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        // Build a small graph: a source file, a generated file and a
        // command linking them.
        let mut ctx = test_ctx();
        ctx.add_repository(FileRepository::new(
            "main",
            dir.path().join("main"),
            RepoKind::Integrated,
            FileRepository::default_excludes(),
        ));

        let src = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/src/a.cpp"),
        );
        let cmd = ctx.nodes.add(Node::new(
            PathBuf::from("main/.cmd-0"),
            NodeKind::Command(command::CommandData::new(
                "cc a.cpp".to_string(),
                PathBuf::from("main"),
            )),
        ));
        let out = file::find_or_create_generated_file(
            &mut ctx,
            Path::new("main/gen/a.obj"),
            cmd,
        );

        let input_hash = Hash64::from_str("input");
        {
            let data = command::data_mut(&mut ctx, cmd);
            data.outputs = vec![out];
            data.detected_inputs.insert(src, input_hash);
            data.execution_hash = Hash64::from_str("exec");
        }
        ctx.set_node_state(cmd, NodeState::Ok);
        ctx.set_node_state(src, NodeState::Ok);
        ctx.set_node_state(out, NodeState::Ok);

        let mut store = PersistentBuildState::open(&state_dir, &no_log())
            .unwrap();
        let stored = store.store(&mut ctx).unwrap();
        assert_eq!(stored, 4); // 3 nodes + 1 repository

        // Second store with no modifications is a no-op.
        assert_eq!(store.store(&mut ctx).unwrap(), 0);

        // Retrieve into a fresh context.
        let mut fresh = test_ctx();
        let mut store2 = PersistentBuildState::open(&state_dir, &no_log())
            .unwrap();
        store2.retrieve(&mut fresh).unwrap();

        assert_eq!(fresh.nodes.len(), 3);
        let cmd2 = fresh.nodes.find(Path::new("main/.cmd-0")).unwrap();
        let src2 = fresh.nodes.find(Path::new("main/src/a.cpp")).unwrap();
        let out2 = fresh.nodes.find(Path::new("main/gen/a.obj")).unwrap();

        let data = command::data(&fresh, cmd2);
        assert_eq!(data.script, "cc a.cpp");
        assert_eq!(data.execution_hash, Hash64::from_str("exec"));
        assert_eq!(data.detected_inputs.get(&src2), Some(&input_hash));
        assert_eq!(data.outputs, vec![out2]);

        // States survive, modified flags are clear, observer edges exist.
        assert_eq!(fresh.nodes[cmd2].state, NodeState::Ok);
        assert!(!fresh.nodes[cmd2].modified);
        assert!(!fresh.nodes[src2].modified);
        assert!(fresh.nodes[src2].dependants.contains(&cmd2));

        assert!(fresh.find_repository("main").is_some());

        // Dirtying the retrieved input dirties the retrieved command.
        fresh.set_node_state(src2, NodeState::Dirty);
        assert_eq!(fresh.nodes[cmd2].state, NodeState::Dirty);
    }

    #[test]
    fn removed_nodes_leave_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let mut ctx = test_ctx();
        let a = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/a.txt"),
        );
        file::find_or_create_source_file(&mut ctx, Path::new("main/b.txt"));

        let mut store =
            PersistentBuildState::open(&state_dir, &no_log()).unwrap();
        assert_eq!(store.store(&mut ctx).unwrap(), 2);

        ctx.nodes.remove(a);
        assert_eq!(store.store(&mut ctx).unwrap(), 1); // the removal

        let mut fresh = test_ctx();
        let mut store2 =
            PersistentBuildState::open(&state_dir, &no_log()).unwrap();
        store2.retrieve(&mut fresh).unwrap();
        assert_eq!(fresh.nodes.len(), 1);
        assert!(fresh.nodes.find(Path::new("main/a.txt")).is_none());
        assert!(fresh.nodes.find(Path::new("main/b.txt")).is_some());
    }

    #[test]
    fn rollback_restores_the_committed_image() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let mut ctx = test_ctx();
        let a = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/a.txt"),
        );

        let mut store =
            PersistentBuildState::open(&state_dir, &no_log()).unwrap();
        store.store(&mut ctx).unwrap();

        // Mutate: change a, add b, and remove nothing.
        {
            let node = &mut ctx.nodes[a];
            if let NodeKind::SourceFile(d) = &mut node.kind {
                d.hashes.insert(
                    "entireFile".to_string(),
                    Hash64::from_str("changed"),
                );
            }
            node.modified = true;
        }
        let b = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/b.txt"),
        );
        assert!(ctx.nodes.contains(b));

        store.rollback(&mut ctx).unwrap();

        // The insertion is gone and the modification reverted.
        assert!(ctx.nodes.find(Path::new("main/b.txt")).is_none());
        let a2 = ctx.nodes.find(Path::new("main/a.txt")).unwrap();
        if let NodeKind::SourceFile(d) = &ctx.nodes[a2].kind {
            assert!(d.hashes.is_empty());
        } else {
            panic!("expected a source file");
        }
        assert!(!ctx.nodes[a2].modified);
    }

    #[test]
    fn scope_groups_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let mut ctx = test_ctx();
        ctx.nodes.add(Node::new(
            PathBuf::from("__scope_mirror__"),
            NodeKind::Group(group::GroupData::new()),
        ));

        let mut store =
            PersistentBuildState::open(&state_dir, &no_log()).unwrap();
        assert_eq!(store.store(&mut ctx).unwrap(), 0);
    }
}
