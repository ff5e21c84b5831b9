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

//! Command nodes.
//!
//! A command runs a shell script under access monitoring. Its inputs are
//! learned from the observed reads; its outputs are the declared generated
//! files, policed against the observed writes. The execution hash over the
//! script text, the output identities, the producer identities and the
//! input aspect hashes decides whether the script can be skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::context::ExecutionContext;
use crate::dispatch::Priority;
use crate::error::{RuleViolation, ScriptFailure};
use crate::hash::{Hash64, Hasher64};
use crate::logbook::{LogAspect, LogRecord};
use crate::monitor::{CancelToken, MonitorRequest};
use crate::node::{self, NodeId, NodeKind, NodeState, SelfResult};
use crate::repo::RepoKind;

#[cfg(unix)]
const SHELL: &str = "/bin/sh";

/// System locations every process touches; reads below these never become
/// dependencies and never count as foreign inputs.
const SYSTEM_PREFIXES: &[&str] = &[
    "/bin", "/dev", "/etc", "/lib", "/lib32", "/lib64", "/opt", "/proc",
    "/run", "/sbin", "/sys", "/usr",
];

pub struct CommandData {
    /// The shell script text.
    pub script: String,

    /// Symbolic directory the script runs in (the build file's directory).
    pub working_dir: PathBuf,

    /// Declared output generated-file nodes, in rule order.
    pub outputs: Vec<NodeId>,

    /// Declared input file nodes, resolved by the build-file compiler.
    pub declared_inputs: Vec<NodeId>,

    /// Declared producers (command or group nodes) whose outputs must be
    /// complete before this command runs.
    pub input_producers: Vec<NodeId>,

    /// Inputs learned from the previous execution's access report, with the
    /// aspect hash each had at that time.
    pub detected_inputs: BTreeMap<NodeId, Hash64>,

    /// Name of the aspect set used to hash inputs.
    pub input_aspects: String,

    pub execution_hash: Hash64,

    /// Cancellation handle while the script runs. Never persisted.
    pub running: Option<Arc<CancelToken>>,
}

impl CommandData {
    pub fn new(script: String, working_dir: PathBuf) -> CommandData {
        CommandData {
            script,
            working_dir,
            outputs: Vec::new(),
            declared_inputs: Vec::new(),
            input_producers: Vec::new(),
            detected_inputs: BTreeMap::new(),
            input_aspects: crate::aspect::ENTIRE_FILE_SET.to_string(),
            execution_hash: Hash64::random(),
            running: None,
        }
    }

    pub fn prerequisites(&self) -> Vec<NodeId> {
        let mut prerequisites = self.input_producers.clone();
        for input in &self.declared_inputs {
            if !prerequisites.contains(input) {
                prerequisites.push(*input);
            }
        }
        for input in self.detected_inputs.keys() {
            if !prerequisites.contains(input) {
                prerequisites.push(*input);
            }
        }
        prerequisites
    }

    pub fn cancel_running(&self) {
        if let Some(token) = &self.running {
            token.cancel();
        }
    }
}

/// One read learned from the access report, mapped into a repository.
pub struct DetectedRead {
    pub symbolic: PathBuf,
    pub absolute: PathBuf,
    pub last_write_time: Option<SystemTime>,
}

pub struct CommandSelfResult {
    pub new_state: NodeState,
    pub violations: Vec<RuleViolation>,
    pub failure: Option<ScriptFailure>,
    pub stdout: String,
    pub stderr: String,

    /// Reads surviving classification, to become (or refresh) input nodes.
    pub detected_reads: Vec<DetectedRead>,

    /// Declared output node → freshly computed aspect hashes + write time.
    pub output_hashes:
        Vec<(NodeId, BTreeMap<String, Hash64>, Option<SystemTime>)>,

    /// Whether the script actually ran (false when the node was canceled
    /// before launch).
    pub executed: bool,
}

impl CommandSelfResult {
    fn canceled() -> CommandSelfResult {
        CommandSelfResult {
            new_state: NodeState::Canceled,
            violations: Vec::new(),
            failure: None,
            stdout: String::new(),
            stderr: String::new(),
            detected_reads: Vec::new(),
            output_hashes: Vec::new(),
            executed: false,
        }
    }
}

pub fn data<'a>(ctx: &'a ExecutionContext, id: NodeId) -> &'a CommandData {
    match &ctx.nodes[id].kind {
        NodeKind::Command(data) => data,
        _ => unreachable!("command access on wrong node kind"),
    }
}

pub fn data_mut<'a>(
    ctx: &'a mut ExecutionContext,
    id: NodeId,
) -> &'a mut CommandData {
    match &mut ctx.nodes[id].kind {
        NodeKind::Command(data) => data,
        _ => unreachable!("command access on wrong node kind"),
    }
}

/// Execution hash over the script, the output and producer identities, and
/// the current aspect hashes of all known inputs.
pub fn compute_execution_hash(ctx: &ExecutionContext, id: NodeId) -> Hash64 {
    let d = data(ctx, id);
    let aspects = ctx.aspect_set(&d.input_aspects);

    let mut hasher = Hasher64::new();
    hasher.put_str(&d.script);

    let mut output_names: Vec<String> = d
        .outputs
        .iter()
        .map(|&o| ctx.nodes[o].name().to_string_lossy().into_owned())
        .collect();
    output_names.sort();
    for name in output_names {
        hasher.put_str(&name);
    }

    let mut producer_names: Vec<String> = d
        .input_producers
        .iter()
        .filter(|&&p| ctx.nodes.contains(p))
        .map(|&p| ctx.nodes[p].name().to_string_lossy().into_owned())
        .collect();
    producer_names.sort();
    for name in producer_names {
        hasher.put_str(&name);
    }

    let mut inputs: Vec<NodeId> = d.declared_inputs.clone();
    for input in d.detected_inputs.keys() {
        if !inputs.contains(input) {
            inputs.push(*input);
        }
    }
    let mut input_entries: Vec<(String, Hash64)> = inputs
        .into_iter()
        .map(|input| {
            if !ctx.nodes.contains(input) {
                // The input vanished; force a re-run.
                return (String::new(), Hash64::random());
            }
            let name =
                ctx.nodes[input].name().to_string_lossy().into_owned();
            let aspect = aspects.applicable_to(ctx.nodes[input].name());
            let hash = node::file::hash_of(ctx, input, aspect.name());
            (name, hash)
        })
        .collect();
    input_entries.sort();
    for (name, hash) in input_entries {
        hasher.put_str(&name);
        hasher.put_hash(hash);
    }

    hasher.finish()
}

pub(super) fn pending_start_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> bool {
    {
        let d = data(ctx, id);

        // A dirty output means it was modified, deleted or never produced;
        // a dirty input means its hash is not trustworthy yet.
        let output_dirty = d
            .outputs
            .iter()
            .any(|&o| ctx.nodes[o].state == NodeState::Dirty);
        let input_dirty = d
            .declared_inputs
            .iter()
            .chain(d.detected_inputs.keys())
            .any(|&i| {
                ctx.nodes.contains(i)
                    && ctx.nodes[i].state == NodeState::Dirty
            });

        if output_dirty || input_dirty {
            return true;
        }
    }

    compute_execution_hash(ctx, id) != data(ctx, id).execution_hash
}

pub(super) fn start_self(ctx: &mut ExecutionContext, id: NodeId) {
    let name = ctx.nodes[id].name().to_path_buf();
    let (script, working_dir, outputs) = {
        let d = data(ctx, id);
        (d.script.clone(), d.working_dir.clone(), d.outputs.clone())
    };

    let abs_working_dir = ctx.absolute_path(&working_dir);
    let aspects = ctx.aspect_set(&data(ctx, id).input_aspects);
    let repos = ctx.repository_roots();
    let monitor = ctx.monitor();

    let declared: Vec<(NodeId, PathBuf, PathBuf)> = outputs
        .iter()
        .map(|&o| {
            let sym = ctx.nodes[o].name().to_path_buf();
            let abs = ctx.absolute_path(&sym);
            (o, sym, abs)
        })
        .collect();

    let cancel = Arc::new(CancelToken::new());
    data_mut(ctx, id).running = Some(cancel.clone());

    if ctx.log_book().must_log_aspect(LogAspect::Script) {
        ctx.log(LogRecord::new(
            LogAspect::Script,
            format!("{:?}: {}", name, script),
        ));
    }

    let main_queue = ctx.main_queue();
    ctx.worker_queue().push(
        Box::new(move || {
            let result = if cancel.canceled() {
                CommandSelfResult::canceled()
            } else {
                execute(
                    &name,
                    &script,
                    &abs_working_dir,
                    &declared,
                    &repos,
                    &aspects,
                    &monitor,
                    cancel,
                )
            };
            main_queue.push(Box::new(move |ctx: &mut ExecutionContext| {
                ctx.handle_self_completion(id, SelfResult::Command(result));
            }));
        }),
        Priority::Medium,
    );
}

/// Runs the script under the monitor and classifies the access report.
/// Worker-thread code; everything it needs was captured up front.
fn execute(
    name: &Path,
    script: &str,
    abs_working_dir: &Path,
    declared: &[(NodeId, PathBuf, PathBuf)],
    repos: &[(String, PathBuf, RepoKind)],
    aspects: &crate::aspect::FileAspectSet,
    monitor: &Arc<dyn crate::monitor::ProcessMonitor>,
    cancel: Arc<CancelToken>,
) -> CommandSelfResult {
    let was_canceled = cancel.clone();
    let request = MonitorRequest {
        program: PathBuf::from(SHELL),
        args: vec!["-c".to_string(), script.to_string()],
        working_dir: abs_working_dir.to_path_buf(),
        env: BTreeMap::new(),
        timeout: None,
        cancel,
    };

    let outcome = match monitor.run(request) {
        Ok(outcome) => outcome,
        Err(err) => {
            return CommandSelfResult {
                new_state: NodeState::Failed,
                violations: Vec::new(),
                failure: Some(ScriptFailure {
                    command: name.to_path_buf(),
                    code: -1,
                    stdout: String::new(),
                    stderr: format!("{}", err),
                }),
                stdout: String::new(),
                stderr: String::new(),
                detected_reads: Vec::new(),
                output_hashes: Vec::new(),
                executed: true,
            };
        }
    };

    if was_canceled.canceled() {
        return CommandSelfResult::canceled();
    }

    if outcome.exit_code != 0 {
        return CommandSelfResult {
            new_state: NodeState::Failed,
            violations: Vec::new(),
            failure: Some(ScriptFailure {
                command: name.to_path_buf(),
                code: outcome.exit_code,
                stdout: outcome.stdout.clone(),
                stderr: outcome.stderr.clone(),
            }),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            detected_reads: Vec::new(),
            output_hashes: Vec::new(),
            executed: true,
        };
    }

    let mut violations = Vec::new();

    // Every observed write must match a declared output.
    let declared_abs: Vec<&PathBuf> =
        declared.iter().map(|(_, _, abs)| abs).collect();
    let writes = outcome.report.writes();
    for write in &writes {
        if !declared_abs.iter().any(|abs| *abs == write) {
            violations.push(RuleViolation::UndeclaredOutput {
                command: name.to_path_buf(),
                path: write.clone(),
            });
        }
    }

    // Every declared output must have been written.
    for (_, sym, abs) in declared {
        if !writes.contains(abs) {
            violations.push(RuleViolation::MissingOutput {
                command: name.to_path_buf(),
                path: sym.clone(),
            });
        }
    }

    // Classify reads: map them into a repository, drop system noise, and
    // flag anything outside every known repository.
    let mut detected_reads = Vec::new();
    for read in outcome.report.read_only() {
        if declared_abs.iter().any(|abs| **abs == read) {
            continue;
        }
        if SYSTEM_PREFIXES
            .iter()
            .any(|prefix| read.starts_with(*prefix))
        {
            continue;
        }

        match symbolic_in_repos(&read, repos) {
            Some((symbolic, RepoKind::Ignored)) => {
                let _ = symbolic;
            }
            Some((symbolic, _)) => {
                detected_reads.push(DetectedRead {
                    last_write_time: outcome
                        .report
                        .last_write_time(&read),
                    symbolic,
                    absolute: read,
                });
            }
            None => {
                violations.push(RuleViolation::ForeignInput {
                    command: name.to_path_buf(),
                    path: read,
                });
            }
        }
    }

    if !violations.is_empty() {
        return CommandSelfResult {
            new_state: NodeState::Failed,
            violations,
            failure: None,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            detected_reads: Vec::new(),
            output_hashes: Vec::new(),
            executed: true,
        };
    }

    // Rehash every declared output.
    let mut output_hashes = Vec::new();
    for (node_id, sym, abs) in declared {
        let lwt = std::fs::metadata(abs).and_then(|m| m.modified()).ok();
        let mut hashes = BTreeMap::new();
        for aspect in aspects.aspects() {
            if aspect.applies_to(sym) {
                if let Ok(hash) = aspect.hash(abs) {
                    hashes.insert(aspect.name().to_string(), hash);
                }
            }
        }
        output_hashes.push((*node_id, hashes, lwt));
    }

    CommandSelfResult {
        new_state: NodeState::Ok,
        violations: Vec::new(),
        failure: None,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        detected_reads,
        output_hashes,
        executed: true,
    }
}

/// Maps an absolute path into the repository containing it, yielding the
/// symbolic path.
fn symbolic_in_repos(
    path: &Path,
    repos: &[(String, PathBuf, RepoKind)],
) -> Option<(PathBuf, RepoKind)> {
    for (repo_name, root, kind) in repos {
        if let Ok(rest) = path.strip_prefix(root) {
            return Some((Path::new(repo_name).join(rest), *kind));
        }
    }
    None
}

/// Newly discovered input file nodes become the pre-commit set: they must
/// reach `Ok` (i.e. be hashed) before the command's result is committed.
pub(super) fn precommit_nodes(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> Vec<NodeId> {
    let reads: Vec<(PathBuf, Option<SystemTime>)> =
        match &ctx.nodes[id].exec.self_result {
            Some(SelfResult::Command(result)) => result
                .detected_reads
                .iter()
                .map(|r| (r.symbolic.clone(), r.last_write_time))
                .collect(),
            _ => Vec::new(),
        };

    let mut precommits = Vec::new();
    for (symbolic, _) in reads {
        let input = match ctx.nodes.find(&symbolic) {
            Some(existing) => existing,
            None => node::file::find_or_create_source_file(ctx, &symbolic),
        };
        if !precommits.contains(&input) {
            precommits.push(input);
        }
    }
    precommits
}

pub(super) fn commit_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
    result: CommandSelfResult,
) -> NodeState {
    let name = ctx.nodes[id].name().to_path_buf();
    data_mut(ctx, id).running = None;

    if !result.stdout.is_empty() || !result.stderr.is_empty() {
        if ctx.log_book().must_log_aspect(LogAspect::ScriptOutput) {
            let mut message = result.stdout.clone();
            message.push_str(&result.stderr);
            ctx.log(LogRecord::new(LogAspect::ScriptOutput, message));
        }
    }

    for violation in &result.violations {
        ctx.log(LogRecord::error(format!("{}", violation)));
    }
    if let Some(failure) = &result.failure {
        ctx.log(LogRecord::error(format!("{}", failure)));
    }

    if result.new_state != NodeState::Ok {
        return result.new_state;
    }

    // An input that is another command's output must come from a producer
    // that already completed; otherwise the build order is not trustworthy.
    let mut premature = Vec::new();
    for read in &result.detected_reads {
        if let Some(input) = ctx.nodes.find(&read.symbolic) {
            if let NodeKind::GeneratedFile(fd) = &ctx.nodes[input].kind {
                if let Some(producer) = fd.producer {
                    if ctx.nodes.contains(producer)
                        && ctx.nodes[producer].state != NodeState::Ok
                    {
                        premature.push(RuleViolation::PrematureInput {
                            command: name.clone(),
                            path: read.symbolic.clone(),
                            producer: ctx.nodes[producer]
                                .name()
                                .to_path_buf(),
                        });
                    }
                }
            }
        }
    }
    if !premature.is_empty() {
        for violation in &premature {
            ctx.log(LogRecord::new(
                LogAspect::SuspectBuildOrdering,
                format!("{}", violation),
            ));
            ctx.log(LogRecord::error(format!("{}", violation)));
        }
        return NodeState::Failed;
    }

    // Refresh the learned input set and its observer edges.
    let aspects = ctx.aspect_set(&data(ctx, id).input_aspects);
    let mut new_inputs: BTreeMap<NodeId, Hash64> = BTreeMap::new();
    for read in &result.detected_reads {
        if let Some(input) = ctx.nodes.find(&read.symbolic) {
            let aspect = aspects.applicable_to(&read.symbolic);
            let hash = node::file::hash_of(ctx, input, aspect.name());
            new_inputs.insert(input, hash);
        }
    }

    let old_inputs: Vec<NodeId> =
        data(ctx, id).detected_inputs.keys().copied().collect();
    for old in &old_inputs {
        if !new_inputs.contains_key(old) && ctx.nodes.contains(*old) {
            ctx.remove_dependant(*old, id);
        }
    }
    for input in new_inputs.keys() {
        ctx.add_dependant(*input, id);
    }

    if ctx.log_book().must_log_aspect(LogAspect::InputFiles) {
        let names: Vec<String> = new_inputs
            .keys()
            .map(|&i| ctx.nodes[i].name().to_string_lossy().into_owned())
            .collect();
        ctx.log(LogRecord::new(
            LogAspect::InputFiles,
            format!("{:?} inputs: {}", name, names.join(", ")),
        ));
    }

    // Commit output hashes and settle the output nodes.
    for (output, hashes, lwt) in &result.output_hashes {
        if !ctx.nodes.contains(*output) {
            continue;
        }
        {
            let node = &mut ctx.nodes[*output];
            if let NodeKind::GeneratedFile(fd) = &mut node.kind {
                fd.hashes = hashes.clone();
                fd.last_write_time = *lwt;
            }
            node.modified = true;
        }
        if ctx.nodes[*output].state == NodeState::Dirty {
            ctx.set_node_state(*output, NodeState::Ok);
        }
    }

    data_mut(ctx, id).detected_inputs = new_inputs;
    let execution_hash = compute_execution_hash(ctx, id);
    {
        let node = &mut ctx.nodes[id];
        match &mut node.kind {
            NodeKind::Command(d) => d.execution_hash = execution_hash,
            _ => unreachable!("command access on wrong node kind"),
        }
        node.modified = true;
    }

    if result.executed {
        ctx.log(LogRecord::progress(format!("{:?} completed", name)));
    }

    NodeState::Ok
}

/// Unlinks a command node from the graph and removes it and its outputs
/// from the context. Called by the build-file compiler when a rule
/// disappears.
pub fn dispose(ctx: &mut ExecutionContext, id: NodeId) {
    let (outputs, inputs, producers) = {
        let d = data(ctx, id);
        (
            d.outputs.clone(),
            d.detected_inputs
                .keys()
                .copied()
                .chain(d.declared_inputs.iter().copied())
                .collect::<Vec<_>>(),
            d.input_producers.clone(),
        )
    };

    for input in inputs {
        if ctx.nodes.contains(input) {
            ctx.remove_dependant(input, id);
        }
    }
    for producer in producers {
        if ctx.nodes.contains(producer) {
            ctx.remove_dependant(producer, id);
        }
    }
    for output in outputs {
        if ctx.nodes.contains(output) {
            ctx.nodes.remove(output);
        }
    }

    ctx.nodes.remove_if_present(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::file;

    #[test]
    fn reads_map_into_their_repository() {
        let repos = vec![
            (
                "main".to_string(),
                PathBuf::from("/abs/main"),
                RepoKind::Integrated,
            ),
            (
                "sys".to_string(),
                PathBuf::from("/abs/sys"),
                RepoKind::Ignored,
            ),
        ];

        let (sym, kind) =
            symbolic_in_repos(Path::new("/abs/main/src/a.cpp"), &repos)
                .unwrap();
        assert_eq!(sym, Path::new("main/src/a.cpp"));
        assert_eq!(kind, RepoKind::Integrated);

        let (_, kind) =
            symbolic_in_repos(Path::new("/abs/sys/stdio.h"), &repos)
                .unwrap();
        assert_eq!(kind, RepoKind::Ignored);

        assert!(
            symbolic_in_repos(Path::new("/elsewhere/x"), &repos).is_none()
        );
    }

    #[test]
    fn prerequisites_are_deduplicated() {
        let mut ctx = crate::context::ExecutionContext::with_log_book(
            std::sync::Arc::new(crate::logbook::MemoryLogBook::new()),
        );

        let input = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/a.h"),
        );
        let mut data =
            CommandData::new("cc a.c".to_string(), PathBuf::from("main"));
        data.declared_inputs = vec![input];
        data.detected_inputs.insert(input, crate::hash::Hash64::random());

        // The same node as declared and detected input appears once.
        assert_eq!(data.prerequisites(), vec![input]);
    }

    #[test]
    fn execution_hash_tracks_script_and_inputs() {
        let mut ctx = crate::context::ExecutionContext::with_log_book(
            std::sync::Arc::new(crate::logbook::MemoryLogBook::new()),
        );

        let input = file::find_or_create_source_file(
            &mut ctx,
            Path::new("main/a.h"),
        );
        if let super::super::NodeKind::SourceFile(fd) =
            &mut ctx.nodes[input].kind
        {
            fd.hashes.insert(
                crate::aspect::ENTIRE_FILE_ASPECT.to_string(),
                crate::hash::Hash64::from_str("v1"),
            );
        }

        let cmd = ctx.nodes.add(super::super::Node::new(
            PathBuf::from("main/.cmd-0"),
            super::super::NodeKind::Command(CommandData::new(
                "cc a.c".to_string(),
                PathBuf::from("main"),
            )),
        ));
        data_mut(&mut ctx, cmd)
            .detected_inputs
            .insert(input, crate::hash::Hash64::from_str("v1"));

        let first = compute_execution_hash(&ctx, cmd);
        assert_eq!(first, compute_execution_hash(&ctx, cmd));

        // A different input hash changes the execution hash.
        if let super::super::NodeKind::SourceFile(fd) =
            &mut ctx.nodes[input].kind
        {
            fd.hashes.insert(
                crate::aspect::ENTIRE_FILE_ASPECT.to_string(),
                crate::hash::Hash64::from_str("v2"),
            );
        }
        assert_ne!(first, compute_execution_hash(&ctx, cmd));

        // So does a different script.
        data_mut(&mut ctx, cmd).script = "cc -O2 a.c".to_string();
        assert_ne!(first, compute_execution_hash(&ctx, cmd));
    }
}
