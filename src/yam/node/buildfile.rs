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

//! Build-file parser and compiler nodes.
//!
//! The parser node owns one `buildfile.yam` source file; its Self phase
//! tokenizes and parses the file into an AST, keyed by the file's content
//! hash. The compiler node turns that AST into command nodes: globs are
//! resolved against the mirror, outputs become generated-file nodes, group
//! and bin references are bound, and producer back-references registered.
//! Rules are compiled in order so that a rule can name the outputs of an
//! earlier rule as inputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::GlobBuilder;

use crate::buildfile as bf;
use crate::context::ExecutionContext;
use crate::dispatch::Priority;
use crate::error::InputError;
use crate::hash::{Hash64, Hasher64};
use crate::logbook::{LogAspect, LogRecord};
use crate::node::{
    self, command, file, group, NodeId, NodeKind, NodeState, SelfResult,
};

/// Leaf names of the synthetic nodes colocated with a build file.
pub const PARSER_LEAF: &str = ".buildfile-parser";
pub const COMPILER_LEAF: &str = ".buildfile-compiler";

pub struct ParserData {
    /// The `buildfile.yam` source-file node.
    pub buildfile: NodeId,

    /// Entire-file hash of the build file at the last successful parse.
    pub hash: Hash64,

    pub ast: Option<Arc<bf::BuildFile>>,
}

impl ParserData {
    pub fn new(buildfile: NodeId) -> ParserData {
        ParserData {
            buildfile,
            hash: Hash64::random(),
            ast: None,
        }
    }
}

pub struct ParserSelfResult {
    pub new_state: NodeState,
    pub hash: Hash64,
    pub ast: Option<Arc<bf::BuildFile>>,
    pub error: Option<InputError>,
}

pub struct CompilerData {
    /// The parser node this compiler consumes.
    pub parser: NodeId,

    /// Symbolic directory of the build file; rule paths are relative to it.
    pub buildfile_dir: PathBuf,

    /// Command nodes materialized from the rules, in rule order.
    pub commands: Vec<NodeId>,

    /// Group names this build file adds outputs to.
    pub output_groups: Vec<PathBuf>,

    /// Group names this build file consumes as inputs.
    pub referenced_groups: Vec<PathBuf>,

    /// Compilers producing the referenced groups. Maintained by the
    /// builder; compiled-before edges and the cycle check run over these.
    pub group_producers: Vec<NodeId>,

    /// Fingerprint of the last compilation (AST + resolved inputs).
    pub hash: Hash64,
}

impl CompilerData {
    pub fn new(parser: NodeId, buildfile_dir: PathBuf) -> CompilerData {
        CompilerData {
            parser,
            buildfile_dir,
            commands: Vec::new(),
            output_groups: Vec::new(),
            referenced_groups: Vec::new(),
            group_producers: Vec::new(),
            hash: Hash64::random(),
        }
    }

    pub fn prerequisites(&self) -> Vec<NodeId> {
        let mut prerequisites = vec![self.parser];
        for p in &self.group_producers {
            if !prerequisites.contains(p) {
                prerequisites.push(*p);
            }
        }
        prerequisites
    }
}

/// One command to materialize, fully resolved.
pub struct CommandSpec {
    pub name: PathBuf,
    pub script: String,
    pub declared_inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub output_groups: Vec<PathBuf>,
}

pub struct CompilerSelfResult {
    pub new_state: NodeState,
    pub hash: Hash64,
    pub commands: Vec<CommandSpec>,
    pub referenced_groups: Vec<PathBuf>,
    pub output_groups: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Parser node
// ---------------------------------------------------------------------------

fn parser_data<'a>(ctx: &'a ExecutionContext, id: NodeId) -> &'a ParserData {
    match &ctx.nodes[id].kind {
        NodeKind::BuildFileParser(data) => data,
        _ => unreachable!("parser access on wrong node kind"),
    }
}

pub(super) fn parser_pending_start_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> bool {
    let data = parser_data(ctx, id);
    let current = file::hash_of(
        ctx,
        data.buildfile,
        crate::aspect::ENTIRE_FILE_ASPECT,
    );
    data.hash != current
}

pub(super) fn parser_start_self(ctx: &mut ExecutionContext, id: NodeId) {
    let buildfile = parser_data(ctx, id).buildfile;
    let sym = ctx.nodes[buildfile].name().to_path_buf();
    let abs = ctx.absolute_path(&sym);
    let hash = file::hash_of(ctx, buildfile, crate::aspect::ENTIRE_FILE_ASPECT);

    let main_queue = ctx.main_queue();
    ctx.worker_queue().push(
        Box::new(move || {
            let result = match std::fs::read_to_string(&abs) {
                Ok(content) => {
                    match bf::Parser::parse_str(
                        &content,
                        &sym.to_string_lossy(),
                    ) {
                        Ok(ast) => ParserSelfResult {
                            new_state: NodeState::Ok,
                            hash,
                            ast: Some(Arc::new(ast)),
                            error: None,
                        },
                        Err(error) => ParserSelfResult {
                            new_state: NodeState::Failed,
                            hash,
                            ast: None,
                            error: Some(error),
                        },
                    }
                }
                Err(err) => ParserSelfResult {
                    new_state: NodeState::Failed,
                    hash,
                    ast: None,
                    error: Some(InputError::new(
                        sym.to_string_lossy(),
                        0,
                        0,
                        format!("could not read build file: {}", err),
                    )),
                },
            };
            main_queue.push(Box::new(move |ctx: &mut ExecutionContext| {
                ctx.handle_self_completion(id, SelfResult::Parser(result));
            }));
        }),
        Priority::High,
    );
}

pub(super) fn parser_commit_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
    result: ParserSelfResult,
) -> NodeState {
    if let Some(error) = &result.error {
        ctx.log(LogRecord::error(format!("{}", error)));
    }
    if result.new_state != NodeState::Ok {
        return result.new_state;
    }

    let node = &mut ctx.nodes[id];
    match &mut node.kind {
        NodeKind::BuildFileParser(data) => {
            data.hash = result.hash;
            data.ast = result.ast;
        }
        _ => unreachable!("parser access on wrong node kind"),
    }
    node.modified = true;

    NodeState::Ok
}

/// Finds or creates the parser/compiler pair for a build file.
pub fn find_or_create_nodes(
    ctx: &mut ExecutionContext,
    buildfile: NodeId,
) -> (NodeId, NodeId) {
    let buildfile_name = ctx.nodes[buildfile].name().to_path_buf();
    let dir = buildfile_name
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let parser_name = dir.join(PARSER_LEAF);
    let parser = match ctx.nodes.find(&parser_name) {
        Some(existing) => existing,
        None => {
            let parser = ctx.nodes.add(node::Node::new(
                parser_name,
                NodeKind::BuildFileParser(ParserData::new(buildfile)),
            ));
            ctx.add_dependant(buildfile, parser);
            parser
        }
    };

    let compiler_name = dir.join(COMPILER_LEAF);
    let compiler = match ctx.nodes.find(&compiler_name) {
        Some(existing) => existing,
        None => {
            let compiler = ctx.nodes.add(node::Node::new(
                compiler_name,
                NodeKind::BuildFileCompiler(CompilerData::new(parser, dir)),
            ));
            ctx.add_dependant(parser, compiler);
            compiler
        }
    };

    (parser, compiler)
}

/// Removes the parser/compiler pair of a vanished build file, along with
/// every command it compiled.
pub fn remove_nodes(ctx: &mut ExecutionContext, buildfile_dir: &Path) {
    if let Some(compiler) = ctx.nodes.find(&buildfile_dir.join(COMPILER_LEAF))
    {
        let commands = compiler_data(ctx, compiler).commands.clone();
        for cmd in commands {
            command::dispose(ctx, cmd);
        }
        ctx.nodes.remove(compiler);
    }
    if let Some(parser) = ctx.nodes.find(&buildfile_dir.join(PARSER_LEAF)) {
        ctx.nodes.remove(parser);
    }
}

// ---------------------------------------------------------------------------
// Compiler node
// ---------------------------------------------------------------------------

pub fn compiler_data<'a>(
    ctx: &'a ExecutionContext,
    id: NodeId,
) -> &'a CompilerData {
    match &ctx.nodes[id].kind {
        NodeKind::BuildFileCompiler(data) => data,
        _ => unreachable!("compiler access on wrong node kind"),
    }
}

fn compiler_data_mut<'a>(
    ctx: &'a mut ExecutionContext,
    id: NodeId,
) -> &'a mut CompilerData {
    match &mut ctx.nodes[id].kind {
        NodeKind::BuildFileCompiler(data) => data,
        _ => unreachable!("compiler access on wrong node kind"),
    }
}

pub(super) fn compiler_pending_start_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> bool {
    compiler_needs_recompile(ctx, id)
}

/// Whether a fresh compilation would differ from the committed one. The
/// builder re-dirties compilers with this after group memberships move.
pub fn compiler_needs_recompile(
    ctx: &mut ExecutionContext,
    id: NodeId,
) -> bool {
    let compiled = compile(ctx, id);
    compiled.new_state != NodeState::Ok
        || compiled.hash != compiler_data(ctx, id).hash
}

pub(super) fn compiler_start_self(ctx: &mut ExecutionContext, id: NodeId) {
    // Compilation resolves globs and groups against the live mirror, so it
    // is main-thread work; only the completion is posted through the queue
    // to keep the protocol uniform.
    let result = compile(ctx, id);
    ctx.main_queue()
        .push(Box::new(move |ctx: &mut ExecutionContext| {
            ctx.handle_self_completion(id, SelfResult::Compiler(result));
        }));
}

/// Resolves the parsed rules into fully substituted command specs.
fn compile(ctx: &mut ExecutionContext, id: NodeId) -> CompilerSelfResult {
    let (parser, dir) = {
        let data = compiler_data(ctx, id);
        (data.parser, data.buildfile_dir.clone())
    };

    let ast = match parser_data(ctx, parser).ast.clone() {
        Some(ast) => ast,
        None => {
            return CompilerSelfResult {
                new_state: NodeState::Failed,
                hash: Hash64::random(),
                commands: Vec::new(),
                referenced_groups: Vec::new(),
                output_groups: Vec::new(),
                warnings: vec![format!(
                    "build file below {:?} has not been parsed",
                    dir
                )],
            };
        }
    };

    let mut commands = Vec::new();
    let mut warnings = Vec::new();
    let mut referenced_groups = Vec::new();
    let mut output_groups = Vec::new();

    // Bins are local to one build file: outputs of earlier rules,
    // collected by name.
    let mut bins: std::collections::BTreeMap<String, Vec<PathBuf>> =
        std::collections::BTreeMap::new();

    // Outputs of earlier rules in this file, so later rules can name them
    // or glob over them before the files exist on disk.
    let mut prior_outputs: Vec<PathBuf> = Vec::new();

    let mut hasher = Hasher64::new();
    hasher.put_hash(ast.hash());

    for (rule_index, rule) in ast.rules.iter().enumerate() {
        let inputs = resolve_inputs(
            ctx,
            &dir,
            rule,
            &bins,
            &prior_outputs,
            &mut referenced_groups,
            &mut warnings,
        );

        for input in &inputs {
            hasher.put_str(&input.to_string_lossy());
        }

        if rule.for_each && inputs.is_empty() {
            warnings.push(format!(
                "rule at line {} below {:?}: foreach matched no inputs",
                rule.line, dir
            ));
        }

        let instances: Vec<Vec<PathBuf>> = if rule.for_each {
            inputs.iter().map(|i| vec![i.clone()]).collect()
        } else {
            vec![inputs]
        };

        for instance in instances {
            let spec = materialize_rule(
                &dir,
                rule,
                rule_index,
                &instance,
                &mut bins,
                &mut output_groups,
            );
            prior_outputs.extend(spec.outputs.iter().cloned());
            hasher.put_str(&spec.script);
            for output in &spec.outputs {
                hasher.put_str(&output.to_string_lossy());
            }
            commands.push(spec);
        }
    }

    // Membership of consumed groups is part of the fingerprint: when a
    // group gains members, the consumers must be recompiled.
    referenced_groups.sort();
    referenced_groups.dedup();
    for group_name in &referenced_groups {
        if let Some(gid) = ctx.nodes.find(group_name) {
            if let NodeKind::Group(gd) = &ctx.nodes[gid].kind {
                hasher.put_hash(gd.hash);
            }
        }
    }

    CompilerSelfResult {
        new_state: NodeState::Ok,
        hash: hasher.finish(),
        commands,
        referenced_groups,
        output_groups,
        warnings,
    }
}

/// Resolves one rule's input patterns against the mirror, the bins and the
/// prior outputs of this build file.
fn resolve_inputs(
    ctx: &mut ExecutionContext,
    dir: &Path,
    rule: &bf::Rule,
    bins: &std::collections::BTreeMap<String, Vec<PathBuf>>,
    prior_outputs: &[PathBuf],
    referenced_groups: &mut Vec<PathBuf>,
    warnings: &mut Vec<String>,
) -> Vec<PathBuf> {
    let mut inputs: Vec<PathBuf> = Vec::new();

    for input in &rule.inputs {
        match &input.pattern {
            bf::InputPattern::Path(pattern) => {
                if input.exclude {
                    // `^pattern` prunes the inputs gathered so far.
                    if is_glob(pattern) {
                        if let Ok(glob) = GlobBuilder::new(pattern)
                            .literal_separator(true)
                            .build()
                        {
                            let matcher = glob.compile_matcher();
                            inputs.retain(|i| {
                                i.strip_prefix(dir)
                                    .map_or(true, |rel| !matcher.is_match(rel))
                            });
                        }
                    } else {
                        let excluded = dir.join(pattern);
                        inputs.retain(|i| *i != excluded);
                    }
                } else {
                    let matched = if is_glob(pattern) {
                        glob_matches(ctx, dir, pattern, prior_outputs)
                    } else {
                        vec![dir.join(pattern)]
                    };
                    for m in matched {
                        if !inputs.contains(&m) {
                            inputs.push(m);
                        }
                    }
                }
            }
            bf::InputPattern::Group(name) => {
                let group_name = dir.join(name);
                referenced_groups.push(group_name.clone());
                let gid = group::find_or_create(ctx, &group_name);
                for member in group::members(ctx, gid) {
                    let member_name =
                        ctx.nodes[member].name().to_path_buf();
                    if input.exclude {
                        inputs.retain(|i| *i != member_name);
                    } else if !inputs.contains(&member_name) {
                        inputs.push(member_name);
                    }
                }
            }
            bf::InputPattern::Bin(name) => match bins.get(name) {
                Some(members) => {
                    for member in members {
                        if input.exclude {
                            inputs.retain(|i| i != member);
                        } else if !inputs.contains(member) {
                            inputs.push(member.clone());
                        }
                    }
                }
                None => warnings.push(format!(
                    "rule at line {} below {:?}: bin {{{}}} is empty or \
                     defined by a later rule",
                    rule.line, dir, name
                )),
            },
        }
    }

    inputs.sort();
    inputs
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[')
}

/// Expands a glob against the mirrored file nodes below `dir`, plus the
/// outputs of earlier rules in the same build file.
fn glob_matches(
    ctx: &ExecutionContext,
    dir: &Path,
    pattern: &str,
    prior_outputs: &[PathBuf],
) -> Vec<PathBuf> {
    let glob = match GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
    {
        Ok(glob) => glob.compile_matcher(),
        Err(_) => return Vec::new(),
    };

    let mut matches = Vec::new();

    for (_, node) in ctx.nodes.iter() {
        let is_file = match &node.kind {
            NodeKind::SourceFile(_) | NodeKind::GeneratedFile(_) => true,
            _ => false,
        };
        if !is_file {
            continue;
        }
        if let Ok(relative) = node.name().strip_prefix(dir) {
            if glob.is_match(relative) {
                matches.push(node.name().to_path_buf());
            }
        }
    }

    for output in prior_outputs {
        if let Ok(relative) = output.strip_prefix(dir) {
            if glob.is_match(relative) && !matches.contains(output) {
                matches.push(output.clone());
            }
        }
    }

    matches.sort();
    matches
}

/// Builds the command spec for one rule instance, substituting script and
/// output placeholders.
fn materialize_rule(
    dir: &Path,
    rule: &bf::Rule,
    rule_index: usize,
    inputs: &[PathBuf],
    bins: &mut std::collections::BTreeMap<String, Vec<PathBuf>>,
    output_groups: &mut Vec<PathBuf>,
) -> CommandSpec {
    // Scripts see build-dir-relative paths.
    let relative_inputs: Vec<PathBuf> = inputs
        .iter()
        .map(|i| {
            i.strip_prefix(dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| i.clone())
        })
        .collect();

    let mut outputs = Vec::new();
    let mut relative_outputs = Vec::new();
    let mut groups = Vec::new();
    let mut bin_targets = Vec::new();

    for output in &rule.outputs {
        match output {
            bf::Output::Path(pattern) => {
                let substituted =
                    bf::substitute(pattern, &relative_inputs, &[]);
                relative_outputs.push(PathBuf::from(&substituted));
                outputs.push(dir.join(substituted));
            }
            bf::Output::Group(name) => groups.push(dir.join(name)),
            bf::Output::Bin(name) => bin_targets.push(name.clone()),
        }
    }

    for group_name in &groups {
        if !output_groups.contains(group_name) {
            output_groups.push(group_name.clone());
        }
    }
    for bin in bin_targets {
        bins.entry(bin).or_default().extend(outputs.iter().cloned());
    }

    let script =
        bf::substitute(&rule.script, &relative_inputs, &relative_outputs);

    let name = if rule.for_each {
        let stem = inputs
            .first()
            .and_then(|i| i.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        dir.join(format!(".cmd-{}-{}", rule_index, stem))
    } else {
        dir.join(format!(".cmd-{}", rule_index))
    };

    CommandSpec {
        name,
        script,
        declared_inputs: inputs.to_vec(),
        outputs,
        output_groups: groups,
    }
}

pub(super) fn compiler_commit_self(
    ctx: &mut ExecutionContext,
    id: NodeId,
    result: CompilerSelfResult,
) -> NodeState {
    for warning in &result.warnings {
        ctx.log(LogRecord::warning(warning.clone()));
    }
    if result.new_state != NodeState::Ok {
        return result.new_state;
    }

    let old_commands = compiler_data(ctx, id).commands.clone();
    let mut new_commands = Vec::new();
    let mut group_members: std::collections::BTreeMap<PathBuf, Vec<NodeId>> =
        std::collections::BTreeMap::new();

    let buildfile_dir = compiler_data(ctx, id).buildfile_dir.clone();

    for spec in &result.commands {
        let cmd = materialize_command(ctx, &buildfile_dir, spec);
        new_commands.push(cmd);

        for group_name in &spec.output_groups {
            let outputs = command::data(ctx, cmd).outputs.clone();
            group_members
                .entry(group_name.clone())
                .or_default()
                .extend(outputs);
        }
    }

    // Commands whose rule disappeared are disposed together with their
    // outputs.
    for old in old_commands {
        if !new_commands.contains(&old) && ctx.nodes.contains(old) {
            command::dispose(ctx, old);
        }
    }

    for (group_name, members) in group_members {
        let gid = group::find_or_create(ctx, &group_name);
        let mut all = group::members(ctx, gid);
        for m in members {
            if !all.contains(&m) {
                all.push(m);
            }
        }
        group::set_members(ctx, gid, all);
    }

    {
        let data = compiler_data_mut(ctx, id);
        data.commands = new_commands;
        data.referenced_groups = result.referenced_groups;
        data.output_groups = result.output_groups;
        data.hash = result.hash;
    }
    ctx.nodes[id].modified = true;

    ctx.log(LogRecord::new(
        LogAspect::Scope,
        format!(
            "compiled build file below {:?}: {} command(s)",
            buildfile_dir,
            compiler_data(ctx, id).commands.len()
        ),
    ));

    NodeState::Ok
}

/// Creates or updates the command node for a spec, with all bindings.
fn materialize_command(
    ctx: &mut ExecutionContext,
    working_dir: &Path,
    spec: &CommandSpec,
) -> NodeId {
    let cmd = match ctx.nodes.find(&spec.name) {
        Some(existing) => existing,
        None => ctx.nodes.add(node::Node::new(
            spec.name.clone(),
            NodeKind::Command(command::CommandData::new(
                spec.script.clone(),
                working_dir.to_path_buf(),
            )),
        )),
    };

    // Outputs.
    let mut outputs = Vec::new();
    for output_name in &spec.outputs {
        let output = file::find_or_create_generated_file(ctx, output_name, cmd);
        ctx.add_dependant(output, cmd);
        ctx.add_dependant(cmd, output);
        outputs.push(output);
    }

    // Declared inputs: resolved file nodes; a path that resolves to
    // another command's output also records that command as a producer.
    let mut declared_inputs = Vec::new();
    let mut producers = Vec::new();
    for input_name in &spec.declared_inputs {
        let input = match ctx.nodes.find(input_name) {
            Some(existing) => existing,
            None => file::find_or_create_source_file(ctx, input_name),
        };
        declared_inputs.push(input);
        ctx.add_dependant(input, cmd);

        if let NodeKind::GeneratedFile(fd) = &ctx.nodes[input].kind {
            if let Some(producer) = fd.producer {
                if producer != cmd && !producers.contains(&producer) {
                    producers.push(producer);
                }
            }
        }
    }
    for producer in &producers {
        ctx.add_dependant(*producer, cmd);
    }

    let changed = {
        let data = command::data(ctx, cmd);
        data.script != spec.script
            || data.outputs != outputs
            || data.declared_inputs != declared_inputs
            || data.input_producers != producers
    };

    {
        let data = command::data_mut(ctx, cmd);
        data.script = spec.script.clone();
        data.outputs = outputs;
        data.declared_inputs = declared_inputs;
        data.input_producers = producers;
    }

    if changed {
        ctx.nodes[cmd].modified = true;
        ctx.set_node_state(cmd, NodeState::Dirty);
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_names_are_stable_per_rule_and_input() {
        let rule = bf::Rule {
            for_each: true,
            inputs: Vec::new(),
            script: "cc %f".to_string(),
            outputs: vec![bf::Output::Path("gen/%B.obj".to_string())],
            line: 1,
        };
        let mut bins = std::collections::BTreeMap::new();
        let mut groups = Vec::new();

        let spec = materialize_rule(
            Path::new("repo"),
            &rule,
            3,
            &[PathBuf::from("repo/src/piet.cpp")],
            &mut bins,
            &mut groups,
        );

        assert_eq!(spec.name, PathBuf::from("repo/.cmd-3-piet"));
        assert_eq!(spec.script, "cc src/piet.cpp");
        assert_eq!(spec.outputs, vec![PathBuf::from("repo/gen/piet.obj")]);
    }

    #[test]
    fn bins_collect_rule_outputs() {
        let rule = bf::Rule {
            for_each: false,
            inputs: Vec::new(),
            script: "touch %o".to_string(),
            outputs: vec![
                bf::Output::Path("a.out".to_string()),
                bf::Output::Bin("all".to_string()),
            ],
            line: 1,
        };
        let mut bins = std::collections::BTreeMap::new();
        let mut groups = Vec::new();

        materialize_rule(
            Path::new("repo"),
            &rule,
            0,
            &[],
            &mut bins,
            &mut groups,
        );

        assert_eq!(bins["all"], vec![PathBuf::from("repo/a.out")]);
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob("src/*.cpp"));
        assert!(is_glob("src/piet.?pp"));
        assert!(is_glob("src/[ab].c"));
        assert!(!is_glob("src/piet.cpp"));
    }
}
