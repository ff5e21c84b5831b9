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

//! Group nodes.
//!
//! A group names a collection of nodes. Build rules can put outputs into a
//! group (`<objects>`) and other rules can consume the group as an input.
//! The builder also uses ephemeral groups as scope roots: "all dirty X of
//! kind K" becomes one group started as a single sub-graph.
//!
//! A group has no Self work. Its members are its prerequisites, so starting
//! a group runs all dirty members and the group's terminal state aggregates
//! theirs.

use std::path::Path;

use crate::context::ExecutionContext;
use crate::hash::Hash64;
use crate::node::{Node, NodeId, NodeKind};

pub struct GroupData {
    pub members: Vec<NodeId>,

    /// Fingerprint over the sorted member names. Changes when the
    /// membership changes, which dirties group consumers.
    pub hash: Hash64,
}

impl GroupData {
    pub fn new() -> GroupData {
        GroupData {
            members: Vec::new(),
            hash: Hash64::combine(Vec::new()),
        }
    }
}

impl Default for GroupData {
    fn default() -> GroupData {
        GroupData::new()
    }
}

/// Finds the named group node, creating it when absent.
pub fn find_or_create(ctx: &mut ExecutionContext, name: &Path) -> NodeId {
    if let Some(id) = ctx.nodes.find(name) {
        return id;
    }
    ctx.nodes.add(Node::new(
        name.to_path_buf(),
        NodeKind::Group(GroupData::new()),
    ))
}

/// Replaces the member set, maintaining observer edges and recomputing the
/// membership hash. The group turns dirty when the membership changed.
pub fn set_members(
    ctx: &mut ExecutionContext,
    id: NodeId,
    members: Vec<NodeId>,
) {
    let old = match &ctx.nodes[id].kind {
        NodeKind::Group(data) => data.members.clone(),
        _ => unreachable!("group access on wrong node kind"),
    };

    if old == members {
        return;
    }

    for m in &old {
        if ctx.nodes.contains(*m) {
            ctx.remove_dependant(*m, id);
        }
    }
    for m in &members {
        ctx.add_dependant(*m, id);
    }

    let mut names: Vec<String> = members
        .iter()
        .map(|&m| ctx.nodes[m].name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let hash = Hash64::combine(names.iter().map(|n| Hash64::from_str(n)));

    let node = &mut ctx.nodes[id];
    match &mut node.kind {
        NodeKind::Group(data) => {
            data.members = members;
            data.hash = hash;
        }
        _ => unreachable!("group access on wrong node kind"),
    }
    node.modified = true;
    ctx.set_node_state(id, crate::node::NodeState::Dirty);
}

/// Adds a member, keeping the membership hash current.
pub fn add_member(ctx: &mut ExecutionContext, id: NodeId, member: NodeId) {
    let mut members = match &ctx.nodes[id].kind {
        NodeKind::Group(data) => data.members.clone(),
        _ => unreachable!("group access on wrong node kind"),
    };
    if !members.contains(&member) {
        members.push(member);
        set_members(ctx, id, members);
    }
}

pub fn members(ctx: &ExecutionContext, id: NodeId) -> Vec<NodeId> {
    match &ctx.nodes[id].kind {
        NodeKind::Group(data) => data.members.clone(),
        _ => unreachable!("group access on wrong node kind"),
    }
}
