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

use std::collections::BTreeSet;

use crate::node::NodeId;

/// Counters maintained by the execution protocol. Main-thread only.
#[derive(Debug, Default, Clone)]
pub struct ExecutionStatistics {
    /// Nodes on which `start()` was called.
    pub started: BTreeSet<NodeId>,

    /// Nodes whose Self phase actually ran (not skipped by hash equality).
    pub self_executed: BTreeSet<NodeId>,

    /// Directories whose content was re-enumerated.
    pub updated_directories: usize,

    /// Files whose aspects were rehashed.
    pub rehashed_files: usize,

    /// Whether the per-node sets are maintained. Counting alone is cheaper
    /// for large builds; the sets are of interest to tests and diagnostics.
    pub register_nodes: bool,
}

impl ExecutionStatistics {
    pub fn new() -> ExecutionStatistics {
        ExecutionStatistics {
            register_nodes: true,
            ..ExecutionStatistics::default()
        }
    }

    pub fn register_started(&mut self, node: NodeId) {
        if self.register_nodes {
            self.started.insert(node);
        }
    }

    pub fn register_self_executed(&mut self, node: NodeId) {
        if self.register_nodes {
            self.self_executed.insert(node);
        }
    }

    pub fn register_updated_directory(&mut self) {
        self.updated_directories += 1;
    }

    pub fn register_rehashed_file(&mut self) {
        self.rehashed_files += 1;
    }

    pub fn reset(&mut self) {
        let register_nodes = self.register_nodes;
        *self = ExecutionStatistics {
            register_nodes,
            ..ExecutionStatistics::default()
        };
    }

    pub fn n_started(&self) -> usize {
        self.started.len()
    }

    pub fn n_self_executed(&self) -> usize {
        self.self_executed.len()
    }
}
