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

//! yam: an incremental, dependency-learning, parallel build system.
//!
//! The core is the node graph: every build entity — source files,
//! directories, ignore files, commands, groups, build files — is a node
//! with one uniform execution protocol. Commands run under an access
//! monitor so their true inputs are learned, not declared; the filesystem
//! mirror feeds change events between builds; the whole graph persists
//! across sessions in a type-tagged store.

pub mod aspect;
pub mod buildfile;
pub mod builder;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod logbook;
pub mod monitor;
pub mod node;
pub mod repo;
pub mod server;
pub mod stats;
pub mod storage;
pub mod watch;

pub use crate::builder::{
    BuildRequest, BuildResult, BuildResultState, Builder, RequestKind,
};
pub use crate::context::ExecutionContext;
pub use crate::error::{Error, ResultExt};
pub use crate::server::{BuildClient, BuildService};
