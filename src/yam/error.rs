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

use std::path::PathBuf;

use failure::Fail;

/// The crate-wide error type. All other errors trickle down into this one.
pub use failure::Error;
pub use failure::ResultExt;

pub type Result<T> = std::result::Result<T, Error>;

/// An error in an input file (build file, repositories config, repository
/// name file). The build refuses to start on these.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
#[fail(
    display = "{}:{}:{}: {}",
    file, line, column, message
)]
pub struct InputError {
    /// The offending file.
    pub file: String,

    /// 1-based line of the offending token.
    pub line: usize,

    /// 1-based column of the offending token.
    pub column: usize,

    pub message: String,
}

impl InputError {
    pub fn new<F, M>(file: F, line: usize, column: usize, message: M) -> Self
    where
        F: Into<String>,
        M: Into<String>,
    {
        InputError {
            file: file.into(),
            line,
            column,
            message: message.into(),
        }
    }
}

/// A command violated the build rules. The offending command fails and the
/// failure propagates to its dependants.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum RuleViolation {
    /// The command wrote a file it did not declare as an output.
    #[fail(display = "command {:?} wrote undeclared output {:?}", command, path)]
    UndeclaredOutput { command: PathBuf, path: PathBuf },

    /// The command did not write a file it declared as an output.
    #[fail(
        display = "command {:?} did not write declared output {:?}",
        command, path
    )]
    MissingOutput { command: PathBuf, path: PathBuf },

    /// The command read a file that lies outside every known repository.
    #[fail(
        display = "command {:?} read {:?} which is outside all known \
                   repositories",
        command, path
    )]
    ForeignInput { command: PathBuf, path: PathBuf },

    /// The command read a generated file whose producer has not completed.
    /// This indicates a missing ordering dependency in the build files.
    #[fail(
        display = "command {:?} read {:?} before its producer {:?} completed",
        command, path, producer
    )]
    PrematureInput {
        command: PathBuf,
        path: PathBuf,
        producer: PathBuf,
    },

    /// Build files depend on each other in a cycle (through groups or
    /// buildfile references).
    #[fail(display = "cyclic dependency among build files: {:?}", cycle)]
    Cycle { cycle: Vec<PathBuf> },
}

/// A monitored script exited with a non-zero code. The captured output is
/// attached to the failure record.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
#[fail(display = "command {:?} exited with code {}", command, code)]
pub struct ScriptFailure {
    pub command: PathBuf,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The persistent build state cannot be read by this version of yam.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
#[fail(
    display = "build state {:?} has incompatible version {}. Delete the \
               build state and all generated outputs, then rebuild.",
    path, version
)]
pub struct IncompatibleVersion {
    pub path: PathBuf,
    pub version: u32,
}

/// An error in the client/service message exchange.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    #[fail(display = "unexpected message: {}", _0)]
    UnexpectedMessage(String),

    #[fail(display = "connection closed in the middle of a build")]
    Disconnected,
}
