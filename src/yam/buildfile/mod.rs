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

//! Build files: tokenizer, recursive-descent parser and AST.
//!
//! A build file (`buildfile.yam`) holds a sequence of rules:
//!
//! ```text
//! : foreach src/*.cpp |> cat %f src/%B.h > generated/%B.obj |> generated/%B.obj <objs>
//! : <objs> |> cat generated/*.obj > generated/all.dll |> generated/all.dll
//! ```
//!
//! Inputs and outputs are globs, paths, group references (`<name>`) or bin
//! references (`{name}`); a leading `^` excludes an input pattern. The
//! script between `|> … |>` runs under the shell with `%f`, `%B` and `%o`
//! substituted.

mod parser;
mod tokens;

pub use self::parser::Parser;
pub use self::tokens::{Token, TokenKind, Tokenizer};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::Hash64;

/// The name build files go by in a repository.
pub const BUILD_FILE_NAME: &str = "buildfile.yam";

/// One input pattern of a rule.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum InputPattern {
    /// A path or glob, relative to the build file's directory.
    Path(String),

    /// `<name>`: the contents of a group.
    Group(String),

    /// `{name}`: the contents of a bin filled by earlier rules of this
    /// build file.
    Bin(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Input {
    /// `^pattern` removes matches instead of adding them.
    pub exclude: bool,
    pub pattern: InputPattern,
}

/// One output entry of a rule.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum Output {
    /// A produced file, relative to the build file's directory. `%B` is
    /// substituted per input under `foreach`.
    Path(String),

    /// `<name>`: collect this rule's outputs into a group.
    Group(String),

    /// `{name}`: collect this rule's outputs into a bin.
    Bin(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Rule {
    pub for_each: bool,
    pub inputs: Vec<Input>,
    pub script: String,
    pub outputs: Vec<Output>,

    /// 1-based line of the rule marker, for diagnostics.
    pub line: usize,
}

/// A parsed build file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct BuildFile {
    pub variables: BTreeMap<String, String>,
    pub rules: Vec<Rule>,
}

impl BuildFile {
    /// Fingerprint of the parsed content, independent of comments and
    /// whitespace.
    pub fn hash(&self) -> Hash64 {
        let bytes =
            bincode::serialize(self).expect("AST serialization is total");
        Hash64::from_bytes(&bytes)
    }
}

/// Script and output placeholder substitution.
///
/// `%f` — the rule's input paths (under `foreach`, the single current
/// input); `%B` — the stem of the first input; `%o` — the output paths.
pub fn substitute(
    template: &str,
    inputs: &[PathBuf],
    outputs: &[PathBuf],
) -> String {
    let files = inputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let outs = outputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stem = inputs
        .first()
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    template
        .replace("%f", &files)
        .replace("%o", &outs)
        .replace("%B", &stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution() {
        let inputs = vec![PathBuf::from("src/piet.cpp")];
        let outputs = vec![PathBuf::from("generated/piet.obj")];

        assert_eq!(
            substitute("cat %f > %o", &inputs, &outputs),
            "cat src/piet.cpp > generated/piet.obj"
        );
        assert_eq!(substitute("%B.h", &inputs, &outputs), "piet.h");
    }

    #[test]
    fn ast_hash_ignores_formatting_but_not_content() {
        let a = Parser::parse_str(": a.c |> cc %f |> a.o", "test").unwrap();
        let b = Parser::parse_str(
            "// comment\n:   a.c   |> cc %f |>   a.o",
            "test",
        )
        .unwrap();
        let c = Parser::parse_str(": a.c |> cc -O2 %f |> a.o", "test")
            .unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
