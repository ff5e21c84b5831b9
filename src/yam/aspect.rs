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

//! File aspects: named, regex-gated projections of a file's content.
//!
//! A file node stores one hash per applicable aspect. The canonical aspect is
//! the entire-file aspect which applies to every file. A "code" style aspect
//! can restrict the hash to the parts of a file that affect compilation so
//! that, say, editing a comment does not re-run dependent commands.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ResultExt};
use crate::hash::Hash64;

pub const ENTIRE_FILE_ASPECT: &str = "entireFile";
pub const ENTIRE_FILE_SET: &str = "entireFileSet";

/// An ordered list of regular expressions. A path matches the set when it
/// matches any member.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegexSet {
    patterns: Vec<String>,

    #[serde(skip)]
    compiled: Vec<Option<Regex>>,
}

impl PartialEq for RegexSet {
    fn eq(&self, other: &RegexSet) -> bool {
        self.patterns == other.patterns
    }
}

impl Eq for RegexSet {}

impl RegexSet {
    pub fn new<I, S>(patterns: I) -> Result<RegexSet, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = RegexSet::default();
        for p in patterns {
            set.add(p.into())?;
        }
        Ok(set)
    }

    /// A pattern matching any path that has `directory` as a component.
    pub fn match_directory(directory: &str) -> String {
        // The slash pattern matches both separators so that the same exclude
        // patterns work on Windows and unix paths.
        let slash = "[/\\\\]";
        format!(
            "(.*{slash}{dir}{slash}.*)|(.*{slash}{dir}$)|(^{dir}{slash}.*)|(^{dir}$)",
            slash = slash,
            dir = regex::escape(directory)
        )
    }

    pub fn add(&mut self, pattern: String) -> Result<(), Error> {
        let re = Regex::new(&pattern)
            .with_context(|_| format!("invalid pattern {:?}", pattern))?;
        self.patterns.push(pattern);
        self.compiled.push(Some(re));
        Ok(())
    }

    pub fn matches(&self, s: &str) -> bool {
        for (i, pattern) in self.patterns.iter().enumerate() {
            let compiled = self.compiled.get(i).and_then(|c| c.as_ref());
            match compiled {
                Some(re) => {
                    if re.is_match(s) {
                        return true;
                    }
                }
                None => {
                    // Compiled lazily after deserialization. The pattern was
                    // validated when first added, so a failure here means the
                    // stored state is corrupt; treat it as a non-match.
                    if let Ok(re) = Regex::new(pattern) {
                        if re.is_match(s) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Recompiles patterns after deserialization.
    pub fn recompile(&mut self) {
        self.compiled = self
            .patterns
            .iter()
            .map(|p| Regex::new(p).ok())
            .collect();
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// How an aspect projects file content before hashing.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum Projection {
    /// Hash the whole file.
    EntireFile,

    /// Strip every match of the given patterns from the content, then hash
    /// the remainder. Used e.g. to ignore comment edits in C-like sources.
    Strip(Vec<String>),
}

/// A named, regex-gated projection of a file's content.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct FileAspect {
    name: String,

    /// The aspect applies to files whose symbolic path matches this set.
    file_patterns: RegexSet,

    projection: Projection,
}

impl FileAspect {
    pub fn new(
        name: &str,
        file_patterns: RegexSet,
        projection: Projection,
    ) -> FileAspect {
        FileAspect {
            name: name.to_string(),
            file_patterns,
            projection,
        }
    }

    /// The aspect whose hash covers all of a file's content and that applies
    /// to every file name.
    pub fn entire_file() -> FileAspect {
        FileAspect {
            name: ENTIRE_FILE_ASPECT.to_string(),
            file_patterns: RegexSet::new(vec![".*"])
                .expect("static pattern compiles"),
            projection: Projection::EntireFile,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn applies_to(&self, file_name: &Path) -> bool {
        self.file_patterns
            .matches(&file_name.to_string_lossy())
    }

    /// Hashes the applicable aspect of the file at `path`.
    pub fn hash(&self, path: &Path) -> Result<Hash64, Error> {
        match &self.projection {
            Projection::EntireFile => {
                let f = fs::File::open(path).with_context(|_| {
                    format!("could not open {:?} for hashing", path)
                })?;
                Ok(Hash64::from_reader(f)?)
            }
            Projection::Strip(patterns) => {
                let mut content = String::new();
                fs::File::open(path)
                    .and_then(|mut f| f.read_to_string(&mut content))
                    .with_context(|_| {
                        format!("could not read {:?} for hashing", path)
                    })?;

                for pattern in patterns {
                    if let Ok(re) = Regex::new(pattern) {
                        content = re.replace_all(&content, "").into_owned();
                    }
                }

                Ok(Hash64::from_str(&content))
            }
        }
    }
}

impl fmt::Display for FileAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A named set of file aspects. Command nodes reference a set by name to
/// choose which aspect of each input participates in the execution hash.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct FileAspectSet {
    name: String,
    aspects: BTreeMap<String, FileAspect>,
}

impl FileAspectSet {
    pub fn new(name: &str) -> FileAspectSet {
        FileAspectSet {
            name: name.to_string(),
            aspects: BTreeMap::new(),
        }
    }

    /// The set holding only the entire-file aspect.
    pub fn entire_file_set() -> FileAspectSet {
        let mut set = FileAspectSet::new(ENTIRE_FILE_SET);
        set.add(FileAspect::entire_file());
        set
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, aspect: FileAspect) {
        self.aspects.insert(aspect.name().to_string(), aspect);
    }

    pub fn find(&self, aspect_name: &str) -> Option<&FileAspect> {
        self.aspects.get(aspect_name)
    }

    /// The aspect of this set applicable to `file_name`. Falls back to the
    /// entire-file aspect when no specific aspect applies.
    pub fn applicable_to(&self, file_name: &Path) -> FileAspect {
        for aspect in self.aspects.values() {
            if aspect.name() != ENTIRE_FILE_ASPECT
                && aspect.applies_to(file_name)
            {
                return aspect.clone();
            }
        }
        FileAspect::entire_file()
    }

    pub fn aspects(&self) -> impl Iterator<Item = &FileAspect> {
        self.aspects.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regex_set_matches_any_member() {
        let set = RegexSet::new(vec![r"\.cpp$", r"\.h$"]).unwrap();
        assert!(set.matches("src/piet.cpp"));
        assert!(set.matches("src/piet.h"));
        assert!(!set.matches("src/piet.obj"));
    }

    #[test]
    fn match_directory_hits_nested_and_root() {
        let set =
            RegexSet::new(vec![RegexSet::match_directory("generated")])
                .unwrap();
        assert!(set.matches("repo/generated/piet.obj"));
        assert!(set.matches("repo/generated"));
        assert!(set.matches("generated/piet.obj"));
        assert!(!set.matches("repo/src/piet.cpp"));
        assert!(!set.matches("repo/degenerated/foo"));
    }

    #[test]
    fn recompile_restores_matching() {
        let set = RegexSet::new(vec![r"\.tmp$"]).unwrap();
        let bytes = bincode::serialize(&set).unwrap();
        let mut restored: RegexSet = bincode::deserialize(&bytes).unwrap();
        restored.recompile();
        assert!(restored.matches("foo.tmp"));
    }

    #[test]
    fn entire_file_applies_everywhere() {
        let aspect = FileAspect::entire_file();
        assert!(aspect.applies_to(Path::new("anything/at.all")));
    }

    #[test]
    fn strip_projection_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code.cpp");

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "int f() {{ return 3; }} // answer").unwrap();
        drop(f);

        let code = FileAspect::new(
            "code",
            RegexSet::new(vec![r"\.cpp$"]).unwrap(),
            Projection::Strip(vec![r"//[^\n]*".to_string()]),
        );

        let before = code.hash(&path).unwrap();

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "int f() {{ return 3; }} // the answer").unwrap();
        drop(f);

        assert_eq!(before, code.hash(&path).unwrap());

        let entire = FileAspect::entire_file();
        let entire_before = entire.hash(&path).unwrap();

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "int f() {{ return 4; }} // the answer").unwrap();
        drop(f);

        assert_ne!(before, code.hash(&path).unwrap());
        assert_ne!(entire_before, entire.hash(&path).unwrap());
    }

    #[test]
    fn aspect_set_falls_back_to_entire_file() {
        let set = FileAspectSet::entire_file_set();
        let aspect = set.applicable_to(Path::new("src/piet.cpp"));
        assert_eq!(aspect.name(), ENTIRE_FILE_ASPECT);
    }
}
