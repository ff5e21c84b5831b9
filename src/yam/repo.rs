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

//! File repositories: named, mirrored directory trees.
//!
//! A repository pairs a symbolic name (the first component of every
//! symbolic path below it) with an absolute directory. It owns the mirror
//! root node and the watcher feeding the change pipeline. The repositories
//! config file declares additional repositories; `.` names the home
//! repository and is reserved.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::aspect::RegexSet;
use crate::error::{Error, InputError, ResultExt};
use crate::node::NodeId;
use crate::watch::{CollapsedChanges, DirectoryWatcher};

pub const DOT_YAM: &str = ".yam";
pub const BUILD_STATE_DIR: &str = "buildstate";
pub const SERVICE_PORT_FILE: &str = ".servicePort";
pub const CONFIG_DIR: &str = "yamConfig";
pub const REPOSITORIES_FILE: &str = "repos.txt";
pub const REPO_NAME_FILE: &str = "repoName.txt";

/// The declared integration level of a repository. Only `Ignored` changes
/// behavior (no mirror, no watcher); the others are carried as data.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
pub enum RepoKind {
    Integrated,
    Coupled,
    Tracked,
    Ignored,
}

impl RepoKind {
    fn parse(s: &str) -> Option<RepoKind> {
        match s {
            "Integrated" => Some(RepoKind::Integrated),
            "Coupled" => Some(RepoKind::Coupled),
            "Tracked" => Some(RepoKind::Tracked),
            "Ignored" => Some(RepoKind::Ignored),
            _ => None,
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepoKind::Integrated => "Integrated",
            RepoKind::Coupled => "Coupled",
            RepoKind::Tracked => "Tracked",
            RepoKind::Ignored => "Ignored",
        };
        write!(f, "{}", s)
    }
}

/// A mirrored directory tree.
pub struct FileRepository {
    pub name: String,

    /// Absolute root directory.
    pub directory: PathBuf,

    pub kind: RepoKind,

    /// Symbolic paths matching these are not mirrored.
    pub excludes: RegexSet,

    /// Names of repositories this one takes inputs from (config data).
    pub inputs: Vec<String>,

    /// The mirror root directory node. `None` for `Ignored` repositories.
    pub root_node: Option<NodeId>,

    /// Pending coalesced changes from the watcher.
    pub changes: Arc<CollapsedChanges>,

    watcher: Option<DirectoryWatcher>,

    /// Whether the repository differs from its persisted image.
    pub modified: bool,
}

impl FileRepository {
    pub fn new(
        name: &str,
        directory: PathBuf,
        kind: RepoKind,
        excludes: RegexSet,
    ) -> FileRepository {
        FileRepository {
            name: name.to_string(),
            directory,
            kind,
            excludes,
            inputs: Vec::new(),
            root_node: None,
            changes: Arc::new(CollapsedChanges::new()),
            watcher: None,
            modified: true,
        }
    }

    /// Default exclude patterns for a fresh repository: the generated
    /// output tree and the `.yam` state directory.
    pub fn default_excludes() -> RegexSet {
        RegexSet::new(vec![RegexSet::match_directory(DOT_YAM)])
            .expect("static patterns compile")
    }

    pub fn lexically_contains(&self, absolute: &Path) -> bool {
        absolute.starts_with(&self.directory)
    }

    /// The symbolic path of an absolute path inside this repository.
    pub fn symbolic_path(&self, absolute: &Path) -> Option<PathBuf> {
        absolute
            .strip_prefix(&self.directory)
            .ok()
            .map(|rest| Path::new(&self.name).join(rest))
    }

    /// The absolute path of a symbolic path inside this repository.
    pub fn absolute_path(&self, symbolic: &Path) -> Option<PathBuf> {
        symbolic
            .strip_prefix(Path::new(&self.name))
            .ok()
            .map(|rest| self.directory.join(rest))
    }

    pub fn watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Starts the recursive watcher feeding this repository's coalescing
    /// table.
    pub fn start_watching(&mut self) -> Result<(), Error> {
        if self.watcher.is_none() && self.kind != RepoKind::Ignored {
            self.watcher = Some(DirectoryWatcher::new(
                &self.directory,
                self.changes.clone(),
            )?);
        }
        Ok(())
    }

    pub fn stop_watching(&mut self) {
        self.watcher = None;
    }
}

/// One entry of the repositories config file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepoConfigEntry {
    pub name: String,
    pub directory: PathBuf,
    pub kind: RepoKind,
    pub inputs: Vec<String>,
}

/// Parses the repositories config:
///
/// ```text
/// name = other dir = ../other type = Tracked inputs = main ;
/// ```
///
/// `dir` is relative to the home repository or absolute. Names must be
/// unique; `.` is reserved for the home repository.
pub fn parse_repositories_config(
    content: &str,
    file: &str,
    home_dir: &Path,
) -> Result<Vec<RepoConfigEntry>, InputError> {
    let mut tokens = ConfigTokenizer::new(content, file);
    let mut entries: Vec<RepoConfigEntry> = Vec::new();

    loop {
        let token = tokens.next()?;
        let name_key = match token {
            None => break,
            Some(t) => t,
        };
        if name_key.text != "name" {
            return Err(tokens.error_at(
                &name_key,
                "expected `name` at start of repository entry",
            ));
        }
        tokens.expect("=")?;
        let name = tokens.value("repository name")?;

        if name.text == "." {
            return Err(tokens.error_at(
                &name,
                "`.` is reserved for the home repository",
            ));
        }
        if !Regex::new(r"^[A-Za-z0-9_-]+$")
            .expect("static pattern compiles")
            .is_match(&name.text)
        {
            return Err(
                tokens.error_at(&name, "invalid repository name")
            );
        }
        if entries.iter().any(|e| e.name == name.text) {
            return Err(tokens.error_at(
                &name,
                format!("duplicate repository name {:?}", name.text),
            ));
        }

        let dir_key = tokens.value("`dir`")?;
        if dir_key.text != "dir" {
            return Err(tokens.error_at(&dir_key, "expected `dir`"));
        }
        tokens.expect("=")?;
        let dir = tokens.value("directory path")?;
        let directory = {
            let path = Path::new(&dir.text);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                home_dir.join(path)
            }
        };

        let type_key = tokens.value("`type`")?;
        if type_key.text != "type" {
            return Err(tokens.error_at(&type_key, "expected `type`"));
        }
        tokens.expect("=")?;
        let kind_token = tokens.value("repository type")?;
        let kind = RepoKind::parse(&kind_token.text).ok_or_else(|| {
            tokens.error_at(
                &kind_token,
                "expected one of Integrated, Coupled, Tracked, Ignored",
            )
        })?;

        // Optional inputs, then the terminating `;`.
        let mut inputs = Vec::new();
        let mut token = tokens.value("`inputs` or `;`")?;
        if token.text == "inputs" {
            tokens.expect("=")?;
            loop {
                token = tokens.value("repository name or `;`")?;
                if token.text == ";" {
                    break;
                }
                inputs.push(token.text.clone());
            }
        }
        if token.text != ";" {
            return Err(tokens.error_at(&token, "expected `;`"));
        }

        entries.push(RepoConfigEntry {
            name: name.text,
            directory,
            kind,
            inputs,
        });
    }

    Ok(entries)
}

struct ConfigToken {
    text: String,
    line: usize,
    column: usize,
}

struct ConfigTokenizer<'a> {
    file: String,
    rest: &'a str,
    line: usize,
    column: usize,
}

impl<'a> ConfigTokenizer<'a> {
    fn new(content: &'a str, file: &str) -> ConfigTokenizer<'a> {
        ConfigTokenizer {
            file: file.to_string(),
            rest: content,
            line: 1,
            column: 1,
        }
    }

    fn next(&mut self) -> Result<Option<ConfigToken>, InputError> {
        // Skip whitespace and # comments.
        loop {
            let mut chars = self.rest.char_indices();
            match chars.next() {
                None => return Ok(None),
                Some((_, c)) if c.is_whitespace() => {
                    self.advance(c.len_utf8());
                }
                Some((_, '#')) => {
                    let end = self
                        .rest
                        .find('\n')
                        .unwrap_or_else(|| self.rest.len());
                    self.advance(end);
                }
                _ => break,
            }
        }

        let (line, column) = (self.line, self.column);

        let first = self.rest.chars().next().expect("non-empty");
        if first == '=' || first == ';' {
            self.advance(first.len_utf8());
            return Ok(Some(ConfigToken {
                text: first.to_string(),
                line,
                column,
            }));
        }

        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == '=' || c == ';')
            .unwrap_or_else(|| self.rest.len());
        let text = self.rest[..end].to_string();
        self.advance(end);

        Ok(Some(ConfigToken { text, line, column }))
    }

    fn value(&mut self, expected: &str) -> Result<ConfigToken, InputError> {
        match self.next()? {
            Some(token) => Ok(token),
            None => Err(InputError::new(
                self.file.clone(),
                self.line,
                self.column,
                format!("unexpected end of file, expected {}", expected),
            )),
        }
    }

    fn expect(&mut self, text: &str) -> Result<(), InputError> {
        let token = self.value(&format!("`{}`", text))?;
        if token.text != text {
            return Err(self.error_at(&token, format!("expected `{}`", text)));
        }
        Ok(())
    }

    fn error_at<M: Into<String>>(
        &self,
        token: &ConfigToken,
        message: M,
    ) -> InputError {
        InputError::new(
            self.file.clone(),
            token.line,
            token.column,
            message,
        )
    }

    fn advance(&mut self, bytes: usize) {
        for c in self.rest[..bytes].chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.rest = &self.rest[bytes..];
    }
}

/// Reads and validates `yamConfig/repoName.txt`. Falls back to the
/// directory's leaf name when the file is absent.
pub fn repository_name(repo_dir: &Path) -> Result<String, Error> {
    let path = repo_dir.join(CONFIG_DIR).join(REPO_NAME_FILE);

    if !path.is_file() {
        let leaf = repo_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "home".to_string());
        let sanitized: String = leaf
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            })
            .collect();
        return Ok(sanitized);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|_| format!("could not read {:?}", path))?;
    let name = content.trim();

    if !Regex::new(r"^[A-Za-z0-9_-]+$")
        .expect("static pattern compiles")
        .is_match(name)
    {
        return Err(InputError::new(
            path.to_string_lossy(),
            1,
            1,
            format!("invalid repository name {:?}", name),
        )
        .into());
    }

    Ok(name.to_string())
}

/// Walks up from `start` to find the directory holding `.yam`.
pub fn find_dot_yam(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(DOT_YAM).is_dir() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// The path of the service port registry below a home directory.
pub fn service_port_path(home_dir: &Path) -> PathBuf {
    home_dir.join(DOT_YAM).join(SERVICE_PORT_FILE)
}

/// The path of the persistent build state below a home directory.
pub fn build_state_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(DOT_YAM).join(BUILD_STATE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entries() {
        let content = r#"
            # two repositories
            name = other dir = ../other type = Tracked inputs = main aux ;
            name = sys dir = /usr/include type = Ignored ;
        "#;

        let entries = parse_repositories_config(
            content,
            "repos.txt",
            Path::new("/home/repo"),
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "other");
        assert_eq!(entries[0].directory, Path::new("/home/repo/../other"));
        assert_eq!(entries[0].kind, RepoKind::Tracked);
        assert_eq!(entries[0].inputs, vec!["main", "aux"]);
        assert_eq!(entries[1].directory, Path::new("/usr/include"));
        assert_eq!(entries[1].kind, RepoKind::Ignored);
        assert!(entries[1].inputs.is_empty());
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        let reserved = parse_repositories_config(
            "name = . dir = x type = Tracked ;",
            "repos.txt",
            Path::new("/h"),
        );
        assert!(reserved.is_err());

        let duplicate = parse_repositories_config(
            "name = a dir = x type = Tracked ;\n\
             name = a dir = y type = Tracked ;",
            "repos.txt",
            Path::new("/h"),
        );
        let err = duplicate.unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn rejects_bad_type() {
        let err = parse_repositories_config(
            "name = a dir = x type = Sideways ;",
            "repos.txt",
            Path::new("/h"),
        )
        .unwrap_err();
        assert!(err.message.contains("Integrated"));
    }

    #[test]
    fn symbolic_and_absolute_paths_roundtrip() {
        let repo = FileRepository::new(
            "main",
            PathBuf::from("/abs/main"),
            RepoKind::Integrated,
            RegexSet::default(),
        );

        let sym = repo
            .symbolic_path(Path::new("/abs/main/src/a.cpp"))
            .unwrap();
        assert_eq!(sym, Path::new("main/src/a.cpp"));
        assert_eq!(
            repo.absolute_path(&sym).unwrap(),
            Path::new("/abs/main/src/a.cpp")
        );
        assert!(repo.symbolic_path(Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn finds_dot_yam_upward() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("proj");
        let nested = home.join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir(home.join(DOT_YAM)).unwrap();

        assert_eq!(find_dot_yam(&nested), Some(home.clone()));
        assert_eq!(find_dot_yam(tmp.path()), None);
    }

    #[test]
    fn repo_name_falls_back_to_directory_leaf() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("my-repo");
        std::fs::create_dir(&dir).unwrap();
        assert_eq!(repository_name(&dir).unwrap(), "my-repo");

        std::fs::create_dir_all(dir.join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.join(CONFIG_DIR).join(REPO_NAME_FILE),
            "main_repo\n",
        )
        .unwrap();
        assert_eq!(repository_name(&dir).unwrap(), "main_repo");

        std::fs::write(
            dir.join(CONFIG_DIR).join(REPO_NAME_FILE),
            "bad name!\n",
        )
        .unwrap();
        assert!(repository_name(&dir).is_err());
    }
}
