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

//! The build-file tokenizer.
//!
//! A fixed, ordered list of token specs is tried against the cursor; the
//! first match wins. Whitespace and comments are consumed and skipped. The
//! script spec matches `|> … |>` with the shortest possible body. Word-like
//! text becomes either the `foreach` keyword or a path/glob token.

use regex::Regex;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TokenKind {
    /// `:`
    Rule,
    /// `foreach`
    ForEach,
    /// `^`
    Exclude,
    /// `|> … |>`, value is the script body.
    Script,
    /// `<name>`, value is the name.
    Group,
    /// `{name}`, value is the name.
    Bin,
    /// A path or glob.
    Path,
    /// End of input.
    Eos,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,

    /// 1-based position of the token start.
    pub line: usize,
    pub column: usize,
}

struct Spec {
    kind: Option<TokenKind>,
    re: Regex,

    /// Capture group holding the token value.
    group: usize,
}

fn specs() -> Vec<Spec> {
    let spec = |kind: Option<TokenKind>, pattern: &str, group: usize| Spec {
        kind,
        re: Regex::new(pattern).expect("static token spec compiles"),
        group,
    };

    vec![
        // Skipped: whitespace and comments.
        spec(None, r"^\s+", 0),
        spec(None, r"^//[^\n]*", 0),
        spec(None, r"^/\*(?s:.)*?\*/", 0),
        // The script body is everything between |> and the next |>.
        spec(Some(TokenKind::Script), r"^\|>((?s:.)*?)\|>", 1),
        spec(Some(TokenKind::Rule), r"^:", 0),
        spec(Some(TokenKind::Exclude), r"^\^", 0),
        spec(Some(TokenKind::Group), r"^<([^>\s]+)>", 1),
        spec(Some(TokenKind::Bin), r"^\{([^}\s]+)\}", 1),
        // Word-like: either the `foreach` keyword or a path/glob.
        spec(Some(TokenKind::Path), r"^[\w./*?\[\]%@+=,~-]+", 0),
    ]
}

pub struct Tokenizer<'a> {
    content: &'a str,
    specs: Vec<Spec>,
    cursor: usize,

    /// 1-based location of the cursor.
    line: usize,
    column: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(content: &'a str) -> Tokenizer<'a> {
        Tokenizer {
            content,
            specs: specs(),
            cursor: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn eos(&self) -> bool {
        self.cursor >= self.content.len()
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// The next significant token, or `None` when no spec matches (a lexical
    /// error at the current location).
    pub fn next_token(&mut self) -> Option<Token> {
        loop {
            if self.eos() {
                return Some(Token {
                    kind: TokenKind::Eos,
                    value: String::new(),
                    line: self.line,
                    column: self.column,
                });
            }

            let rest = &self.content[self.cursor..];
            let mut matched = None;
            for spec in &self.specs {
                if let Some(caps) = spec.re.captures(rest) {
                    let all = caps.get(0).expect("group 0 always present");
                    let value = caps
                        .get(spec.group)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    matched = Some((spec.kind, all.end(), value));
                    break;
                }
            }

            let (kind, consumed, value) = matched?;
            let (line, column) = (self.line, self.column);
            self.advance(consumed);

            match kind {
                None => continue,
                Some(TokenKind::Path) if value == "foreach" => {
                    return Some(Token {
                        kind: TokenKind::ForEach,
                        value,
                        line,
                        column,
                    });
                }
                Some(TokenKind::Script) => {
                    return Some(Token {
                        kind: TokenKind::Script,
                        value: value.trim().to_string(),
                        line,
                        column,
                    });
                }
                Some(kind) => {
                    return Some(Token {
                        kind,
                        value,
                        line,
                        column,
                    });
                }
            }
        }
    }

    fn advance(&mut self, consumed: usize) {
        let eaten = &self.content[self.cursor..self.cursor + consumed];
        for c in eaten.chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.cursor += consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(content: &str) -> Vec<Token> {
        let mut tokenizer = Tokenizer::new(content);
        let mut result = Vec::new();
        loop {
            let token = tokenizer.next_token().expect("lexical error");
            if token.kind == TokenKind::Eos {
                break;
            }
            result.push(token);
        }
        result
    }

    #[test]
    fn tokenizes_a_rule() {
        let ts = tokens(": foreach src/*.cpp |> cc %f |> gen/%B.obj");
        let kinds: Vec<_> = ts.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Rule,
                TokenKind::ForEach,
                TokenKind::Path,
                TokenKind::Script,
                TokenKind::Path,
            ]
        );
        assert_eq!(ts[2].value, "src/*.cpp");
        assert_eq!(ts[3].value, "cc %f");
        assert_eq!(ts[4].value, "gen/%B.obj");
    }

    #[test]
    fn skips_comments_and_whitespace() {
        let ts = tokens(
            "// a line comment\n/* a block\ncomment */ : a.c |> cc |> a.o",
        );
        assert_eq!(ts[0].kind, TokenKind::Rule);
        assert_eq!(ts[0].line, 3);
    }

    #[test]
    fn script_is_non_greedy() {
        let ts = tokens(": a |> first |> b : c |> second |> d");
        let scripts: Vec<_> = ts
            .iter()
            .filter(|t| t.kind == TokenKind::Script)
            .map(|t| t.value.clone())
            .collect();
        assert_eq!(scripts, vec!["first", "second"]);
    }

    #[test]
    fn groups_bins_and_excludes() {
        let ts = tokens(": <objs> {bin} ^src/skip.c |> link |> out.dll");
        assert_eq!(ts[1].kind, TokenKind::Group);
        assert_eq!(ts[1].value, "objs");
        assert_eq!(ts[2].kind, TokenKind::Bin);
        assert_eq!(ts[2].value, "bin");
        assert_eq!(ts[3].kind, TokenKind::Exclude);
        assert_eq!(ts[4].kind, TokenKind::Path);
        assert_eq!(ts[4].value, "src/skip.c");
    }

    #[test]
    fn tracks_line_and_column() {
        let ts = tokens(":\n  a.c |> cc |> a.o");
        assert_eq!(ts[0].line, 1);
        assert_eq!(ts[0].column, 1);
        assert_eq!(ts[1].line, 2);
        assert_eq!(ts[1].column, 3);
    }

    #[test]
    fn foreach_is_a_keyword_but_similar_paths_are_not() {
        let ts = tokens("foreach foreach.txt");
        assert_eq!(ts[0].kind, TokenKind::ForEach);
        assert_eq!(ts[1].kind, TokenKind::Path);
        assert_eq!(ts[1].value, "foreach.txt");
    }
}
