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

//! The recursive-descent build-file parser: one token of lookahead,
//! syntax errors with file/line/column.

use crate::error::InputError;

use super::tokens::{Token, TokenKind, Tokenizer};
use super::{BuildFile, Input, InputPattern, Output, Rule};

pub struct Parser<'a> {
    file: &'a str,
    tokenizer: Tokenizer<'a>,
    lookahead: Token,
}

impl<'a> Parser<'a> {
    /// Parses build-file content. `file` names the source for diagnostics.
    pub fn parse_str(
        content: &'a str,
        file: &str,
    ) -> Result<BuildFile, InputError> {
        let mut tokenizer = Tokenizer::new(content);
        let lookahead = match tokenizer.next_token() {
            Some(token) => token,
            None => {
                return Err(InputError::new(
                    file,
                    tokenizer.line(),
                    tokenizer.column(),
                    "unrecognized input",
                ));
            }
        };

        let mut parser = Parser {
            file,
            tokenizer,
            lookahead,
        };
        parser.parse_file()
    }

    fn parse_file(&mut self) -> Result<BuildFile, InputError> {
        let mut build_file = BuildFile::default();

        while self.lookahead.kind != TokenKind::Eos {
            match self.lookahead.kind {
                TokenKind::Rule => {
                    build_file.rules.push(self.parse_rule()?);
                }
                _ => {
                    return Err(self.syntax_error("rule marker `:`"));
                }
            }
        }

        Ok(build_file)
    }

    fn parse_rule(&mut self) -> Result<Rule, InputError> {
        let line = self.lookahead.line;
        self.eat(TokenKind::Rule, "rule marker `:`")?;

        let for_each = if self.lookahead.kind == TokenKind::ForEach {
            self.eat(TokenKind::ForEach, "`foreach`")?;
            true
        } else {
            false
        };

        let inputs = self.parse_inputs()?;
        let script =
            self.eat(TokenKind::Script, "script `|> ... |>`")?.value;
        let outputs = self.parse_outputs()?;

        Ok(Rule {
            for_each,
            inputs,
            script,
            outputs,
            line,
        })
    }

    fn parse_inputs(&mut self) -> Result<Vec<Input>, InputError> {
        let mut inputs = Vec::new();
        while self.lookahead.kind != TokenKind::Script {
            inputs.push(self.parse_input()?);
        }
        Ok(inputs)
    }

    fn parse_input(&mut self) -> Result<Input, InputError> {
        let exclude = if self.lookahead.kind == TokenKind::Exclude {
            self.eat(TokenKind::Exclude, "`^`")?;
            true
        } else {
            false
        };

        let pattern = match self.lookahead.kind {
            TokenKind::Path => InputPattern::Path(
                self.eat(TokenKind::Path, "path")?.value,
            ),
            TokenKind::Group => InputPattern::Group(
                self.eat(TokenKind::Group, "group")?.value,
            ),
            TokenKind::Bin => {
                InputPattern::Bin(self.eat(TokenKind::Bin, "bin")?.value)
            }
            _ => {
                return Err(
                    self.syntax_error("input path, glob, group or bin")
                );
            }
        };

        Ok(Input { exclude, pattern })
    }

    fn parse_outputs(&mut self) -> Result<Vec<Output>, InputError> {
        let mut outputs = Vec::new();
        loop {
            match self.lookahead.kind {
                TokenKind::Path => outputs.push(Output::Path(
                    self.eat(TokenKind::Path, "output path")?.value,
                )),
                TokenKind::Group => outputs.push(Output::Group(
                    self.eat(TokenKind::Group, "group")?.value,
                )),
                TokenKind::Bin => outputs.push(Output::Bin(
                    self.eat(TokenKind::Bin, "bin")?.value,
                )),
                TokenKind::Rule | TokenKind::Eos => break,
                _ => {
                    return Err(
                        self.syntax_error("output path, group or bin")
                    );
                }
            }
        }
        Ok(outputs)
    }

    fn eat(
        &mut self,
        kind: TokenKind,
        expected: &str,
    ) -> Result<Token, InputError> {
        if self.lookahead.kind != kind {
            return Err(self.syntax_error(expected));
        }

        let next = match self.tokenizer.next_token() {
            Some(token) => token,
            None => {
                return Err(InputError::new(
                    self.file,
                    self.tokenizer.line(),
                    self.tokenizer.column(),
                    "unrecognized input",
                ));
            }
        };

        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn syntax_error(&self, expected: &str) -> InputError {
        InputError::new(
            self.file,
            self.lookahead.line,
            self.lookahead.column,
            format!(
                "unexpected {}, expected {}",
                describe(&self.lookahead),
                expected
            ),
        )
    }
}

fn describe(token: &Token) -> String {
    match token.kind {
        TokenKind::Eos => "end of file".to_string(),
        _ => format!("`{}`", token.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_rule() {
        let file = Parser::parse_str(
            ": src/piet.cpp |> cat %f > %o |> generated/piet.obj",
            "buildfile.yam",
        )
        .unwrap();

        assert_eq!(file.rules.len(), 1);
        let rule = &file.rules[0];
        assert!(!rule.for_each);
        assert_eq!(
            rule.inputs,
            vec![Input {
                exclude: false,
                pattern: InputPattern::Path("src/piet.cpp".to_string()),
            }]
        );
        assert_eq!(rule.script, "cat %f > %o");
        assert_eq!(
            rule.outputs,
            vec![Output::Path("generated/piet.obj".to_string())]
        );
    }

    #[test]
    fn parses_foreach_groups_and_bins() {
        let file = Parser::parse_str(
            r#"
            // compile everything
            : foreach src/*.cpp ^src/broken.cpp |> cc %f |> gen/%B.obj {objs} <objects>
            : {objs} |> link %f |> gen/out.dll
            "#,
            "buildfile.yam",
        )
        .unwrap();

        assert_eq!(file.rules.len(), 2);

        let compile = &file.rules[0];
        assert!(compile.for_each);
        assert_eq!(compile.inputs.len(), 2);
        assert!(compile.inputs[1].exclude);
        assert_eq!(
            compile.outputs,
            vec![
                Output::Path("gen/%B.obj".to_string()),
                Output::Bin("objs".to_string()),
                Output::Group("objects".to_string()),
            ]
        );

        let link = &file.rules[1];
        assert_eq!(
            link.inputs,
            vec![Input {
                exclude: false,
                pattern: InputPattern::Bin("objs".to_string()),
            }]
        );
    }

    #[test]
    fn reports_line_and_column_on_error() {
        let err = Parser::parse_str(
            ": a.c |> cc |> a.o\n^ stray |> x |> y",
            "buildfile.yam",
        )
        .unwrap_err();

        assert_eq!(err.file, "buildfile.yam");
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn missing_script_is_an_error() {
        let err =
            Parser::parse_str(": a.c b.c c.c", "buildfile.yam").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn empty_file_parses_to_no_rules() {
        let file = Parser::parse_str(
            "// nothing to see here\n/* at all */",
            "buildfile.yam",
        )
        .unwrap();
        assert!(file.rules.is_empty());
    }

    #[test]
    fn rule_with_no_inputs() {
        let file = Parser::parse_str(
            ": |> echo hello > out.txt |> out.txt",
            "buildfile.yam",
        )
        .unwrap();
        assert!(file.rules[0].inputs.is_empty());
    }
}
