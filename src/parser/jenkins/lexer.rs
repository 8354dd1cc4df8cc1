//! Tokenizer for the declarative Jenkinsfile subset of Groovy.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    /// String literal; `interpolated` for double-quoted forms
    Str { value: String, interpolated: bool },
    Number(String),
    /// One of `{ } ( ) [ ] , : . ? @`
    Symbol(char),
    Operator(String),
    /// A character outside the supported subset, such as the `\` of a slashy regex
    Other(char),
    /// End of statement: newline or `;`
    Newline,
}

/// A token with its byte range and line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

const OPERATORS: &[&str] = &[
    "==~", "=~", "==", "!=", "&&", "||", "<=", ">=", "->", "?:", "=", "!", "<", ">", "+", "-", "*", "/", "%", "~", "&",
    "|",
];

/// Splits `source` into tokens.
///
/// # Errors
///
/// Returns a message with the line number for unterminated strings or
/// comments. Unknown characters become [`Token::Other`] and are left to the
/// parser.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, String> {
    let mut lexer = Lexer {
        source,
        pos: 0,
        line: 1,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    line: usize,
    tokens: Vec<Spanned>,
}

impl Lexer<'_> {
    fn rest(&self) -> &str {
        &self.source[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn advance(&mut self, bytes: usize) {
        let target = self.pos + bytes;
        while self.pos < target {
            self.bump();
        }
    }

    fn push(&mut self, token: Token, start: usize, line: usize) {
        self.tokens.push(Spanned {
            token,
            start,
            end: self.pos,
            line,
        });
    }

    fn run(&mut self) -> Result<(), String> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            let line = self.line;
            match c {
                '\n' | ';' => {
                    self.bump();
                    self.push(Token::Newline, start, line);
                }
                '\\' if self.rest().starts_with("\\\n") => self.advance(2),
                c if c.is_whitespace() => {
                    self.bump();
                }
                '#' if start == 0 && self.rest().starts_with("#!") => self.skip_line(),
                '/' if self.rest().starts_with("//") => self.skip_line(),
                '/' if self.rest().starts_with("/*") => {
                    let end = self
                        .rest()
                        .find("*/")
                        .ok_or_else(|| format!("line {line}: unterminated comment"))?;
                    self.advance(end + 2);
                }
                '\'' | '"' => {
                    let (value, interpolated) = self.string(c)?;
                    self.push(Token::Str { value, interpolated }, start, line);
                }
                c if c.is_ascii_digit() => {
                    while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
                        self.bump();
                    }
                    let text = self.source[start..self.pos].to_string();
                    self.push(Token::Number(text), start, line);
                }
                c if c.is_alphabetic() || c == '_' || c == '$' => {
                    while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$') {
                        self.bump();
                    }
                    let text = self.source[start..self.pos].to_string();
                    self.push(Token::Ident(text), start, line);
                }
                '{' | '}' | '(' | ')' | '[' | ']' | ',' | ':' | '.' | '?' | '@' if !self.rest().starts_with("?:") => {
                    self.bump();
                    self.push(Token::Symbol(c), start, line);
                }
                _ => match OPERATORS.iter().find(|op| self.rest().starts_with(*op)) {
                    Some(operator) => {
                        self.advance(operator.len());
                        self.push(Token::Operator((*operator).to_string()), start, line);
                    }
                    None => {
                        self.bump();
                        self.push(Token::Other(c), start, line);
                    }
                },
            }
        }
        Ok(())
    }

    fn skip_line(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.bump();
        }
    }

    fn string(&mut self, quote: char) -> Result<(String, bool), String> {
        let line = self.line;
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let is_triple = self.rest().starts_with(&triple);
        self.advance(if is_triple { 3 } else { 1 });

        let mut value = String::new();
        loop {
            if is_triple && self.rest().starts_with(&triple) {
                self.advance(3);
                break;
            }
            match self.bump() {
                None => return Err(format!("line {line}: unterminated string")),
                Some(c) if c == quote && !is_triple => break,
                Some('\n') if !is_triple => return Err(format!("line {line}: unterminated string")),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\n') => {}
                    Some(other) => value.push(other),
                    None => return Err(format!("line {line}: unterminated string")),
                },
                Some(c) => value.push(c),
            }
        }
        Ok((value, quote == '"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source)
            .expect("Should tokenize")
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_step_call() {
        assert_eq!(
            tokens("sh 'make test' // run"),
            vec![
                Token::Ident("sh".to_string()),
                Token::Str {
                    value: "make test".to_string(),
                    interpolated: false
                },
            ]
        );
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let source = "sh '''\n  make\n  make install\n'''";
        let spanned = tokenize(source).expect("Should tokenize");
        assert_eq!(spanned.len(), 2);
        assert_eq!(
            spanned[1].token,
            Token::Str {
                value: "\n  make\n  make install\n".to_string(),
                interpolated: false
            }
        );
    }

    #[test]
    fn test_escapes_and_interpolation_flag() {
        assert_eq!(
            tokens(r#""echo \$HOME""#),
            vec![Token::Str {
                value: "echo $HOME".to_string(),
                interpolated: true
            }]
        );
    }

    #[test]
    fn test_operators_and_lines() {
        let spanned = tokenize("a == 'b'\n/* x\n y */ c != d").expect("Should tokenize");
        assert_eq!(spanned[1].token, Token::Operator("==".to_string()));
        assert_eq!(spanned[3].token, Token::Newline);
        assert_eq!(spanned[4].line, 3);
        assert_eq!(spanned[5].token, Token::Operator("!=".to_string()));
    }

    #[test]
    fn test_unknown_characters_are_kept() {
        let spanned = tokenize("env.BRANCH_NAME ==~ /release\\/.*/").expect("Should tokenize");
        assert!(spanned.iter().any(|t| t.token == Token::Other('\\')));
        assert_eq!(spanned[3].token, Token::Operator("==~".to_string()));
    }

    #[test]
    fn test_unterminated_string_reports_line() {
        let error = tokenize("x\nsh 'oops\n").unwrap_err();
        assert!(error.starts_with("line 2"), "Should report line: {error}");
    }
}
