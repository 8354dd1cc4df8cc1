//! Statement tree for declarative pipelines.
//!
//! Declarative sections are all shaped like `name args { body }` or
//! `name args`, so the tree is generic and section meaning is assigned
//! during lowering. Groovy bodies of `script` and `expression` are captured
//! verbatim. A syntax error inside a `stage` body is confined to that
//! stage, which becomes [`NodeKind::Invalid`].

use super::lexer::{tokenize, Spanned, Token};

/// Blocks whose bodies are Groovy code, kept as source text.
const RAW_BLOCKS: &[&str] = &["script", "expression"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub args: Vec<Arg>,
    pub kind: NodeKind,
    pub line: usize,
    /// Source text of the whole statement
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Call,
    Block(Vec<Node>),
    Raw(String),
    Assign(Expr),
    /// A `stage` whose body failed to parse; holds the syntax error
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Str { value: String, interpolated: bool },
    Number(String),
    Bool(bool),
    /// Bare or dotted identifier
    Ident(String),
    Call { name: String, args: Vec<Arg> },
    List(Vec<Expr>),
    /// Anything else, as source text
    Raw(String),
}

impl Node {
    pub fn body(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Block(body) => body,
            _ => &[],
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.body().iter().find(|n| n.name == name)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.body().iter().filter(move |n| n.name == name)
    }

    /// Named argument `name`.
    pub fn arg(&self, name: &str) -> Option<&Expr> {
        self.args
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .map(|a| &a.value)
    }

    /// Positional argument at `index`.
    pub fn positional(&self, index: usize) -> Option<&Expr> {
        self.args.iter().filter(|a| a.name.is_none()).nth(index).map(|a| &a.value)
    }

    /// The named argument, falling back to the first positional one.
    pub fn arg_or_first(&self, name: &str) -> Option<&Expr> {
        self.arg(name).or_else(|| self.positional(0))
    }
}

impl Expr {
    /// Literal text of a scalar expression.
    pub fn literal(&self) -> Option<&str> {
        match self {
            Expr::Str { value, .. } | Expr::Number(value) | Expr::Ident(value) => Some(value),
            Expr::Bool(true) => Some("true"),
            Expr::Bool(false) => Some("false"),
            _ => None,
        }
    }

    /// Scalars, or every scalar of a list.
    pub fn literals(&self) -> Vec<&str> {
        match self {
            Expr::List(items) => items.iter().filter_map(Expr::literal).collect(),
            other => other.literal().into_iter().collect(),
        }
    }
}

/// Parses a Jenkinsfile into top-level statements.
///
/// # Errors
///
/// Returns a message with the line number of the first syntax error.
pub fn parse(source: &str) -> Result<Vec<Node>, String> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let nodes = parser.statements()?;
    match parser.peek() {
        Some(token) => Err(format!("line {}: unexpected '}}'", token.line)),
        None => Ok(nodes),
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek().map(|t| &t.token)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_symbol(&self, symbol: char) -> bool {
        self.peek_token() == Some(&Token::Symbol(symbol))
    }

    fn line(&self) -> usize {
        self.peek()
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.source.len(), |t| t.start)
    }

    fn previous_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map_or(0, |t| t.end)
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), String> {
        if self.at_symbol(symbol) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("line {}: expected '{symbol}'", self.line()))
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek_token() == Some(&Token::Newline) {
            self.pos += 1;
        }
    }

    /// Statements until `}` or end of input.
    fn statements(&mut self) -> Result<Vec<Node>, String> {
        let mut nodes = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek_token() {
                None | Some(Token::Symbol('}')) => return Ok(nodes),
                _ => nodes.push(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Node, String> {
        let start = self.offset();
        let line = self.line();

        let annotation = self.at_symbol('@');
        if annotation {
            self.pos += 1;
        }
        let mut name = match self.next().map(|t| t.token) {
            Some(Token::Ident(name)) => name,
            _ => return Err(format!("line {line}: expected a statement")),
        };
        if annotation {
            name.insert(0, '@');
        }
        while self.at_symbol('.') {
            self.pos += 1;
            match self.next().map(|t| t.token) {
                Some(Token::Ident(part)) => {
                    name.push('.');
                    name.push_str(&part);
                }
                _ => return Err(format!("line {line}: expected a name after '.'")),
            }
        }

        if self.peek_token() == Some(&Token::Operator("=".to_string())) {
            self.pos += 1;
            let value = self.expression()?;
            return Ok(self.node(name, Vec::new(), NodeKind::Assign(value), line, start));
        }

        let args = if self.at_symbol('(') {
            self.pos += 1;
            let args = self.arguments(')')?;
            self.expect_symbol(')')?;
            args
        } else if matches!(self.peek_token(), None | Some(Token::Newline | Token::Symbol('{' | '}'))) {
            Vec::new()
        } else {
            self.bare_arguments()?
        };

        if annotation {
            // `@Library('x') _`
            if self.peek_token() == Some(&Token::Ident("_".to_string())) {
                self.pos += 1;
            }
            return Ok(self.node(name, args, NodeKind::Call, line, start));
        }

        if !self.at_symbol('{') {
            return Ok(self.node(name, args, NodeKind::Call, line, start));
        }
        self.pos += 1;
        let kind = if RAW_BLOCKS.contains(&name.as_str()) {
            NodeKind::Raw(self.raw_body()?)
        } else {
            let body_start = self.pos;
            match self.block_body() {
                Ok(body) => NodeKind::Block(body),
                Err(message) if name == "stage" => {
                    self.pos = body_start;
                    self.raw_body()?;
                    NodeKind::Invalid(message)
                }
                Err(message) => return Err(message),
            }
        };
        Ok(self.node(name, args, kind, line, start))
    }

    /// Statements of a block, consuming the closing brace.
    fn block_body(&mut self) -> Result<Vec<Node>, String> {
        let body = self.statements()?;
        self.expect_symbol('}')?;
        Ok(body)
    }

    fn node(&self, name: String, args: Vec<Arg>, kind: NodeKind, line: usize, start: usize) -> Node {
        Node {
            name,
            args,
            kind,
            line,
            text: self.source[start..self.previous_end().max(start)].trim().to_string(),
        }
    }

    /// Body of a raw block, consuming the closing brace.
    fn raw_body(&mut self) -> Result<String, String> {
        let line = self.line();
        let start = self.previous_end();
        let mut depth = 1usize;
        while let Some(token) = self.next() {
            match token.token {
                Token::Symbol('{') => depth += 1,
                Token::Symbol('}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.source[start..token.start].trim().to_string());
                    }
                }
                _ => {}
            }
        }
        Err(format!("line {line}: unterminated block"))
    }

    /// Comma separated arguments up to `close`, which is not consumed.
    fn arguments(&mut self, close: char) -> Result<Vec<Arg>, String> {
        let mut args = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_symbol(close) {
                return Ok(args);
            }
            args.push(self.argument()?);
            self.skip_newlines();
            if self.at_symbol(',') {
                self.pos += 1;
            } else if !self.at_symbol(close) {
                return Err(format!("line {}: expected ',' or '{close}'", self.line()));
            }
        }
    }

    /// Arguments of a call without parentheses, up to the end of the line.
    fn bare_arguments(&mut self) -> Result<Vec<Arg>, String> {
        let mut args = vec![self.argument()?];
        while self.at_symbol(',') {
            self.pos += 1;
            self.skip_newlines();
            args.push(self.argument()?);
        }
        Ok(args)
    }

    fn argument(&mut self) -> Result<Arg, String> {
        let named = matches!(
            (self.peek_token(), self.tokens.get(self.pos + 1).map(|t| &t.token)),
            (Some(Token::Ident(_) | Token::Str { .. }), Some(Token::Symbol(':')))
        );
        let name = if named {
            let name = match self.next().map(|t| t.token) {
                Some(Token::Ident(name)) => name,
                Some(Token::Str { value, .. }) => value,
                _ => String::new(),
            };
            self.pos += 1;
            Some(name)
        } else {
            None
        };
        Ok(Arg {
            name,
            value: self.expression()?,
        })
    }

    /// An expression; anything beyond a simple primary is kept as raw text.
    fn expression(&mut self) -> Result<Expr, String> {
        let start = self.offset();
        let checkpoint = self.pos;
        if let Some(primary) = self.primary()? {
            if self.at_terminator() {
                return Ok(primary);
            }
        }
        self.pos = checkpoint;

        let mut depth = 0usize;
        while let Some(token) = self.peek_token() {
            match token {
                Token::Symbol('(' | '[' | '{') => depth += 1,
                Token::Symbol(')' | ']' | '}') if depth == 0 => break,
                Token::Symbol(')' | ']' | '}') => depth -= 1,
                Token::Symbol(',') | Token::Newline if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        let text = self.source[start..self.previous_end().max(start)].trim().to_string();
        if text.is_empty() {
            return Err(format!("line {}: expected an expression", self.line()));
        }
        Ok(Expr::Raw(text))
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek_token(),
            None | Some(Token::Newline | Token::Symbol(',' | ')' | ']' | '}' | '{'))
        )
    }

    fn primary(&mut self) -> Result<Option<Expr>, String> {
        let Some(token) = self.next().map(|t| t.token) else {
            return Ok(None);
        };
        Ok(match token {
            Token::Str { value, interpolated } => Some(Expr::Str { value, interpolated }),
            Token::Number(n) => Some(Expr::Number(n)),
            Token::Ident(word) if word == "true" || word == "false" => Some(Expr::Bool(word == "true")),
            Token::Ident(mut name) => {
                while self.at_symbol('.') {
                    match self.tokens.get(self.pos + 1).map(|t| &t.token) {
                        Some(Token::Ident(part)) => {
                            name.push('.');
                            name.push_str(part);
                            self.pos += 2;
                        }
                        _ => return Ok(None),
                    }
                }
                if self.at_symbol('(') {
                    self.pos += 1;
                    let args = self.arguments(')')?;
                    self.expect_symbol(')')?;
                    Some(Expr::Call { name, args })
                } else {
                    Some(Expr::Ident(name))
                }
            }
            Token::Symbol('[') => {
                let mut items = Vec::new();
                for arg in self.arguments(']')? {
                    if arg.name.is_some() {
                        return Ok(None);
                    }
                    items.push(arg.value);
                }
                self.expect_symbol(']')?;
                Some(Expr::List(items))
            }
            _ => None,
        })
    }
}
