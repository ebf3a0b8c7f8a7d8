//! Requirement expression language
//!
//! A small, Python-flavoured boolean language over resource fields, parsed
//! into an AST and never executed as code:
//!
//! ```text
//! device.category == 'AUDIO' and int(device.channels) >= 2
//! package.name in ['alsa-utils', 'pulseaudio']
//! not manifest.has_camera == 'False'
//! ```
//!
//! A requirement *program* holds one expression per non-blank line; every
//! line has to hold for the program to hold.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::common::{Error, Result};

/// Resource name that refers to the session's manifest answers
pub const MANIFEST_RESOURCE: &str = "manifest";

/// Literal values and evaluation results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    List(Vec<Value>),
}

/// Functions callable from expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Func {
    Int,
    Float,
    Bool,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        };
        f.write_str(s)
    }
}

/// Expression AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    Literal { value: Value },
    /// `resource.field`; `resource` holds the fully qualified job id
    Field { resource: String, field: String },
    List { items: Vec<Expr> },
    Call { func: Func, arg: Box<Expr> },
    Not { expr: Box<Expr> },
    And { lhs: Box<Expr>, rhs: Box<Expr> },
    Or { lhs: Box<Expr>, rhs: Box<Expr> },
    Compare { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    /// Resource ids referenced anywhere in this expression
    pub fn resource_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.collect_resources(&mut ids);
        ids
    }

    fn collect_resources(&self, ids: &mut BTreeSet<String>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Field { resource, .. } => {
                ids.insert(resource.clone());
            }
            Expr::List { items } => items.iter().for_each(|e| e.collect_resources(ids)),
            Expr::Call { arg, .. } => arg.collect_resources(ids),
            Expr::Not { expr } => expr.collect_resources(ids),
            Expr::And { lhs, rhs } | Expr::Or { lhs, rhs } | Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_resources(ids);
                rhs.collect_resources(ids);
            }
        }
    }
}

/// How bare resource names in an expression map to job ids
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Namespace used to qualify partial names
    pub namespace: Option<String>,
    /// `imports` aliases, alias -> qualified id
    pub imports: BTreeMap<String, String>,
}

impl Scope {
    pub fn new(namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            imports: BTreeMap::new(),
        }
    }

    /// Parse an `imports` field: `from <namespace> import <id> [as <alias>]` per line
    pub fn with_imports(mut self, imports: &str) -> Result<Self> {
        for line in imports.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let words: Vec<&str> = line.split_whitespace().collect();
            let (namespace, id, alias) = match words.as_slice() {
                ["from", ns, "import", id] => (*ns, *id, *id),
                ["from", ns, "import", id, "as", alias] => (*ns, *id, *alias),
                _ => {
                    return Err(Error::parse(
                        "imports",
                        format!("expected 'from <namespace> import <id> [as <alias>]', got '{}'", line),
                    ))
                }
            };
            self.imports
                .insert(alias.to_string(), format!("{}::{}", namespace, id));
        }
        Ok(self)
    }

    /// Qualify a job reference such as a `depends` entry
    pub fn qualify(&self, name: &str) -> String {
        if name.contains("::") {
            return name.to_string();
        }
        match &self.namespace {
            Some(ns) => format!("{}::{}", ns, name),
            None => name.to_string(),
        }
    }

    fn resolve_resource(&self, name: &str) -> String {
        if let Some(id) = self.imports.get(name) {
            return id.clone();
        }
        if name == MANIFEST_RESOURCE {
            return name.to_string();
        }
        self.qualify(name)
    }
}

/// A parsed requirement program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Source text of each expression, kept for diagnostics
    pub lines: Vec<String>,
    pub exprs: Vec<Expr>,
}

impl Program {
    pub fn parse(text: &str, scope: &Scope) -> Result<Self> {
        let mut lines = Vec::new();
        let mut exprs = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            exprs.push(parse_expr(line, scope)?);
            lines.push(line.to_string());
        }
        Ok(Self { lines, exprs })
    }

    pub fn resource_ids(&self) -> BTreeSet<String> {
        self.exprs.iter().flat_map(Expr::resource_ids).collect()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Parse a single expression
pub fn parse_expr(text: &str, scope: &Scope) -> Result<Expr> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
        scope,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error(format!(
            "unexpected {}",
            parser.tokens[parser.pos].describe()
        )));
    }
    Ok(expr)
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Minus,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("name '{}'", s),
            Token::Str(s) => format!("string '{}'", s),
            Token::Int(i) => format!("number {}", i),
            Token::Float(f) => format!("number {}", f),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Minus => "-",
            _ => "",
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |msg: String| Error::evaluation(text, msg);

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_eq) {
                    ('=', true) => Token::EqEq,
                    ('!', true) => Token::NotEq,
                    ('<', true) => Token::Le,
                    ('>', true) => Token::Ge,
                    ('<', false) => Token::Lt,
                    ('>', false) => Token::Gt,
                    _ => return Err(err(format!("unexpected '{}' at column {}", c, i + 1))),
                };
                i += if next_eq { 2 } else { 1 };
                tokens.push(token);
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal".into())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| err("unterminated string literal".into()))?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                if literal.contains('.') {
                    let value = literal
                        .parse::<f64>()
                        .map_err(|_| err(format!("invalid number '{}'", literal)))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = literal
                        .parse::<i64>()
                        .map_err(|_| err(format!("invalid number '{}'", literal)))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected '{}' at column {}", other, i + 1))),
        }
    }

    Ok(tokens)
}

// === Parser ===

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a Scope,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::evaluation(self.text, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(self.error(format!(
                "expected '{}', found {}",
                expected.symbol(),
                t.describe()
            ))),
            None => Err(self.error(format!("expected '{}' at end of input", expected.symbol()))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let expr = self.parse_not()?;
            return Ok(Expr::Not {
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let (op, width) = match self.peek()? {
            Token::EqEq => (CmpOp::Eq, 1),
            Token::NotEq => (CmpOp::Ne, 1),
            Token::Lt => (CmpOp::Lt, 1),
            Token::Le => (CmpOp::Le, 1),
            Token::Gt => (CmpOp::Gt, 1),
            Token::Ge => (CmpOp::Ge, 1),
            Token::Ident(s) if s == "in" => (CmpOp::In, 1),
            Token::Ident(s) if s == "not" => match self.tokens.get(self.pos + 1) {
                Some(Token::Ident(n)) if n == "in" => (CmpOp::NotIn, 2),
                _ => return None,
            },
            _ => return None,
        };
        self.pos += width;
        Some(op)
    }

    /// Chained comparisons expand like Python: `a < b < c` is `a < b and b < c`
    fn parse_comparison(&mut self) -> Result<Expr> {
        let first = self.parse_primary()?;
        let mut result: Option<Expr> = None;
        let mut lhs = first.clone();

        while let Some(op) = self.comparison_op() {
            let rhs = self.parse_primary()?;
            let cmp = Expr::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs.clone()),
            };
            result = Some(match result {
                None => cmp,
                Some(prev) => Expr::And {
                    lhs: Box::new(prev),
                    rhs: Box::new(cmp),
                },
            });
            lhs = rhs;
        }

        Ok(result.unwrap_or(first))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self
            .next()
            .ok_or_else(|| self.error("unexpected end of expression"))?;

        match token {
            Token::Str(s) => Ok(literal(Value::Str(s))),
            Token::Int(i) => Ok(literal(Value::Int(i))),
            Token::Float(f) => Ok(literal(Value::Float(f))),
            Token::Minus => match self.next() {
                Some(Token::Int(i)) => Ok(literal(Value::Int(-i))),
                Some(Token::Float(f)) => Ok(literal(Value::Float(-f))),
                _ => Err(self.error("'-' must be followed by a number")),
            },
            Token::LParen => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::List { items })
            }
            Token::Ident(name) => self.parse_name(name),
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }

    fn parse_name(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "True" => return Ok(literal(Value::Bool(true))),
            "False" => return Ok(literal(Value::Bool(false))),
            "None" => return Ok(literal(Value::None)),
            "and" | "or" | "not" | "in" => {
                return Err(self.error(format!("unexpected keyword '{}'", name)))
            }
            _ => {}
        }

        match self.peek() {
            Some(Token::LParen) => {
                let func = match name.as_str() {
                    "int" => Func::Int,
                    "float" => Func::Float,
                    "bool" => Func::Bool,
                    "len" => Func::Len,
                    _ => return Err(self.error(format!("call to unsupported function '{}'", name))),
                };
                self.pos += 1;
                let arg = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Call {
                    func,
                    arg: Box::new(arg),
                })
            }
            Some(Token::Dot) => {
                self.pos += 1;
                match self.next() {
                    Some(Token::Ident(field)) => {
                        if self.peek() == Some(&Token::Dot) {
                            return Err(self.error(format!(
                                "'{}.{}' has no attributes",
                                name, field
                            )));
                        }
                        Ok(Expr::Field {
                            resource: self.scope.resolve_resource(&name),
                            field,
                        })
                    }
                    _ => Err(self.error(format!("expected a field name after '{}.'", name))),
                }
            }
            _ => Err(self.error(format!(
                "bare name '{}' is not allowed, use <resource>.<field>",
                name
            ))),
        }
    }
}

fn literal(value: Value) -> Expr {
    Expr::Literal { value }
}
