//! Restricted boolean condition expressions for `conditional`, `switch`,
//! and `loop` nodes.
//!
//! Every `{{...}}` template in the raw expression is resolved first (via
//! [`super::template`]) and substituted as its stringified value; the
//! resulting string is then parsed by the small recursive-descent grammar
//! below. There is no function-call or attribute-assignment production, so
//! (unlike the donor original's `simple_eval` call) arbitrary code can
//! never be reached — malformed or disallowed syntax is a parse error, not
//! a runtime sandboxing concern.

use thiserror::Error;

use super::template::{resolve_path, OutputsTable, ResolverError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("unexpected end of condition expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}' in condition expression")]
    UnexpectedToken(String),

    #[error("expected closing parenthesis")]
    UnclosedParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    True,
    False,
    Null,
    Number(f64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    And,
    Or,
    Not,
}

fn tokenize(s: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut buf = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    buf.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ConditionError::UnexpectedEnd);
                }
                i += 1;
                tokens.push(Token::Str(buf));
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("=="));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("!="));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("<="));
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(">="));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op("<"));
                i += 1;
            }
            '>' => {
                tokens.push(Token::Op(">"));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ConditionError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    other => return Err(ConditionError::UnexpectedToken(other.to_string())),
                });
            }
            other => return Err(ConditionError::UnexpectedToken(other.to_string())),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Bool(bool),
    Null,
    Number(f64),
    Str(String),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<bool, ConditionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<bool, ConditionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = left || right;
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<bool, ConditionError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = left && right;
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<bool, ConditionError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            return Ok(!self.parse_not()?);
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<bool, ConditionError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.advance();
            let result = self.parse_expr()?;
            match self.advance() {
                Some(Token::RParen) => return Ok(result),
                _ => return Err(ConditionError::UnclosedParen),
            }
        }

        let left = self.parse_atom()?;

        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_atom()?;
            return Ok(compare(&left, op, &right));
        }

        // Bare atom in boolean position, e.g. `true` or a lone literal.
        Ok(truthy(&left))
    }

    fn parse_atom(&mut self) -> Result<Atom, ConditionError> {
        match self.advance() {
            Some(Token::True) => Ok(Atom::Bool(true)),
            Some(Token::False) => Ok(Atom::Bool(false)),
            Some(Token::Null) => Ok(Atom::Null),
            Some(Token::Number(n)) => Ok(Atom::Number(n)),
            Some(Token::Str(s)) => Ok(Atom::Str(s)),
            Some(other) => Err(ConditionError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

fn truthy(atom: &Atom) -> bool {
    match atom {
        Atom::Bool(b) => *b,
        Atom::Null => false,
        Atom::Number(n) => *n != 0.0,
        Atom::Str(s) => !s.is_empty(),
    }
}

fn compare(left: &Atom, op: &str, right: &Atom) -> bool {
    match op {
        "==" => atoms_eq(left, right),
        "!=" => !atoms_eq(left, right),
        _ => {
            let (Atom::Number(l), Atom::Number(r)) = (left, right) else {
                return false;
            };
            match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => false,
            }
        }
    }
}

fn atoms_eq(left: &Atom, right: &Atom) -> bool {
    match (left, right) {
        (Atom::Bool(a), Atom::Bool(b)) => a == b,
        (Atom::Null, Atom::Null) => true,
        (Atom::Number(a), Atom::Number(b)) => a == b,
        (Atom::Str(a), Atom::Str(b)) => a == b,
        _ => false,
    }
}

/// Substitute every `{{...}}` occurrence in `expr` with its resolved,
/// stringified value, then evaluate the resulting boolean expression.
pub fn evaluate_condition(expr: &str, outputs: &OutputsTable) -> Result<bool, ConditionError> {
    let substituted = substitute_templates(expr, outputs)?;
    let tokens = tokenize(&substituted)?;
    let mut parser = Parser { tokens, pos: 0 };
    let result = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionError::UnexpectedToken(format!(
            "trailing tokens after position {}",
            parser.pos
        )));
    }
    Ok(result)
}

fn substitute_templates(expr: &str, outputs: &OutputsTable) -> Result<String, ConditionError> {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(ConditionError::UnexpectedToken("unterminated template".into()));
        };
        let path = &after_open[..end];
        let value = resolve_path(path, outputs)?;
        out.push_str(&stringify_for_condition(&value));
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn stringify_for_condition(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{s}\""),
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => format!("\"{other}\""),
    }
}
