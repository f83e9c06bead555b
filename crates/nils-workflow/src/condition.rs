// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Step-condition mini-language.
//!
//! Grammar (strict, no eval-equivalent anywhere):
//!
//! ```text
//! expr     := or
//! or       := and ( "||" and )*
//! and      := equality ( "&&" equality )*
//! equality := unary ( ( "==" | "!=" ) unary )*
//! unary    := "!" unary | primary
//! primary  := literal | "parameters" "." ident | "(" expr ")"
//! literal  := "true" | "false" | number | string
//! ```
//!
//! A hand-written lexer + recursive-descent parser evaluates directly
//! against the parameter map. Type mismatches, unknown references, and
//! non-boolean results are errors — the caller skips the step.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum CondValue {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl CondValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
        }
    }
}

/// Evaluate `expr` against the parameters. The result must be a boolean.
pub fn evaluate_condition(expr: &str, params: &Map<String, Value>) -> anyhow::Result<bool> {
    let tokens = lex(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
    };
    let value = parser.expr()?;
    parser.expect_end()?;
    match value {
        CondValue::Bool(b) => Ok(b),
        other => anyhow::bail!("condition evaluated to {}, expected boolean", other.type_name()),
    }
}

// ─── Lexer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    LParen,
    RParen,
    True,
    False,
    Number(f64),
    Str(String),
    Reference(String),
}

fn lex(input: &str) -> anyhow::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    anyhow::bail!("single '=' at offset {i}; use '=='");
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    anyhow::bail!("single '&' at offset {i}; use '&&'");
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    anyhow::bail!("single '|' at offset {i}; use '||'");
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => anyhow::bail!("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid number literal {text:?}"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "parameters" => {
                        if chars.get(i) != Some(&'.') {
                            anyhow::bail!("expected '.' after 'parameters'");
                        }
                        i += 1;
                        let name_start = i;
                        while i < chars.len()
                            && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                        {
                            i += 1;
                        }
                        if i == name_start {
                            anyhow::bail!("expected parameter name after 'parameters.'");
                        }
                        // No nested access: a second '.' is a syntax error.
                        if chars.get(i) == Some(&'.') {
                            anyhow::bail!("nested access is not supported");
                        }
                        tokens.push(Token::Reference(chars[name_start..i].iter().collect()));
                    }
                    other => anyhow::bail!("unknown identifier {other:?}"),
                }
            }
            other => anyhow::bail!("unexpected character {other:?} at offset {i}"),
        }
    }
    Ok(tokens)
}

// ─── Parser / evaluator ───────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a Map<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect_end(&self) -> anyhow::Result<()> {
        if self.pos != self.tokens.len() {
            anyhow::bail!("unexpected trailing tokens");
        }
        Ok(())
    }

    fn expr(&mut self) -> anyhow::Result<CondValue> {
        self.or()
    }

    fn or(&mut self) -> anyhow::Result<CondValue> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.and()?;
            left = CondValue::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn and(&mut self) -> anyhow::Result<CondValue> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.equality()?;
            left = CondValue::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn equality(&mut self) -> anyhow::Result<CondValue> {
        let mut left = self.unary()?;
        loop {
            let negate = match self.peek() {
                Some(Token::EqEq) => false,
                Some(Token::NotEq) => true,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            let equal = values_equal(&left, &right)?;
            left = CondValue::Bool(equal != negate);
        }
        Ok(left)
    }

    fn unary(&mut self) -> anyhow::Result<CondValue> {
        if self.peek() == Some(&Token::Bang) {
            self.bump();
            let value = self.unary()?;
            return Ok(CondValue::Bool(!as_bool(&value)?));
        }
        self.primary()
    }

    fn primary(&mut self) -> anyhow::Result<CondValue> {
        match self.bump() {
            Some(Token::True) => Ok(CondValue::Bool(true)),
            Some(Token::False) => Ok(CondValue::Bool(false)),
            Some(Token::Number(n)) => Ok(CondValue::Number(n)),
            Some(Token::Str(s)) => Ok(CondValue::Str(s)),
            Some(Token::Reference(name)) => self.resolve(&name),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => anyhow::bail!("missing closing parenthesis"),
                }
            }
            other => anyhow::bail!("unexpected token {other:?}"),
        }
    }

    fn resolve(&self, name: &str) -> anyhow::Result<CondValue> {
        match self.params.get(name) {
            Some(Value::Bool(b)) => Ok(CondValue::Bool(*b)),
            Some(Value::Number(n)) => Ok(CondValue::Number(n.as_f64().unwrap_or(f64::NAN))),
            Some(Value::String(s)) => Ok(CondValue::Str(s.clone())),
            Some(other) => anyhow::bail!("parameter {name} has unsupported type: {other}"),
            None => anyhow::bail!("unknown parameter: {name}"),
        }
    }
}

fn as_bool(value: &CondValue) -> anyhow::Result<bool> {
    match value {
        CondValue::Bool(b) => Ok(*b),
        other => anyhow::bail!("expected boolean operand, got {}", other.type_name()),
    }
}

fn values_equal(left: &CondValue, right: &CondValue) -> anyhow::Result<bool> {
    match (left, right) {
        (CondValue::Bool(a), CondValue::Bool(b)) => Ok(a == b),
        (CondValue::Number(a), CondValue::Number(b)) => Ok(a == b),
        (CondValue::Str(a), CondValue::Str(b)) => Ok(a == b),
        (a, b) => anyhow::bail!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
