//! Rule conditions: a small boolean expression language parsed once at load
//! time into a tagged tree and evaluated against an [`EvidenceSnapshot`].
//!
//! ```text
//! expr     := or
//! or       := and ( "OR" and )*
//! and      := unary ( "AND" unary )*
//! unary    := "NOT" unary | primary
//! primary  := "(" expr ")" | "true" | "false"
//!           | STRING "in" ( labels | categories | text )
//!           | "text" "matches" STRING
//!           | "status" ( "==" | "!=" ) STATUS
//!           | "band" ( "==" | "!=" ) BAND
//!           | FLAG
//!           | field CMP NUMBER
//! field    := confidence | local_confidence | detections | latency_ms
//!           | label_confidence "(" STRING ")" | category_confidence "(" STRING ")"
//! ```
//!
//! Keywords are case-insensitive. A comparison whose field has no value
//! (no verdict, no such label) is false regardless of the operator.

use std::fmt;

use regex::Regex;
use thiserror::Error;

use crate::core::evidence::{ConfidenceBand, EvidenceSnapshot, VerdictStatus};

const FLOAT_EQ_EPSILON: f64 = 1e-9;

/// Parse failure with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at offset {offset}: {message}")]
pub struct ConditionError {
    pub offset: usize,
    pub message: String,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => (lhs - rhs).abs() < FLOAT_EQ_EPSILON,
            Self::Ne => (lhs - rhs).abs() >= FLOAT_EQ_EPSILON,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        })
    }
}

/// Numeric evidence fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Top category confidence of a successful verdict.
    Confidence,
    /// Highest local candidate confidence.
    LocalConfidence,
    /// Number of local candidates.
    Detections,
    /// Arbitration latency, when a verdict exists.
    LatencyMs,
    LabelConfidence(String),
    CategoryConfidence(String),
}

/// Collections a string can be tested for membership in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Labels,
    Categories,
    /// Substring of any recognized text, case-insensitive.
    Text,
}

/// Verdict status as seen by rules; `Absent` when nothing was arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusValue {
    Success,
    Timeout,
    Error,
    CircuitOpen,
    Absent,
}

/// Boolean evidence flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    RateLimited,
    DeadlineElapsed,
    Unprocessable,
    Escalated,
    VerdictOk,
}

/// Parsed condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    Const(bool),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    In {
        needle: String,
        collection: Collection,
    },
    Compare {
        field: Field,
        op: CmpOp,
        value: f64,
    },
    Status {
        negate: bool,
        status: StatusValue,
    },
    Band {
        negate: bool,
        band: ConfidenceBand,
    },
    Flag(Flag),
    TextMatches(Regex),
}

impl Condition {
    /// Parse `source` into a condition tree.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let cond = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(ConditionError {
                offset: tok.offset,
                message: format!("unexpected {}", tok.kind),
            });
        }
        Ok(cond)
    }

    /// Whether the condition holds for `evidence`.
    #[must_use]
    pub fn holds(&self, evidence: &EvidenceSnapshot) -> bool {
        match self {
            Self::Const(b) => *b,
            Self::And(a, b) => a.holds(evidence) && b.holds(evidence),
            Self::Or(a, b) => a.holds(evidence) || b.holds(evidence),
            Self::Not(inner) => !inner.holds(evidence),
            Self::In { needle, collection } => match collection {
                Collection::Labels => evidence.detections.has_label(needle),
                Collection::Categories => evidence
                    .verdict
                    .as_deref()
                    .is_some_and(|v| v.has_category(needle)),
                Collection::Text => evidence
                    .detections
                    .texts()
                    .any(|t| t.to_lowercase().contains(needle.as_str())),
            },
            Self::Compare { field, op, value } => {
                field_value(field, evidence).is_some_and(|lhs| op.apply(lhs, *value))
            }
            Self::Status { negate, status } => {
                let actual = match evidence.verdict.as_deref().map(|v| v.status()) {
                    None => StatusValue::Absent,
                    Some(VerdictStatus::Success) => StatusValue::Success,
                    Some(VerdictStatus::Timeout) => StatusValue::Timeout,
                    Some(VerdictStatus::Error) => StatusValue::Error,
                    Some(VerdictStatus::CircuitOpen) => StatusValue::CircuitOpen,
                };
                (actual == *status) != *negate
            }
            Self::Band { negate, band } => (evidence.band == *band) != *negate,
            Self::Flag(flag) => match flag {
                Flag::RateLimited => evidence.rate_limited(),
                Flag::DeadlineElapsed => evidence.deadline_elapsed(),
                Flag::Unprocessable => evidence.detections.is_unprocessable(),
                Flag::Escalated => evidence.gate.is_escalate(),
                Flag::VerdictOk => evidence.verdict_ok(),
            },
            Self::TextMatches(re) => evidence.detections.texts().any(|t| re.is_match(t)),
        }
    }
}

fn field_value(field: &Field, evidence: &EvidenceSnapshot) -> Option<f64> {
    let verdict = evidence.verdict.as_deref();
    match field {
        Field::Confidence => verdict.and_then(|v| v.top_confidence()),
        Field::LocalConfidence => evidence.detections.max_confidence(),
        #[allow(clippy::cast_precision_loss)]
        Field::Detections => Some(evidence.detections.len() as f64),
        #[allow(clippy::cast_precision_loss)]
        Field::LatencyMs => verdict.map(|v| v.latency_ms() as f64),
        Field::LabelConfidence(label) => evidence.detections.label_confidence(label),
        Field::CategoryConfidence(cat) => verdict.and_then(|v| v.category_confidence(cat)),
    }
}

// ──────────────────── tokenizer ────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "`{s}`"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Num(n) => write!(f, "number {n}"),
            Self::Op(op) => write!(f, "`{op}`"),
            Self::LParen => write!(f, "`(`"),
            Self::RParen => write!(f, "`)`"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                tokens.push(Token { kind: TokenKind::LParen, offset: start });
            }
            b')' => {
                i += 1;
                tokens.push(Token { kind: TokenKind::RParen, offset: start });
            }
            b'"' => {
                i += 1;
                let mut value = String::new();
                let mut closed = false;
                let mut chars = source[i..].char_indices();
                while let Some((off, ch)) = chars.next() {
                    match ch {
                        '"' => {
                            i += off + 1;
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, esc @ ('"' | '\\'))) => value.push(esc),
                            Some((_, other)) => {
                                value.push('\\');
                                value.push(other);
                            }
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(err(start, "unterminated string"));
                }
                tokens.push(Token { kind: TokenKind::Str(value), offset: start });
            }
            b'>' | b'<' | b'=' | b'!' => {
                let two = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, two) {
                    (b'>', true) => CmpOp::Ge,
                    (b'>', false) => CmpOp::Gt,
                    (b'<', true) => CmpOp::Le,
                    (b'<', false) => CmpOp::Lt,
                    (b'=', true) => CmpOp::Eq,
                    (b'!', true) => CmpOp::Ne,
                    _ => return Err(err(start, "expected `==` or `!=`")),
                };
                i += if two { 2 } else { 1 };
                tokens.push(Token { kind: TokenKind::Op(op), offset: start });
            }
            b'0'..=b'9' | b'-' | b'.' => {
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &source[start..i];
                let value: f64 = text
                    .parse()
                    .map_err(|_| err(start, format!("invalid number `{text}`")))?;
                tokens.push(Token { kind: TokenKind::Num(value), offset: start });
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(source[start..i].to_ascii_lowercase()),
                    offset: start,
                });
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(err(start, format!("unexpected character `{ch}`")));
            }
        }
    }
    Ok(tokens)
}

fn err(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError {
        offset,
        message: message.into(),
    }
}

// ──────────────────── parser ────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ConditionError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| err(self.end, "unexpected end of condition"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token { kind: TokenKind::Ident(s), .. }) if s == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ConditionError> {
        let tok = self.next()?;
        match &tok.kind {
            TokenKind::Ident(s) if s == kw => Ok(()),
            other => Err(err(tok.offset, format!("expected `{kw}`, found {other}"))),
        }
    }

    fn expect_string(&mut self) -> Result<String, ConditionError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Str(s) => Ok(s),
            other => Err(err(tok.offset, format!("expected string, found {other}"))),
        }
    }

    fn expr(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.unary()?;
        while self.eat_keyword("and") {
            let rhs = self.unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Condition, ConditionError> {
        if self.eat_keyword("not") {
            return Ok(Condition::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Condition, ConditionError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::LParen => {
                let inner = self.expr()?;
                let close = self.next()?;
                if close.kind != TokenKind::RParen {
                    return Err(err(close.offset, format!("expected `)`, found {}", close.kind)));
                }
                Ok(inner)
            }
            TokenKind::Str(needle) => {
                self.expect_keyword("in")?;
                let coll = self.next()?;
                let collection = match &coll.kind {
                    TokenKind::Ident(s) if s == "labels" => Collection::Labels,
                    TokenKind::Ident(s) if s == "categories" => Collection::Categories,
                    TokenKind::Ident(s) if s == "text" => Collection::Text,
                    other => {
                        return Err(err(
                            coll.offset,
                            format!("expected `labels`, `categories` or `text`, found {other}"),
                        ));
                    }
                };
                Ok(Condition::In {
                    needle: needle.trim().to_lowercase(),
                    collection,
                })
            }
            TokenKind::Ident(name) => self.ident(&name, tok.offset),
            other => Err(err(tok.offset, format!("unexpected {other}"))),
        }
    }

    fn ident(&mut self, name: &str, offset: usize) -> Result<Condition, ConditionError> {
        match name {
            "true" => Ok(Condition::Const(true)),
            "false" => Ok(Condition::Const(false)),
            "rate_limited" => Ok(Condition::Flag(Flag::RateLimited)),
            "deadline_elapsed" => Ok(Condition::Flag(Flag::DeadlineElapsed)),
            "unprocessable" => Ok(Condition::Flag(Flag::Unprocessable)),
            "escalated" => Ok(Condition::Flag(Flag::Escalated)),
            "verdict_ok" => Ok(Condition::Flag(Flag::VerdictOk)),
            "text" => {
                self.expect_keyword("matches")?;
                let str_offset = self.peek().map_or(self.end, |t| t.offset);
                let pattern = self.expect_string()?;
                let re = Regex::new(&pattern)
                    .map_err(|e| err(str_offset, format!("invalid regex: {e}")))?;
                Ok(Condition::TextMatches(re))
            }
            "status" => {
                let negate = self.equality()?;
                let tok = self.next()?;
                let status = match &tok.kind {
                    TokenKind::Ident(s) => match s.as_str() {
                        "success" => StatusValue::Success,
                        "timeout" => StatusValue::Timeout,
                        "error" => StatusValue::Error,
                        "circuit_open" => StatusValue::CircuitOpen,
                        "absent" => StatusValue::Absent,
                        _ => return Err(err(tok.offset, format!("unknown status `{s}`"))),
                    },
                    other => return Err(err(tok.offset, format!("expected status, found {other}"))),
                };
                Ok(Condition::Status { negate, status })
            }
            "band" => {
                let negate = self.equality()?;
                let tok = self.next()?;
                let band = match &tok.kind {
                    TokenKind::Ident(s) => match s.as_str() {
                        "none" => ConfidenceBand::None,
                        "low" => ConfidenceBand::Low,
                        "ambiguous" => ConfidenceBand::Ambiguous,
                        "high" => ConfidenceBand::High,
                        _ => return Err(err(tok.offset, format!("unknown band `{s}`"))),
                    },
                    other => return Err(err(tok.offset, format!("expected band, found {other}"))),
                };
                Ok(Condition::Band { negate, band })
            }
            _ => {
                let field = self.field(name, offset)?;
                let op_tok = self.next()?;
                let TokenKind::Op(op) = op_tok.kind else {
                    return Err(err(
                        op_tok.offset,
                        format!("expected comparison operator, found {}", op_tok.kind),
                    ));
                };
                let num_tok = self.next()?;
                let TokenKind::Num(value) = num_tok.kind else {
                    return Err(err(num_tok.offset, format!("expected number, found {}", num_tok.kind)));
                };
                Ok(Condition::Compare { field, op, value })
            }
        }
    }

    /// `==` → false, `!=` → true.
    fn equality(&mut self) -> Result<bool, ConditionError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Op(CmpOp::Eq) => Ok(false),
            TokenKind::Op(CmpOp::Ne) => Ok(true),
            other => Err(err(tok.offset, format!("expected `==` or `!=`, found {other}"))),
        }
    }

    fn field(&mut self, name: &str, offset: usize) -> Result<Field, ConditionError> {
        match name {
            "confidence" => Ok(Field::Confidence),
            "local_confidence" => Ok(Field::LocalConfidence),
            "detections" => Ok(Field::Detections),
            "latency_ms" => Ok(Field::LatencyMs),
            "label_confidence" | "category_confidence" => {
                let open = self.next()?;
                if open.kind != TokenKind::LParen {
                    return Err(err(open.offset, format!("expected `(`, found {}", open.kind)));
                }
                let arg = self.expect_string()?.trim().to_lowercase();
                let close = self.next()?;
                if close.kind != TokenKind::RParen {
                    return Err(err(close.offset, format!("expected `)`, found {}", close.kind)));
                }
                Ok(if name == "label_confidence" {
                    Field::LabelConfidence(arg)
                } else {
                    Field::CategoryConfidence(arg)
                })
            }
            other => Err(err(offset, format!("unknown field `{other}`"))),
        }
    }
}
