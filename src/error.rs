// ABOUTME: Phase-scoped error types shared across lexer, parser, analyzer, loader, and runtime

use crate::token::{Position, Token};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("{pos}: unexpected character {ch:?}")]
    UnexpectedChar { ch: char, pos: Position },

    #[error("{pos}: unterminated string literal")]
    UnterminatedString { pos: Position },

    #[error("{pos}: unterminated comment")]
    UnterminatedComment { pos: Position },

    #[error("{pos}: invalid number literal {lexeme:?}")]
    InvalidNumber { lexeme: String, pos: Position },
}

#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("{pos}: unexpected token {found}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        pos: Position,
    },

    #[error("{0}")]
    Lex(#[from] LexError),
}

impl ParseError {
    pub fn unexpected(found: &Token, expected: impl Into<String>) -> Self {
        ParseError::UnexpectedToken {
            found: format!("{:?} ({:?})", found.kind, found.lexeme),
            expected: expected.into(),
            pos: found.pos,
        }
    }
}

/// A single accumulated semantic diagnostic. The analyzer collects these
/// rather than terminating: `analyze()` always returns a
/// list, never bails out on the first error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SemanticError {
    #[error("duplicate declaration of {kind} {name:?}")]
    DuplicateDeclaration { kind: &'static str, name: String },

    #[error("undeclared {kind} {name:?}")]
    UndeclaredName { kind: &'static str, name: String },

    #[error("{context}: type mismatch, expected {expected}, got {actual}")]
    TypeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("{function}: expected {expected} argument(s), got {actual}")]
    ArityMismatch {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("unknown type {0:?}")]
    UnknownType(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("unit file not found for {0:?}")]
    FileNotFound(String),

    #[error("unit {declared:?} does not match requested name {requested:?}")]
    NameMismatch { requested: String, declared: String },

    #[error("circular unit dependency detected while loading {0:?}")]
    CircularDependency(String),

    #[error("unsupported bytecode version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("bad bytecode magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("parse error loading unit {name:?}: {message}")]
    ParseFailed { name: String, message: String },

    #[error("io error loading unit {name:?}: {message}")]
    Io { name: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("undeclared variable {0:?}")]
    UndeclaredVariable(String),

    #[error("nil pointer dereference")]
    NilDereference,

    #[error("invalid pointer dereference (dangling or never allocated)")]
    InvalidPointer,

    #[error("array index out of bounds: {index} not in {low}..{high}")]
    IndexOutOfBounds { index: i64, low: i64, high: i64 },

    #[error("array shape mismatch: expected {expected} indices, got {actual}")]
    ArrayShapeMismatch { expected: usize, actual: usize },

    #[error("unknown opcode at address {0}")]
    UnknownOpcode(usize),

    #[error("unresolved label {0:?}")]
    UnresolvedLabel(String),

    #[error("call to undefined function {0:?}")]
    UndefinedFunction(String),

    #[error("value is not callable")]
    NotCallable,

    #[error("{0}")]
    Other(String),
}

/// Top-level error type returned by the crate's driving entry points, so the
/// CLI (and any other host) has exactly one type to match on.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{} semantic error(s) found:\n{}", .0.len(), render_semantic_errors(.0))]
    Semantic(Vec<SemanticError>),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_semantic_errors(errors: &[SemanticError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
