//! Error types for the proxy pool

use std::io;
use thiserror::Error;

/// Errors surfaced by pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every entry is currently allocated; retry later
    #[error("there is no free proxy to allocate")]
    NoFreeProxy,

    /// Probes are spawned on the ambient tokio runtime, and there was none
    #[error("proxies can only be loaded from within a tokio runtime")]
    NoRuntime,

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Why a single proxy list line was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("empty host")]
    EmptyHost,
    #[error("unsupported proxy scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("unrecognized proxy format")]
    Malformed,
}

/// A rejected proxy list line, with its 1-based line number
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind} (`{content}`)")]
pub struct ParseError {
    pub line: usize,
    pub content: String,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(line: usize, content: &str, kind: ParseErrorKind) -> Self {
        Self {
            line,
            content: content.to_string(),
            kind,
        }
    }
}

/// Failures reading from or writing to the address ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io on bucket `{bucket}`: {source}")]
    Io {
        bucket: String,
        #[source]
        source: io::Error,
    },

    #[error("ledger record rejected: {0}")]
    InvalidRecord(String),
}
