use std::io;

use thiserror::Error;

/// Crate-wide error. One variant per failure kind; the query layer
/// decides which kinds are user errors and which are fatal.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("parser error at line {line}, column {column}: {msg}")]
    Parser {
        msg: String,
        line: u32,
        column: u32,
    },

    #[error("binder error: {0}")]
    Binder(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("copy error: {0}")]
    Copy(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("buffer pool exhausted: every frame is pinned")]
    BufferPoolExhausted,

    /// A sibling copy task failed first; this task stopped early.
    #[error("interrupted")]
    Interrupt,
}

impl DbError {
    pub fn copy<S: Into<String>>(msg: S) -> Self {
        DbError::Copy(msg.into())
    }

    pub fn binder<S: Into<String>>(msg: S) -> Self {
        DbError::Binder(msg.into())
    }

    pub fn catalog<S: Into<String>>(msg: S) -> Self {
        DbError::Catalog(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        DbError::Corruption(msg.into())
    }

    pub fn parser<S: Into<String>>(msg: S, line: u32, column: u32) -> Self {
        DbError::Parser {
            msg: msg.into(),
            line,
            column,
        }
    }

    /// Exit code when the library is wrapped in a CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            DbError::Parser { .. }
            | DbError::Binder(_)
            | DbError::Catalog(_)
            | DbError::Copy(_)
            | DbError::Transaction(_) => 1,
            DbError::Io(_) | DbError::BufferPoolExhausted | DbError::Interrupt => 2,
            DbError::Corruption(_) => 3,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
