//! Shared error taxonomy.
//!
//! Mirrors spec §7: each component raises a typed error that the CLI
//! collapses into `anyhow::Error` with context, while the daemon (C10) and
//! per-transaction handlers (C9) swallow-and-log instead of propagating.

use thiserror::Error;

/// Malformed policy strings, bad CLI arguments, illegal config combinations.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("{0}")]
    InvalidPolicy(String),
    #[error("{0}")]
    InvalidUrl(String),
    #[error("{0}")]
    ParseError(String),
}

/// No DB row for a URL; no dropbox contains a path.
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("no pool or dataset found for url {0}")]
    Url(String),
    #[error("no dropbox contains path {0}")]
    Path(String),
}

/// Errors surfaced by the relational store (C3).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("refusing to sync an empty sample set for host {0}; use an explicit remove instead")]
    EmptySync(String),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// Integrity problems the daemon can log and route around without crashing
/// (spec §7 IntegrityViolation): orphan transaction references, missing
/// SQLPackage rows, dropboxes that vanished mid-cycle.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("{0}")]
    Orphan(String),
}

/// Rejected, waiting, or failed authorization (spec §7 AuthError, §4.9).
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("approval is pending")]
    Waiting,
    #[error("approval was rejected")]
    Rejected,
    #[error("could not resolve authorization: {0}")]
    Failure(String),
}

/// Errors surfaced by the transaction engine (C9) and daemon store.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the filesystem-inventory engine (C11): DB round-trips,
/// encoding failures during batch insert (spec §4.11 "encoding discipline"),
/// and I/O during crawl/update.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("path is not valid UTF-8: {0}")]
    Encoding(String),
}

/// Unreadable config, unreachable DB, failed commit after retry (spec §7
/// FatalIO), and malformed configuration content.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}
