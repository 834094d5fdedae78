//! Error taxonomy surfaced to the embedder via `register`/`unregister`/
//! `monitor`/`intercept`/`cancel`, plus the template-only errors that are
//! reported as notifications instead (see [`crate::template::TemplateError`]).

use thiserror::Error;

/// Errors returned synchronously from the public embedding API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("regex compile error: {0}")]
    RegexCompile(String),

    #[error("not registered")]
    NotRegistered,

    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
