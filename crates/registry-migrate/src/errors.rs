//! Migration router and legacy-filesystem-mirror errors.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid include/exclude filter pattern {0}: {1}")]
    InvalidFilterPattern(String, regex::Error),

    #[error("legacy filesystem mirror io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid repository path for legacy filesystem layout: {0}")]
    InvalidRepositoryPath(String),
}
