use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(
        "Not a Git repository: {0}\n\
         Run 'git init' or choose a directory that is a Git repository."
    )]
    NotARepository(String),

    #[error("Invalid commit hash: {0}")]
    InvalidCommit(String),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}
