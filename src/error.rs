use thiserror::Error;

pub use color_eyre::eyre::eyre;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of buffer")]
    UnexpectedEof,

    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    #[error("Invalid query: {0}")]
    InvalidQuery(&'static str),

    #[error("Bad config error: {0}")]
    BadConfig(String),

    /// An ERROR frame returned by the backend cluster.
    #[error("Backend error {code:#06x}: {message}")]
    Backend { code: i32, message: String },

    #[error("A bug in cql-proxy: {0}")]
    Bug(color_eyre::Report),
}

impl Error {
    pub fn bug(err: impl std::fmt::Debug) -> Self {
        Self::Bug(eyre!(format!("{err:#?}")))
    }
}
