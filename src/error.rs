//! Error/result types

use std::io;

use thiserror::Error;

/// `Result` type alias for operations that can fail with [`Error`].
pub type Result<T> = ::std::result::Result<T, Error>;

/// jamotext errors
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid file format.
    #[error("Invalid file format: {0}")]
    Format(String),

    /// Invalid argument passed at an API boundary.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A NaN was produced by a matrix operation.
    #[error("Encountered NaN")]
    Nan,

    #[error("{desc}")]
    Read {
        desc: String,
        #[source]
        error: io::Error,
    },

    /// Operation that is not available on a quantized matrix.
    #[error("Unsupported operation on a quantized matrix: {0}")]
    UnsupportedOperation(&'static str),

    #[error("{desc}")]
    Write {
        desc: String,
        #[source]
        error: io::Error,
    },
}

impl Error {
    pub fn format_error(desc: impl Into<String>) -> Self {
        Error::Format(desc.into())
    }

    pub fn invalid_argument(desc: impl Into<String>) -> Self {
        Error::InvalidArgument(desc.into())
    }

    pub fn read_error(desc: impl Into<String>, error: io::Error) -> Self {
        Error::Read {
            desc: desc.into(),
            error,
        }
    }

    pub fn write_error(desc: impl Into<String>, error: io::Error) -> Self {
        Error::Write {
            desc: desc.into(),
            error,
        }
    }
}
