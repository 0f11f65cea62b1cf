//! shared error type
use nix::errno::Errno;
use thiserror::Error as ThisError;

/// error type returned by every devmaster crate
#[derive(Debug, ThisError)]
pub enum Error {
    /// a syscall through `nix` failed
    #[error("{msg}: {source}")]
    Nix {
        /// context message
        msg: String,
        /// underlying errno
        source: Errno,
    },

    /// a plain std::io::Error, e.g. from file or socket operations
    #[error("{msg}: {source}")]
    Io {
        /// context message
        msg: String,
        /// underlying io error
        source: std::io::Error,
    },

    /// malformed input that could not be parsed (rule line, event buffer, record file)
    #[error("parse error: {msg}")]
    Parse {
        /// what failed to parse and why
        msg: String,
    },

    /// the record store could not persist or load a record
    #[error("persist error: {msg}")]
    Persist {
        /// context message
        msg: String,
    },

    /// setup failed in a way that should abort the daemon before it starts serving events
    #[error("fatal setup error: {msg}")]
    Fatal {
        /// context message
        msg: String,
    },
}

impl Error {
    /// the errno behind a `Nix` variant, if any
    pub fn get_errno(&self) -> Errno {
        match self {
            Error::Nix { source, .. } => *source,
            _ => Errno::UnknownErrno,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io {
            msg: "io error".to_string(),
            source,
        }
    }
}
