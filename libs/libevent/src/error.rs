use thiserror::Error as ThisError;

/// errors raised by the reactor
#[derive(Debug, ThisError)]
pub enum Error {
    /// epoll_create/epoll_ctl/epoll_wait failed
    #[error("epoll error: {msg}: {source}")]
    Epoll {
        /// context
        msg: String,
        /// underlying io error
        source: std::io::Error,
    },

    /// a source was registered twice under the same token
    #[error("source already registered: {0}")]
    AlreadyRegistered(u64),

    /// a source was looked up by a token that isn't registered
    #[error("unknown source token: {0}")]
    NotFound(u64),

    /// the source's own dispatch callback failed
    #[error("dispatch error: {0}")]
    Dispatch(String),
}
