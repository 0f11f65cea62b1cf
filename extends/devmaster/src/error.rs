//! devmaster's own error cases layered on top of `libutils::Error`
use thiserror::Error as ThisError;

/// errors raised by devmaster's own modules (queueing, rule evaluation, control protocol)
#[derive(Debug, ThisError)]
pub enum Error {
    /// a rule file predicate or action could not be evaluated (e.g. `program` exec failed)
    #[error("rule evaluation error: {msg}")]
    RuleEval {
        /// context
        msg: String,
    },

    /// the persisted record for a device could not be read or written
    #[error("record store error: {msg}")]
    Store {
        /// context
        msg: String,
    },

    /// applying a resolved device (node/symlink/rename) failed
    #[error("node applier error: {msg}")]
    Apply {
        /// context
        msg: String,
    },

    /// setup that must abort the daemon before it serves any event
    #[error("fatal setup error: {msg}")]
    Fatal {
        /// context
        msg: String,
    },

    /// wraps a lower-level shared error
    #[error(transparent)]
    Util(#[from] libutils::Error),

    /// wraps a reactor error
    #[error(transparent)]
    Event(#[from] libevent::Error),
}
