//! cross-cutting helpers shared by the devmaster crates: error type,
//! logging bootstrap and small path/device-number utilities.
pub mod devnum_util;
pub mod error;
pub mod logging;

pub use error::Error;
