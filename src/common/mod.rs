//! Common utilities and types

pub mod addr;
pub mod error;
pub mod net;

pub use addr::{ProxyUrl, TargetAddr};
pub use error::{Error, Result};
