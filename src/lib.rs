#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod common;
pub use common::Rate;

mod error;
pub use error::*;

pub mod cache;
pub use cache::*;

mod lock;
pub use lock::*;

mod throttle;
pub use throttle::*;

mod distributed;
pub use distributed::*;

mod runtime;

#[cfg(test)]
mod tests;
