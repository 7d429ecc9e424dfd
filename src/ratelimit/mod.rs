//! Token bucket state and the byte-flow helpers built on it.

mod bucket;
pub mod flow;

pub use bucket::TokenBucket;
pub use flow::{ByteFlow, Reader, Writer};
