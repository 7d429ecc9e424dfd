//! Ratelimit - Token Bucket Rate Limiting
//!
//! This crate implements a token bucket that fills at a fixed rate up to a
//! capacity. Callers either take tokens and sleep for the returned duration,
//! or take only what is available right now. Byte-oriented readers, writers
//! and an async copy loop are layered on top of the bucket.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{RateLimitError, Result};
pub use crate::ratelimit::{ByteFlow, Reader, TokenBucket, Writer};
