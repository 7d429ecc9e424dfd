//! Byte-rate limiting on top of a [`TokenBucket`].
//!
//! A token stands for `quantum` bytes. Byte counts rarely line up with whole
//! tokens, so a [`ByteFlow`] rounds up, takes the tokens, and remembers the
//! surplus bytes it has already paid for.

use std::io::{self, Read, Write};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::bucket::TokenBucket;
use crate::error::{RateLimitError, Result};

/// Converts byte counts into token waits against a shared bucket.
#[derive(Debug)]
pub struct ByteFlow {
    bucket: Arc<TokenBucket>,
    /// Bytes represented by one token
    quantum: usize,
    /// Bytes already paid for but not yet transferred
    borrowed: usize,
}

impl ByteFlow {
    /// Create a flow where each token of `bucket` pays for `quantum` bytes.
    pub fn new(bucket: Arc<TokenBucket>, quantum: usize) -> Result<Self> {
        if quantum == 0 {
            return Err(RateLimitError::InvalidParameter(
                "byte flow quantum is not > 0".to_string(),
            ));
        }
        Ok(Self {
            bucket,
            quantum,
            borrowed: 0,
        })
    }

    /// The bucket this flow draws from.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Bytes per token.
    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Bytes that can pass before the next token is needed.
    pub fn borrowed(&self) -> usize {
        self.borrowed
    }

    /// Wait until `n` bytes may pass, blocking the current thread.
    pub fn wait(&mut self, n: usize) {
        let tokens = self.tokens_for(n);
        if tokens > 0 {
            self.bucket.wait(tokens);
        }
    }

    /// Wait until `n` bytes may pass, on the tokio timer.
    pub async fn wait_async(&mut self, n: usize) {
        let tokens = self.tokens_for(n);
        if tokens > 0 {
            self.bucket.wait_async(tokens).await;
        }
    }

    /// Return `n` bytes that were waited for but never transferred; they
    /// pay for the next bytes instead.
    pub fn refund(&mut self, n: usize) {
        self.borrowed = self.borrowed.saturating_add(n);
    }

    /// Tokens needed for `n` more bytes, updating the borrowed balance.
    fn tokens_for(&mut self, n: usize) -> i64 {
        if n <= self.borrowed {
            self.borrowed -= n;
            return 0;
        }
        let owed = n - self.borrowed;
        let tokens = owed.div_ceil(self.quantum);
        // Surplus of the rounded-up tokens, without forming tokens * quantum
        self.borrowed = (self.quantum - owed % self.quantum) % self.quantum;
        trace!(bytes = n, tokens = tokens, borrowed = self.borrowed, "Byte flow taking tokens");
        i64::try_from(tokens).unwrap_or(i64::MAX)
    }
}

/// A reader limited to the rate of a [`ByteFlow`].
///
/// Waits after each read for the bytes actually returned.
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    flow: ByteFlow,
}

impl<R: Read> Reader<R> {
    /// Wrap `inner` so reads are limited by `flow`.
    pub fn new(inner: R, flow: ByteFlow) -> Self {
        Self { inner, flow }
    }

    /// Get a reference to the wrapped reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap into the inner reader and its flow.
    pub fn into_parts(self) -> (R, ByteFlow) {
        (self.inner, self.flow)
    }
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.flow.wait(n);
        }
        Ok(n)
    }
}

/// A writer limited to the rate of a [`ByteFlow`].
///
/// Waits before each write for the whole buffer; bytes the inner writer does
/// not accept are refunded to the flow.
#[derive(Debug)]
pub struct Writer<W> {
    inner: W,
    flow: ByteFlow,
}

impl<W: Write> Writer<W> {
    /// Wrap `inner` so writes are limited by `flow`.
    pub fn new(inner: W, flow: ByteFlow) -> Self {
        Self { inner, flow }
    }

    /// Get a reference to the wrapped writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap into the inner writer and its flow.
    pub fn into_parts(self) -> (W, ByteFlow) {
        (self.inner, self.flow)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.write(buf);
        }
        self.flow.wait(buf.len());
        match self.inner.write(buf) {
            Ok(n) => {
                self.flow.refund(buf.len() - n);
                Ok(n)
            }
            Err(e) => {
                self.flow.refund(buf.len());
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy everything from `reader` to `writer`, limited by `flow`.
///
/// Reads at most `buf_size` bytes at a time and waits for each chunk before
/// writing it. Returns the number of bytes copied.
pub async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    flow: &mut ByteFlow,
    buf_size: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        flow.wait_async(n).await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}
