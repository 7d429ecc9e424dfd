use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratelimit::config::{BucketConfig, ThrottleConfig};
use ratelimit::ratelimit::flow;
use ratelimit::ByteFlow;

/// Copy stdin to stdout at a limited byte rate.
#[derive(Debug, Parser)]
#[command(name = "throttle", version, about)]
struct Args {
    /// Bytes per second
    #[arg(short, long, required_unless_present = "config")]
    rate: Option<f64>,

    /// Largest burst in bytes (defaults to one second of data)
    #[arg(short, long)]
    capacity: Option<i64>,

    /// Bytes paid for by one token
    #[arg(long, default_value_t = 1)]
    bytes_per_token: usize,

    /// Size of each read from stdin
    #[arg(long, default_value_t = 32 * 1024)]
    buffer_size: usize,

    /// YAML configuration file; overrides the flags above
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ThrottleConfig> {
        if let Some(path) = &self.config {
            return Ok(ThrottleConfig::from_file(path)?);
        }

        let rate = self.rate.context("--rate is required without --config")?;
        let tokens_per_sec = rate / self.bytes_per_token.max(1) as f64;
        let capacity = self
            .capacity
            .map(|bytes| bytes / self.bytes_per_token.max(1) as i64)
            .unwrap_or_else(|| tokens_per_sec.ceil() as i64)
            .max(1);

        Ok(ThrottleConfig {
            bucket: BucketConfig {
                capacity,
                rate: Some(tokens_per_sec),
                fill_interval_ms: None,
            },
            bytes_per_token: self.bytes_per_token,
            buffer_size: self.buffer_size,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the data, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Args::parse().into_config()?;
    let bucket = Arc::new(config.bucket.build()?);
    info!(
        rate = bucket.rate(),
        capacity = bucket.capacity(),
        bytes_per_token = config.bytes_per_token,
        "Throttling stdin to stdout"
    );

    let mut byte_flow = ByteFlow::new(bucket, config.bytes_per_token)?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let started = Instant::now();
    tokio::select! {
        copied = flow::copy(&mut stdin, &mut stdout, &mut byte_flow, config.buffer_size) => {
            let copied = copied?;
            let elapsed = started.elapsed();
            info!(
                bytes = copied,
                elapsed = ?elapsed,
                bytes_per_sec = copied as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
                "Copy finished"
            );
        }
        _ = shutdown_signal() => {}
    }

    // An interrupted copy may leave paid-for bytes buffered
    stdout.flush().await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
