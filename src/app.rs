//! Core application runner for `atc-forwarder`.
//!
//! This module is decoupled from CLI parsing, logging setup and process exit
//! codes so the whole scan → decode → deliver loop can be tested with an
//! injected scanner and transport.

use crate::delivery::{
    DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES, DeliveryClient, HttpTransport, RetryPolicy,
    Transport, TransportError,
};
use crate::duration::parse_duration;
use crate::mac_address::{DeviceFilter, MacAddress};
use crate::pipeline::{
    DEFAULT_QUEUE_SIZE, DeliveryStats, Pipeline, PipelineStats, run_delivery_worker,
};
use crate::scanner::{Backend, DiscoveryEvent, ScanError};
use crate::shutdown::Shutdown;
use clap::Parser;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::info;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/api/information/create/";

/// Configuration, read once at startup.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Address of the thermometer to forward, e.g. A4:C1:38:0F:31:17
    #[arg(long, value_name = "MAC")]
    pub target: MacAddress,

    /// Collector endpoint readings are POSTed to
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// HTTP timeout per attempt (e.g. 10s, 500ms)
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Delivery attempts per reading before it is dropped
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_RETRIES,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_retries: u32,

    /// Wait after the n-th failed attempt is BACKOFF_BASE^n seconds
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE, value_parser = parse_backoff_base)]
    pub backoff_base: f64,

    /// Upper bound for a single backoff wait
    #[arg(long, value_parser = parse_duration)]
    pub max_backoff: Option<Duration>,

    /// Readings buffered for delivery before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE, value_parser = parse_queue_size)]
    pub queue_size: usize,

    /// Stop scanning after this long; scan until interrupted if unset
    #[arg(long, value_parser = parse_duration)]
    pub scan_duration: Option<Duration>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log every advertisement from the target
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            max_backoff: self.max_backoff,
        }
    }
}

fn parse_backoff_base(src: &str) -> Result<f64, String> {
    let base: f64 = src
        .trim()
        .parse()
        .map_err(|_| format!("invalid backoff base: {src}"))?;
    if !base.is_finite() || base < 1.0 {
        return Err(format!("backoff base must be at least 1, got {src}"));
    }
    Ok(base)
}

fn parse_queue_size(src: &str) -> Result<usize, String> {
    match src.trim().parse::<usize>() {
        Ok(0) => Err("queue size must be at least 1".to_string()),
        Ok(size) => Ok(size),
        Err(_) => Err(format!("invalid queue size: {src}")),
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("cannot create HTTP client: {0}")]
    Transport(#[from] TransportError),
    #[error("delivery worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pipeline: PipelineStats,
    pub delivery: DeliveryStats,
}

/// Future returned by [`Scanner::start_scan`].
pub type ScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::Receiver<DiscoveryEvent>, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(&self, backend: Backend) -> ScanFuture<'_>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(&self, backend: Backend) -> ScanFuture<'_> {
        Box::pin(async move { crate::scanner::start_scan(backend).await })
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run against the configured HTTP collector.
pub async fn run(
    options: Options,
    scanner: &dyn Scanner,
    shutdown: Shutdown,
) -> Result<RunSummary, RunError> {
    let transport = HttpTransport::new(options.endpoint.clone(), options.timeout)?;
    run_with_transport(options, scanner, transport, shutdown).await
}

/// Run the scan loop until shutdown, scan-duration expiry or scanner exit.
///
/// Shutdown aborts delivery; the other two let queued readings drain first.
pub async fn run_with_transport<T: Transport + 'static>(
    options: Options,
    scanner: &dyn Scanner,
    transport: T,
    mut shutdown: Shutdown,
) -> Result<RunSummary, RunError> {
    let (queue_tx, queue_rx) = mpsc::channel(options.queue_size);
    let client = DeliveryClient::new(transport, options.retry_policy());
    let worker = tokio::spawn(run_delivery_worker(client, queue_rx, shutdown.clone()));

    let pipeline = Pipeline::new(DeviceFilter::new(options.target), queue_tx);
    let mut events = scanner.start_scan(options.backend).await?;
    info!(
        target_device = %options.target,
        endpoint = %options.endpoint,
        backend = %options.backend,
        "scanning"
    );

    let deadline = options.scan_duration.map(|d| Instant::now() + d);
    let mut stats = PipelineStats::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.requested() => {
                info!("shutdown requested, stopping scan");
                break;
            }
            _ = deadline_reached(deadline) => {
                info!("scan duration elapsed");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    info!("scanner stopped");
                    break;
                }
            },
        };
        stats.record(&pipeline.handle(&event));
    }

    drop(events);
    drop(pipeline);
    let delivery = worker.await?;

    Ok(RunSummary {
        pipeline: stats,
        delivery,
    })
}
