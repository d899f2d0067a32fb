/*!
Observability infrastructure for zchain.

This module provides:
- Tracing subscriber setup (stderr plus an appended log file)
- Prometheus metrics instrumentation (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LoggingConfig, SCRIPT_ID};
use crate::{Result, ZchainError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<ZchainMetrics> = OnceLock::new();

/// Metrics collection for backup, restore and cleanup runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct ZchainMetrics {
    pub backups_total: Counter,
    pub backup_failures_total: Counter,
    pub restores_total: Counter,
    pub verification_failures_total: Counter,
    pub pruned_chains_total: Counter,
    pub artifact_size_bytes: Histogram,
    pub pipeline_duration_seconds: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl ZchainMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| metrics_error(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metrics_error(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };
        let backups_total = counter("zchain_backups_total", "Backup artifacts produced")?;
        let backup_failures_total =
            counter("zchain_backup_failures_total", "Backup runs that failed")?;
        let restores_total = counter("zchain_restores_total", "Artifacts applied by restores")?;
        let verification_failures_total = counter(
            "zchain_verification_failures_total",
            "Artifacts that failed header verification",
        )?;
        let pruned_chains_total =
            counter("zchain_pruned_chains_total", "Chains removed by retention")?;

        let histogram = |opts: HistogramOpts| -> Result<Histogram> {
            let name = opts.common_opts.name.clone();
            let histogram = Histogram::with_opts(opts)
                .map_err(|e| metrics_error(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(histogram.clone()))
                .map_err(|e| metrics_error(format!("Failed to register {name}: {e}")))?;
            Ok(histogram)
        };
        let artifact_size_bytes = histogram(
            HistogramOpts::new("zchain_artifact_size_bytes", "Size of published artifacts")
                .buckets(prometheus::exponential_buckets(1024.0, 8.0, 10).unwrap_or_default()),
        )?;
        let pipeline_duration_seconds = histogram(
            HistogramOpts::new(
                "zchain_pipeline_duration_seconds",
                "Wall time of external command pipelines",
            )
            .buckets(prometheus::exponential_buckets(0.1, 4.0, 10).unwrap_or_default()),
        )?;

        Ok(Self {
            backups_total,
            backup_failures_total,
            restores_total,
            verification_failures_total,
            pruned_chains_total,
            artifact_size_bytes,
            pipeline_duration_seconds,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static ZchainMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize zchain metrics"))
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metrics_error(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| metrics_error(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn metrics_error(msg: String) -> ZchainError {
    ZchainError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

pub fn record_backup(size_bytes: u64) {
    #[cfg(feature = "metrics")]
    {
        let metrics = ZchainMetrics::global();
        metrics.backups_total.inc();
        metrics.artifact_size_bytes.observe(size_bytes as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = size_bytes;
}

pub fn record_backup_failure() {
    #[cfg(feature = "metrics")]
    ZchainMetrics::global().backup_failures_total.inc();
}

pub fn record_restored_artifact() {
    #[cfg(feature = "metrics")]
    ZchainMetrics::global().restores_total.inc();
}

pub fn record_verification_failure() {
    #[cfg(feature = "metrics")]
    ZchainMetrics::global().verification_failures_total.inc();
}

pub fn record_pruned_chains(count: usize) {
    #[cfg(feature = "metrics")]
    ZchainMetrics::global()
        .pruned_chains_total
        .inc_by(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub fn record_pipeline_duration(duration: Duration) {
    #[cfg(feature = "metrics")]
    ZchainMetrics::global()
        .pipeline_duration_seconds
        .observe(duration.as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = duration;
}

/// Write the Prometheus text exposition to `path` (node-exporter textfile format)
#[cfg(feature = "metrics")]
pub fn write_metrics_file(path: &std::path::Path) -> Result<()> {
    use std::io::Write;

    let text = ZchainMetrics::global().gather_metrics()?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".metrics")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.persist(path).map_err(|e| ZchainError::Io(e.error))?;
    Ok(())
}

/// File name of the appended log inside the log directory
pub fn log_file_name() -> String {
    format!("{SCRIPT_ID}.log")
}

/// Initialize the global tracing subscriber
///
/// Sets up:
/// - A stderr layer at `info` (`debug` when verbose)
/// - An appended plain-text log file at `debug` when the log directory is
///   writable; an unusable directory only disables the file layer
///
/// `RUST_LOG` overrides both levels.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let stderr_level = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(stderr_level));

    let mut file_error = None;
    let file_layer = config.log_dir.as_ref().and_then(|dir| {
        match std::fs::create_dir_all(dir).map_err(|e| e.to_string()).and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(log_file_name())
                .build(dir)
                .map_err(|e| e.to_string())
        }) {
            Ok(appender) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(env_filter(LevelFilter::DEBUG)),
            ),
            Err(e) => {
                file_error = Some(format!("{}: {e}", dir.display()));
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            ZchainError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to set global tracing subscriber: {e}"),
            ))
        })?;

    if let Some(reason) = file_error {
        tracing::debug!(reason = %reason, "File logging disabled");
    }
    Ok(())
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}
