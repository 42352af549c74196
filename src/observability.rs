use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations created locally (not imported).
pub const RESERVATIONS_CREATED_TOTAL: &str = "salonbook_reservations_created_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "salonbook_reservations_cancelled_total";

/// Counter: bookings refused because the time was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "salonbook_booking_conflicts_total";

/// Counter: reschedule attempts. Labels: outcome (applied, refused).
pub const RESCHEDULES_TOTAL: &str = "salonbook_reschedules_total";

/// Counter: external events processed by the importer.
/// Labels: outcome (inserted, updated, unchanged, skipped, failed).
pub const IMPORT_RECORDS_TOTAL: &str = "salonbook_import_records_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salonbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salonbook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background job.
pub const WAL_COMPACTIONS_TOTAL: &str = "salonbook_wal_compactions_total";

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
