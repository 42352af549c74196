use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tracing::{debug, info, warn};

use crate::calendar::CalendarSource;
use crate::engine::{Engine, EngineError, ImportOptions};
use crate::model::ImportReport;
use crate::observability::WAL_COMPACTIONS_TOTAL;

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not needed");
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that re-imports every mapped calendar for the next
/// `days_ahead` days, once per `every`.
pub async fn run_reconciler(
    engine: Arc<Engine>,
    source: Arc<dyn CalendarSource>,
    options: ImportOptions,
    days_ahead: u32,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = chrono::Local::now().date_naive();
        match reconcile_window(&engine, source.as_ref(), &options, today, days_ahead).await {
            Ok(report) => info!(
                inserted = report.inserted,
                updated = report.updated,
                "periodic import done"
            ),
            Err(e) => warn!("periodic import failed: {e}"),
        }
    }
}

/// One import over `[from, from + days_ahead]` for every calendar the
/// catalog maps to a professional.
pub async fn reconcile_window(
    engine: &Engine,
    source: &dyn CalendarSource,
    options: &ImportOptions,
    from: NaiveDate,
    days_ahead: u32,
) -> Result<ImportReport, EngineError> {
    let until = from
        .checked_add_days(Days::new(u64::from(days_ahead)))
        .ok_or_else(|| {
            EngineError::Validation(format!("{from} plus {days_ahead} days is out of range"))
        })?;
    let scopes = engine.catalog().calendar_scopes(from, until);
    if scopes.is_empty() {
        debug!("no calendars mapped, nothing to import");
        return Ok(ImportReport::default());
    }
    Ok(engine.reconcile(source, &scopes, options).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::JsonFileSource;
    use crate::catalog::Catalog;
    use crate::engine::EngineOptions;
    use crate::hours::BusinessHours;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("salonbook_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn past_ok() -> EngineOptions {
        EngineOptions {
            allow_past_bookings: true,
        }
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(Catalog::default(), BusinessHours::default(), past_ok(), path.clone())
            .unwrap();
        let start = monday().and_hms_opt(10, 0, 0).unwrap();
        let r = engine.create("corte", "ana", start).await.unwrap();
        engine.cancel(&r.id).await.unwrap();

        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert!(compact_if_needed(&engine, 2).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(crate::wal::Wal::replay(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn window_covers_mapped_calendars_only() {
        let catalog = Catalog::default().with_calendar("ana", "cal-ana").unwrap();
        let engine = Engine::in_memory(catalog, BusinessHours::default(), past_ok());
        let source = JsonFileSource::from_json(
            r#"{"calendars": {
                "cal-ana": [
                    {"id": "a1", "summary": "Tinte", "start": "2030-01-08T10:00:00", "end": "2030-01-08T11:30:00"},
                    {"id": "a2", "summary": "Corte", "start": "2030-02-20T10:00:00", "end": "2030-02-20T10:30:00"}
                ],
                "cal-luis": [
                    {"id": "l1", "start": "2030-01-08T10:00:00", "end": "2030-01-08T10:30:00"}
                ]
            }}"#,
        )
        .unwrap();

        let report = reconcile_window(&engine, &source, &ImportOptions::default(), monday(), 7)
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        let imported = engine.get("ext:a1").await.unwrap();
        assert_eq!(imported.professional_id, "ana");
        assert_eq!(imported.service_id, "tinte");
    }

    #[tokio::test]
    async fn window_without_calendars_is_empty() {
        let engine = Engine::in_memory(Catalog::default(), BusinessHours::default(), past_ok());
        let source = JsonFileSource::default();
        let report = reconcile_window(&engine, &source, &ImportOptions::default(), monday(), 7)
            .await
            .unwrap();
        assert_eq!(report, ImportReport::default());
    }

    #[tokio::test]
    async fn window_past_the_calendar_end_is_refused() {
        let engine = Engine::in_memory(Catalog::default(), BusinessHours::default(), past_ok());
        let source = JsonFileSource::default();
        let result =
            reconcile_window(&engine, &source, &ImportOptions::default(), NaiveDate::MAX, 7).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
