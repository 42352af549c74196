use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::calendar::CalendarSource;
use crate::inference::ServiceRules;
use crate::limits::{MAX_LOCK_RETRIES, MAX_SCOPE_DAYS, MAX_SUMMARY_LEN, max_reservation_duration};
use crate::model::*;
use crate::observability::IMPORT_RECORDS_TOTAL;

use super::conflict::check_capacity;
use super::{Engine, EngineError, EntityKind};

/// Caller-supplied knobs for turning external events into reservations.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Used when neither metadata nor keywords name a service.
    pub default_service: ServiceId,
    /// Used when neither metadata nor the scope name a professional.
    pub fallback_professional: Option<ProfessionalId>,
    pub rules: ServiceRules,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            default_service: "corte".into(),
            fallback_professional: None,
            rules: ServiceRules::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

impl Upsert {
    fn label(self) -> &'static str {
        match self {
            Upsert::Inserted => "inserted",
            Upsert::Updated => "updated",
            Upsert::Unchanged => "unchanged",
        }
    }
}

impl Engine {
    /// Fetch every scope from `source` concurrently and import the results.
    /// A scope with a bad date range or a failed fetch is reported in
    /// `scope_errors` and the others still run.
    pub async fn reconcile(
        &self,
        source: &dyn CalendarSource,
        scopes: &[ImportScope],
        options: &ImportOptions,
    ) -> ImportReport {
        let fetches = scopes.iter().map(|scope| async move {
            let events = match check_scope_range(scope) {
                Ok(()) => source
                    .list_events(&scope.calendar_id, scope.start_date, scope.end_date)
                    .await
                    .map_err(|e| e.to_string()),
                Err(message) => Err(message),
            };
            ScopeEvents {
                scope: scope.clone(),
                events,
            }
        });
        let batches = join_all(fetches).await;
        self.import(batches, options).await
    }

    /// Upsert already-fetched external events. Idempotent: importing the same
    /// events twice changes nothing the second time.
    pub async fn import(&self, batches: Vec<ScopeEvents>, options: &ImportOptions) -> ImportReport {
        let per_scope = join_all(batches.iter().map(|batch| self.import_batch(batch, options))).await;

        let mut report = ImportReport::default();
        for scope_report in per_scope {
            report.merge(scope_report);
        }
        info!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped.len(),
            scope_errors = report.scope_errors.len(),
            persist_errors = report.persist_errors.len(),
            "import finished"
        );
        report
    }

    async fn import_batch(&self, batch: &ScopeEvents, options: &ImportOptions) -> ImportReport {
        let mut report = ImportReport::default();
        let events = match &batch.events {
            Ok(events) => events,
            Err(message) => {
                warn!(calendar = %batch.scope.calendar_id, "scope fetch failed: {message}");
                report.scope_errors.push(ScopeError {
                    calendar_id: batch.scope.calendar_id.clone(),
                    message: message.clone(),
                });
                return report;
            }
        };

        for event in events {
            let reservation = match self.resolve_event(&batch.scope, event, options) {
                Ok(r) => r,
                Err(reason) => {
                    debug!(event = %event.id, "skipping external event: {reason}");
                    metrics::counter!(IMPORT_RECORDS_TOTAL, "outcome" => "skipped").increment(1);
                    report.skipped.push(SkippedEvent {
                        event_id: event.id.clone(),
                        reason,
                    });
                    continue;
                }
            };
            let id = reservation.id.clone();
            match self.upsert(reservation).await {
                Ok(outcome) => {
                    metrics::counter!(IMPORT_RECORDS_TOTAL, "outcome" => outcome.label()).increment(1);
                    match outcome {
                        Upsert::Inserted => report.inserted += 1,
                        Upsert::Updated => report.updated += 1,
                        Upsert::Unchanged => report.unchanged += 1,
                    }
                }
                Err(e) => {
                    warn!(id = %id, "import could not store reservation: {e}");
                    metrics::counter!(IMPORT_RECORDS_TOTAL, "outcome" => "failed").increment(1);
                    report.persist_errors.push(PersistError {
                        reservation_id: id,
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(
            calendar = %batch.scope.calendar_id,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped.len(),
            "scope imported"
        );
        report
    }

    /// Turn an external event into the reservation it stands for, or say why
    /// it cannot be imported.
    fn resolve_event(
        &self,
        scope: &ImportScope,
        event: &ExternalEvent,
        options: &ImportOptions,
    ) -> Result<Reservation, String> {
        if event.end <= event.start {
            return Err("event does not end after it starts".into());
        }
        if event.end - event.start > max_reservation_duration() {
            return Err("event is too long".into());
        }

        let professional_id = event
            .metadata("professional_id")
            .or(scope.professional_id.as_deref())
            .or(options.fallback_professional.as_deref())
            .ok_or_else(|| "no professional for event".to_string())?;
        if self.catalog().professional(professional_id).is_none() {
            return Err(format!("unknown professional {professional_id}"));
        }

        let summary = event.summary.as_deref().filter(|s| s.len() <= MAX_SUMMARY_LEN);
        let service_id = event
            .metadata("service_id")
            .filter(|s| self.catalog().service(s).is_some())
            .unwrap_or_else(|| options.rules.infer_or(summary, &options.default_service));
        if self.catalog().service(service_id).is_none() {
            return Err(format!("unknown service {service_id}"));
        }

        let id = match event.metadata("reservation_id") {
            Some(id) => id.to_string(),
            None => format!("ext:{}", event.id),
        };
        let calendar_id = if event.calendar_id.is_empty() {
            &scope.calendar_id
        } else {
            &event.calendar_id
        };

        Ok(Reservation {
            id,
            service_id: service_id.to_string(),
            professional_id: professional_id.to_string(),
            start: event.start,
            end: event.end,
            external_event_id: Some(event.id.clone()),
            external_calendar_id: Some(calendar_id.clone()),
        })
    }

    /// Insert or overwrite by id. External events are authoritative, so no
    /// overlap check runs here.
    async fn upsert(&self, incoming: Reservation) -> Result<Upsert, EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            if self.placement_of(&incoming.id).is_none() {
                let mut set = self.lock_professionals(&[incoming.professional_id.as_str()]).await?;
                if !self.claim_placement(&incoming.id, &incoming.professional_id) {
                    // Inserted concurrently; go round again as an update.
                    continue;
                }
                let ps = set.get(&incoming.professional_id).ok_or_else(|| {
                    EngineError::not_found(EntityKind::Professional, &incoming.professional_id)
                });
                if let Err(e) = ps.and_then(check_capacity) {
                    self.release_claim(&incoming.id);
                    return Err(e);
                }
                let event = Event::ReservationCreated {
                    reservation: incoming.clone(),
                };
                if let Err(e) = self.persist_and_apply(&mut set, &event).await {
                    self.release_claim(&incoming.id);
                    return Err(e);
                }
                return Ok(Upsert::Inserted);
            }

            let Some((owner, mut set)) = self
                .resolve_reservation_write(&incoming.id, Some(incoming.professional_id.as_str()))
                .await?
            else {
                continue;
            };
            let unchanged = set
                .get(&owner)
                .and_then(|ps| ps.get(&incoming.id))
                .is_some_and(|current| current.same_mutable_fields(&incoming));
            if unchanged {
                return Ok(Upsert::Unchanged);
            }
            let event = Event::ReservationUpdated {
                reservation: incoming.clone(),
                previous_professional_id: owner,
            };
            self.persist_and_apply(&mut set, &event).await?;
            return Ok(Upsert::Updated);
        }
        Err(EngineError::Validation(format!(
            "reservation {} changed concurrently too many times",
            incoming.id
        )))
    }
}

fn check_scope_range(scope: &ImportScope) -> Result<(), String> {
    if scope.end_date < scope.start_date {
        return Err(format!(
            "end date {} is before start date {}",
            scope.end_date, scope.start_date
        ));
    }
    if (scope.end_date - scope.start_date).num_days() >= MAX_SCOPE_DAYS {
        return Err(format!("range longer than {MAX_SCOPE_DAYS} days"));
    }
    Ok(())
}
