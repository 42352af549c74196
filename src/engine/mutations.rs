use chrono::NaiveDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;
use crate::observability::{
    BOOKING_CONFLICTS_TOTAL, RESCHEDULES_TOTAL, RESERVATIONS_CANCELLED_TOTAL,
    RESERVATIONS_CREATED_TOTAL,
};

use super::conflict::{
    check_capacity, check_no_conflict, now_local, span_from, validate_not_past, validate_span,
};
use super::{Engine, EngineError, EntityKind, WalCommand};

impl Engine {
    /// Book `service_id` with `professional_id` at `start`. The end is derived
    /// from the service duration. Fails unless the span fits one open window
    /// and overlaps nothing the professional already holds.
    pub async fn create(
        &self,
        service_id: &str,
        professional_id: &str,
        start: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let (service, _) = self.catalog().authorize(service_id, professional_id)?;
        validate_not_past(start, now_local(), self.options().allow_past_bookings)?;
        let span = span_from(start, service.duration())?;
        validate_span(&span)?;

        let mut set = self.lock_professionals(&[professional_id]).await?;
        let ps = set
            .get(professional_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Professional, professional_id))?;
        check_capacity(ps)?;
        if let Err(e) = self.check_admission(ps, service_id, &span, None) {
            if e.is_conflict() {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            }
            warn!(professional = professional_id, %start, "booking rejected: {e}");
            return Err(e);
        }

        let reservation = Reservation {
            id: format!("res_{}", Ulid::new()),
            service_id: service.id.clone(),
            professional_id: professional_id.to_string(),
            start: span.start,
            end: span.end,
            external_event_id: None,
            external_calendar_id: None,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut set, &event).await?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            id = %reservation.id,
            professional = professional_id,
            service = service_id,
            %start,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Book with an explicit professional, or let the engine pick the first
    /// free one in catalog order.
    pub async fn book(
        &self,
        service_id: &str,
        choice: &ProfessionalChoice,
        start: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let ProfessionalChoice::Specific(professional_id) = choice else {
            // A concurrent booking can take the assigned slot between the read
            // and the commit; pick again when that happens.
            for _ in 0..MAX_LOCK_RETRIES {
                let Some(professional_id) = self.assign_professional(service_id, start).await?
                else {
                    break;
                };
                match self.create(service_id, &professional_id, start).await {
                    Err(e) if e.is_conflict() => continue,
                    other => return other,
                }
            }
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::NoProfessionalFree {
                service_id: service_id.to_string(),
                start,
            });
        };
        self.create(service_id, professional_id, start).await
    }

    /// Returns false when no reservation has this id.
    pub async fn cancel(&self, reservation_id: &str) -> Result<bool, EngineError> {
        let Some((professional_id, mut set)) =
            self.resolve_reservation_write(reservation_id, None).await?
        else {
            debug!(id = reservation_id, "cancel: unknown reservation");
            return Ok(false);
        };
        let event = Event::ReservationCancelled {
            id: reservation_id.to_string(),
            professional_id: professional_id.clone(),
        };
        self.persist_and_apply(&mut set, &event).await?;

        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(id = reservation_id, professional = %professional_id, "reservation cancelled");
        Ok(true)
    }

    /// Move a reservation in time and/or to another professional.
    ///
    /// Validation failures come back as `success == false` together with the
    /// untouched reservation. `Err` means the id is unknown or the change
    /// could not be persisted.
    pub async fn reschedule(
        &self,
        request: &RescheduleRequest,
    ) -> Result<RescheduleOutcome, EngineError> {
        let id = request.reservation_id.as_str();
        if let Some(professional_id) = request.new_professional_id.as_deref()
            && self.catalog().professional(professional_id).is_none()
        {
            let original = self
                .get(id)
                .await
                .ok_or_else(|| EngineError::not_found(EntityKind::Reservation, id))?;
            let e = EngineError::not_found(EntityKind::Professional, professional_id);
            return Ok(refuse(original, e.to_string()));
        }

        let Some((owner, mut set)) = self
            .resolve_reservation_write(id, request.new_professional_id.as_deref())
            .await?
        else {
            return Err(EngineError::not_found(EntityKind::Reservation, id));
        };
        // Read under the lock: a concurrent import may have changed service or owner.
        let current = set
            .get(&owner)
            .and_then(|ps| ps.get(id))
            .cloned()
            .ok_or_else(|| EngineError::not_found(EntityKind::Reservation, id))?;
        let target = request
            .new_professional_id
            .clone()
            .unwrap_or_else(|| owner.clone());
        let service = match self.catalog().authorize(&current.service_id, &target) {
            Ok((service, _)) => service,
            Err(e) => return Ok(refuse(current, e.to_string())),
        };

        let date = request.new_date.unwrap_or(current.start.date());
        let time = request.new_time.unwrap_or(current.start.time());
        let start = date.and_time(time);
        if let Err(e) = validate_not_past(start, now_local(), self.options().allow_past_bookings) {
            return Ok(refuse(current, e.to_string()));
        }
        let span = match span_from(start, service.duration()) {
            Ok(span) => span,
            Err(e) => return Ok(refuse(current, e.to_string())),
        };

        let target_ps = set
            .get(&target)
            .ok_or_else(|| EngineError::not_found(EntityKind::Professional, &target))?;
        if let Err(e) = self.check_admission(target_ps, &service.id, &span, Some(id)) {
            let reason = match e {
                EngineError::Conflict(other) => {
                    format!("{target} is busy at {start} (reservation {other})")
                }
                other => other.to_string(),
            };
            return Ok(refuse(current, reason));
        }
        if target != owner {
            check_capacity(target_ps)?;
        }

        let updated = Reservation {
            professional_id: target.clone(),
            start: span.start,
            end: span.end,
            ..current
        };
        let event = Event::ReservationUpdated {
            reservation: updated.clone(),
            previous_professional_id: owner,
        };
        self.persist_and_apply(&mut set, &event).await?;

        metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "applied").increment(1);
        info!(id, professional = %target, %start, "reservation rescheduled");
        Ok(RescheduleOutcome {
            success: true,
            message: format!("reservation {id} moved to {start} with {target}"),
            reservation: updated,
        })
    }

    /// The rule every new or moved reservation passes: the span fits one open
    /// window and overlaps nothing else the professional holds.
    fn check_admission(
        &self,
        ps: &ProfessionalState,
        service_id: &str,
        span: &Span,
        exclude: Option<&str>,
    ) -> Result<(), EngineError> {
        if !self.hours().fits(span) {
            return Err(EngineError::Validation(format!(
                "{} is outside business hours for {service_id}",
                span.start
            )));
        }
        check_no_conflict(ps, span, exclude)
    }

    /// Compact the WAL by rewriting it with one `ReservationCreated` per live
    /// reservation, in insertion order. No-op for in-memory stores.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };

        // Read locks held until the swap: every append already queued has
        // been applied, and no new one can slip in behind the snapshot.
        let guards = self.read_all().await;
        let events: Vec<Event> = self
            .live_in_order(&guards)
            .into_iter()
            .map(|reservation| Event::ReservationCreated { reservation })
            .collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        drop(guards);

        info!(reservations = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn refuse(reservation: Reservation, message: String) -> RescheduleOutcome {
    metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "refused").increment(1);
    info!(id = %reservation.id, "reschedule refused: {message}");
    RescheduleOutcome {
        success: false,
        message,
        reservation,
    }
}
