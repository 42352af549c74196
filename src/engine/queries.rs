use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime};

use crate::catalog::{Professional, Service};
use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;

use super::availability::{busy_spans, slot_starts};
use super::conflict::day_span;
use super::{Engine, EngineError, EntityKind};

impl Engine {
    /// Grid slots for one professional on `day`. The caller holds a lock on `ps`.
    pub(super) fn professional_slots(
        &self,
        ps: &ProfessionalState,
        service: &Service,
        day: NaiveDate,
    ) -> Vec<NaiveDateTime> {
        let windows = self.hours().windows_on(day);
        let Some(whole_day) = Span::day(day).filter(|_| !windows.is_empty()) else {
            return Vec::new();
        };
        let busy = busy_spans(ps, &whole_day, None);
        slot_starts(&windows, &busy, service.duration())
    }

    fn targets<'a>(
        &'a self,
        service_id: &'a str,
        choice: &ProfessionalChoice,
    ) -> Result<Vec<&'a Professional>, EngineError> {
        match choice {
            ProfessionalChoice::Specific(professional_id) => {
                let (_, professional) = self.catalog().authorize(service_id, professional_id)?;
                Ok(vec![professional])
            }
            ProfessionalChoice::AnyAuthorized => {
                Ok(self.catalog().authorized_for(service_id).collect())
            }
        }
    }

    /// Start times on `day` at which `service_id` can be booked, ascending and
    /// deduplicated. With `AnyAuthorized` this is the union over every
    /// professional offering the service.
    pub async fn available_slots(
        &self,
        service_id: &str,
        day: NaiveDate,
        choice: &ProfessionalChoice,
    ) -> Result<Vec<NaiveDateTime>, EngineError> {
        let service = self.catalog().require_service(service_id)?;
        day_span(day)?;
        let mut slots = BTreeSet::new();
        for professional in self.targets(service_id, choice)? {
            let Some(ps) = self.get_professional(&professional.id) else {
                continue;
            };
            let guard = ps.read().await;
            slots.extend(self.professional_slots(&guard, service, day));
        }
        Ok(slots.into_iter().collect())
    }

    /// First professional, in catalog order, offering the service with a
    /// free slot starting exactly at `start`.
    pub async fn assign_professional(
        &self,
        service_id: &str,
        start: NaiveDateTime,
    ) -> Result<Option<ProfessionalId>, EngineError> {
        let service = self.catalog().require_service(service_id)?;
        for professional in self.catalog().authorized_for(service_id) {
            let Some(ps) = self.get_professional(&professional.id) else {
                continue;
            };
            let guard = ps.read().await;
            if self
                .professional_slots(&guard, service, start.date())
                .contains(&start)
            {
                return Ok(Some(professional.id.clone()));
            }
        }
        Ok(None)
    }

    /// The first `limit` open slots for the service on `day`.
    pub async fn suggest_alternatives(
        &self,
        service_id: &str,
        day: NaiveDate,
        choice: &ProfessionalChoice,
        limit: usize,
    ) -> Result<Vec<NaiveDateTime>, EngineError> {
        let mut slots = self.available_slots(service_id, day, choice).await?;
        slots.truncate(limit);
        Ok(slots)
    }

    pub async fn get(&self, reservation_id: &str) -> Option<Reservation> {
        for _ in 0..MAX_LOCK_RETRIES {
            let owner = self.placement_of(reservation_id)?;
            let ps = self.get_professional(&owner)?;
            let guard = ps.read().await;
            if let Some(r) = guard.get(reservation_id) {
                return Some(r.clone());
            }
            drop(guard);
            // Moved between lookup and lock, or an insert still in flight.
            tokio::task::yield_now().await;
        }
        None
    }

    /// Every reservation, in the order it was first stored. All professionals
    /// are read-locked together, so a reservation moving between two of them
    /// shows up exactly once.
    pub async fn list(&self) -> Vec<Reservation> {
        let guards = self.read_all().await;
        self.live_in_order(&guards)
    }

    /// One professional's reservations starting on `day`, by start time.
    pub async fn reservations_for(
        &self,
        professional_id: &str,
        day: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let ps = self
            .get_professional(professional_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Professional, professional_id))?;
        let span = day_span(day)?;
        let guard = ps.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| span.contains_instant(r.start))
            .cloned()
            .collect())
    }
}
