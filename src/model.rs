use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

pub type ServiceId = String;
pub type ProfessionalId = String;
pub type ReservationId = String;

/// Half-open interval `[start, end)` of local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `[start, start + duration)`, or `None` past the end of the calendar.
    pub fn starting_at(start: NaiveDateTime, duration: TimeDelta) -> Option<Self> {
        let end = start.checked_add_signed(duration)?;
        (start < end).then_some(Self { start, end })
    }

    /// The whole calendar day `[00:00, next day 00:00)`. `None` for the last
    /// representable day.
    pub fn day(day: NaiveDate) -> Option<Self> {
        Self::starting_at(day.and_time(NaiveTime::MIN), TimeDelta::days(1))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Who should perform a booking.
///
/// `AnyAuthorized` widens availability to the union over every professional
/// authorized for the service; it never means "all of them are free".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfessionalChoice {
    Specific(ProfessionalId),
    AnyAuthorized,
}

impl From<Option<ProfessionalId>> for ProfessionalChoice {
    fn from(value: Option<ProfessionalId>) -> Self {
        match value {
            Some(id) => ProfessionalChoice::Specific(id),
            None => ProfessionalChoice::AnyAuthorized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub service_id: ServiceId,
    pub professional_id: ProfessionalId,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub external_event_id: Option<String>,
    pub external_calendar_id: Option<String>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// True when every field an import may overwrite already matches `other`.
    pub fn same_mutable_fields(&self, other: &Reservation) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.professional_id == other.professional_id
            && self.service_id == other.service_id
            && self.external_event_id == other.external_event_id
            && self.external_calendar_id == other.external_calendar_id
    }
}

/// Where a reservation currently lives, plus its insertion sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub professional_id: ProfessionalId,
    pub seq: u64,
}

/// One professional's reservations, sorted by `start`.
#[derive(Debug, Clone)]
pub struct ProfessionalState {
    pub id: ProfessionalId,
    pub reservations: Vec<Reservation>,
}

impl ProfessionalState {
    pub fn new(id: ProfessionalId) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: &str) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end > query.start)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    /// Reschedule or import update; the reservation keeps its id.
    ReservationUpdated {
        reservation: Reservation,
        previous_professional_id: ProfessionalId,
    },
    ReservationCancelled {
        id: ReservationId,
        professional_id: ProfessionalId,
    },
}

impl Event {
    /// Professionals whose state the event touches.
    pub fn professionals(&self) -> Vec<&str> {
        match self {
            Event::ReservationCreated { reservation } => vec![reservation.professional_id.as_str()],
            Event::ReservationUpdated {
                reservation,
                previous_professional_id,
            } => vec![
                previous_professional_id.as_str(),
                reservation.professional_id.as_str(),
            ],
            Event::ReservationCancelled { professional_id, .. } => vec![professional_id.as_str()],
        }
    }
}

// ── Reschedule ───────────────────────────────────────────────────

/// Partial change to an existing reservation. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescheduleRequest {
    pub reservation_id: ReservationId,
    pub new_date: Option<NaiveDate>,
    pub new_time: Option<NaiveTime>,
    pub new_professional_id: Option<ProfessionalId>,
}

impl RescheduleRequest {
    pub fn new(reservation_id: impl Into<ReservationId>) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            ..Self::default()
        }
    }

    pub fn date(mut self, date: NaiveDate) -> Self {
        self.new_date = Some(date);
        self
    }

    pub fn time(mut self, time: NaiveTime) -> Self {
        self.new_time = Some(time);
        self
    }

    pub fn professional(mut self, professional_id: impl Into<ProfessionalId>) -> Self {
        self.new_professional_id = Some(professional_id.into());
        self
    }
}

/// On failure `reservation` is the untouched original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleOutcome {
    pub success: bool,
    pub message: String,
    pub reservation: Reservation,
}

// ── External calendar import ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: String,
    #[serde(default)]
    pub calendar_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default, rename = "private")]
    pub private_metadata: BTreeMap<String, String>,
}

impl ExternalEvent {
    /// Metadata value, treating blank strings as absent.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.private_metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A calendar to scan over an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportScope {
    pub calendar_id: String,
    pub professional_id: Option<ProfessionalId>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Events already fetched for one scope, or the reason fetching failed.
#[derive(Debug, Clone)]
pub struct ScopeEvents {
    pub scope: ImportScope,
    pub events: Result<Vec<ExternalEvent>, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEvent {
    pub event_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeError {
    pub calendar_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistError {
    pub reservation_id: ReservationId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedEvent>,
    pub scope_errors: Vec<ScopeError>,
    pub persist_errors: Vec<PersistError>,
}

impl ImportReport {
    pub fn merge(&mut self, other: ImportReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped.extend(other.skipped);
        self.scope_errors.extend(other.scope_errors);
        self.persist_errors.extend(other.persist_errors);
    }
}
