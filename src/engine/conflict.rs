use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub(crate) fn day_span(day: NaiveDate) -> Result<Span, EngineError> {
    Span::day(day).ok_or_else(|| EngineError::Validation(format!("{day} is out of range")))
}

/// `[start, start + duration)`, refusing ends past the last representable instant.
pub(crate) fn span_from(start: NaiveDateTime, duration: TimeDelta) -> Result<Span, EngineError> {
    Span::starting_at(start, duration)
        .ok_or_else(|| EngineError::Validation(format!("{start} is out of range")))
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    if span.duration() > max_reservation_duration() {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

pub(crate) fn validate_not_past(
    start: NaiveDateTime,
    now: NaiveDateTime,
    allow_past: bool,
) -> Result<(), EngineError> {
    if !allow_past && start < now {
        return Err(EngineError::Validation(format!("{start} is in the past")));
    }
    Ok(())
}

/// Overlap invariant: no other reservation of this professional may share
/// an instant with `span`. `exclude` names a reservation being moved, which
/// never conflicts with itself.
pub(crate) fn check_no_conflict(
    ps: &ProfessionalState,
    span: &Span,
    exclude: Option<&str>,
) -> Result<(), EngineError> {
    if let Some(other) = ps
        .overlapping(span)
        .find(|r| exclude != Some(r.id.as_str()))
    {
        return Err(EngineError::Conflict(other.id.clone()));
    }
    Ok(())
}

pub(crate) fn check_capacity(ps: &ProfessionalState) -> Result<(), EngineError> {
    if ps.reservations.len() >= MAX_RESERVATIONS_PER_PROFESSIONAL {
        return Err(EngineError::LimitExceeded("too many reservations for professional"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn state_with(id: &str, start: NaiveDateTime, end: NaiveDateTime) -> ProfessionalState {
        let mut ps = ProfessionalState::new("ana".into());
        ps.insert_reservation(Reservation {
            id: id.into(),
            service_id: "corte".into(),
            professional_id: "ana".into(),
            start,
            end,
            external_event_id: None,
            external_calendar_id: None,
        });
        ps
    }

    #[test]
    fn overlapping_reservation_conflicts() {
        let ps = state_with("res_1", at(10, 0), at(10, 30));
        let result = check_no_conflict(&ps, &Span::new(at(10, 15), at(10, 45)), None);
        assert!(matches!(result, Err(EngineError::Conflict(id)) if id == "res_1"));
    }

    #[test]
    fn adjacent_reservation_does_not_conflict() {
        let ps = state_with("res_1", at(10, 0), at(10, 30));
        assert!(check_no_conflict(&ps, &Span::new(at(10, 30), at(11, 0)), None).is_ok());
    }

    #[test]
    fn excluded_reservation_never_conflicts_with_itself() {
        let ps = state_with("res_1", at(10, 0), at(10, 30));
        let shifted = Span::new(at(10, 15), at(10, 45));
        assert!(check_no_conflict(&ps, &shifted, Some("res_1")).is_ok());
    }

    #[test]
    fn past_start_rejected_unless_allowed() {
        let now = at(12, 0);
        assert!(validate_not_past(at(11, 0), now, false).is_err());
        assert!(validate_not_past(at(11, 0), now, true).is_ok());
        assert!(validate_not_past(at(13, 0), now, false).is_ok());
    }

    #[test]
    fn overlong_span_rejected() {
        let start = at(0, 0);
        let span = Span::new(start, start + TimeDelta::days(2));
        assert!(matches!(validate_span(&span), Err(EngineError::LimitExceeded(_))));
    }
}
