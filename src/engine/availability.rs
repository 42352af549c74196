use chrono::{NaiveDateTime, TimeDelta};

use crate::model::*;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Bookable start times for one professional.
///
/// Each open window is cut into a grid anchored at the window start and
/// stepped by the service duration. A candidate survives when
/// `[candidate, candidate + duration)` lies inside its window and misses
/// every busy span.
pub fn slot_starts(windows: &[Span], busy: &[Span], duration: TimeDelta) -> Vec<NaiveDateTime> {
    if duration <= TimeDelta::zero() {
        return Vec::new();
    }

    let mut busy = busy.to_vec();
    busy.sort_by_key(|s| s.start);
    let free = subtract_intervals(windows, &merge_overlapping(&busy));

    let mut slots = Vec::new();
    for window in windows {
        let mut candidate = window.start;
        while let Some(end) = candidate.checked_add_signed(duration)
            && end <= window.end
        {
            let span = Span::new(candidate, end);
            // `free` is sorted and disjoint: only the first span ending after
            // the candidate start can contain it.
            let idx = free.partition_point(|f| f.end <= candidate);
            if free.get(idx).is_some_and(|f| f.contains_span(&span)) {
                slots.push(candidate);
            }
            candidate = end;
        }
    }
    slots
}

/// Busy spans of a professional within `query`, optionally ignoring one
/// reservation (the one being moved).
pub fn busy_spans(ps: &ProfessionalState, query: &Span, exclude: Option<&str>) -> Vec<Span> {
    ps.overlapping(query)
        .filter(|r| exclude != Some(r.id.as_str()))
        .map(Reservation::span)
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn span(sh: u32, sm: u32, eh: u32, em: u32) -> Span {
        Span::new(at(sh, sm), at(eh, em))
    }

    fn half_hour() -> TimeDelta {
        TimeDelta::minutes(30)
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![span(10, 0, 11, 0), span(12, 0, 13, 0)];
        let remove = vec![span(11, 0, 12, 0)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![span(10, 0, 11, 0)];
        let remove = vec![span(9, 0, 12, 0)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![span(10, 0, 12, 0)];
        let remove = vec![span(10, 30, 11, 0)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![span(10, 0, 10, 30), span(11, 0, 12, 0)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![span(10, 0, 20, 0)];
        let remove = vec![span(11, 0, 12, 0), span(14, 0, 15, 0), span(18, 0, 19, 0)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                span(10, 0, 11, 0),
                span(12, 0, 14, 0),
                span(15, 0, 18, 0),
                span(19, 0, 20, 0),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![span(10, 0, 12, 0), span(11, 0, 13, 0), span(14, 0, 15, 0)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![span(10, 0, 13, 0), span(14, 0, 15, 0)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![span(10, 0, 11, 0), span(11, 0, 12, 0)];
        assert_eq!(merge_overlapping(&spans), vec![span(10, 0, 12, 0)]);
    }

    // ── slot_starts ──────────────────────────────────────

    #[test]
    fn slots_skip_existing_booking() {
        let windows = vec![span(10, 0, 12, 0)];
        let busy = vec![span(10, 0, 10, 30)];
        assert_eq!(
            slot_starts(&windows, &busy, half_hour()),
            vec![at(10, 30), at(11, 0), at(11, 30)]
        );
    }

    #[test]
    fn slots_never_straddle_window_end() {
        let windows = vec![span(10, 0, 11, 0), span(16, 0, 17, 0)];
        let slots = slot_starts(&windows, &[], TimeDelta::minutes(40));
        assert_eq!(slots, vec![at(10, 0), at(16, 0)]);
    }

    #[test]
    fn slots_drop_candidates_partially_overlapping_busy() {
        // A 20-minute external event in the middle knocks out the one grid slot
        // it touches, and the grid does not shift around it.
        let windows = vec![span(10, 0, 12, 0)];
        let busy = vec![span(10, 40, 11, 0)];
        assert_eq!(
            slot_starts(&windows, &busy, half_hour()),
            vec![at(10, 0), at(11, 0), at(11, 30)]
        );
    }

    #[test]
    fn slots_empty_when_closed() {
        assert!(slot_starts(&[], &[], half_hour()).is_empty());
    }

    #[test]
    fn slots_empty_when_fully_booked() {
        let windows = vec![span(10, 0, 11, 0)];
        let busy = vec![span(10, 30, 11, 0), span(10, 0, 10, 30)];
        assert!(slot_starts(&windows, &busy, half_hour()).is_empty());
    }

    #[test]
    fn slots_ignore_busy_outside_windows() {
        let windows = vec![span(10, 0, 11, 0)];
        let busy = vec![span(8, 0, 9, 0), span(15, 0, 16, 0)];
        assert_eq!(slot_starts(&windows, &busy, half_hour()), vec![at(10, 0), at(10, 30)]);
    }

    #[test]
    fn busy_spans_excludes_moving_reservation() {
        let mut ps = ProfessionalState::new("ana".into());
        for (id, h) in [("a", 10), ("b", 11)] {
            ps.insert_reservation(Reservation {
                id: id.into(),
                service_id: "corte".into(),
                professional_id: "ana".into(),
                start: at(h, 0),
                end: at(h, 30),
                external_event_id: None,
                external_calendar_id: None,
            });
        }
        let day = Span::new(at(0, 0), at(23, 0));
        assert_eq!(busy_spans(&ps, &day, None).len(), 2);
        assert_eq!(busy_spans(&ps, &day, Some("a")), vec![span(11, 0, 11, 30)]);
    }
}
