use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use serde::Deserialize;
use thiserror::Error;

use crate::limits::MAX_EVENTS_PER_SCOPE;
use crate::model::ExternalEvent;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown calendar: {0}")]
    UnknownCalendar(String),

    #[error("calendar {calendar_id} returned more than {limit} events")]
    TooManyEvents { calendar_id: String, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed events file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read-only access to an external calendar.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events of `calendar_id` starting between the two dates, both inclusive.
    async fn list_events(
        &self,
        calendar_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<ExternalEvent>, SourceError>;
}

#[derive(Deserialize)]
struct EventsFile {
    calendars: BTreeMap<String, Vec<ExternalEvent>>,
}

/// Calendar exported to a JSON file:
/// `{"calendars": {"<calendar id>": [ {event}, ... ]}}`.
#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    calendars: BTreeMap<String, Vec<ExternalEvent>>,
}

impl JsonFileSource {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SourceError> {
        let file: EventsFile = serde_json::from_str(raw)?;
        let calendars = file
            .calendars
            .into_iter()
            .map(|(calendar_id, mut events)| {
                for event in &mut events {
                    if event.calendar_id.is_empty() {
                        event.calendar_id = calendar_id.clone();
                    }
                }
                (calendar_id, events)
            })
            .collect();
        Ok(Self { calendars })
    }

    pub fn calendar_ids(&self) -> impl Iterator<Item = &str> {
        self.calendars.keys().map(String::as_str)
    }
}

#[async_trait]
impl CalendarSource for JsonFileSource {
    async fn list_events(
        &self,
        calendar_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<ExternalEvent>, SourceError> {
        let events = self
            .calendars
            .get(calendar_id)
            .ok_or_else(|| SourceError::UnknownCalendar(calendar_id.to_string()))?;
        let from = start_date.and_time(NaiveTime::MIN);
        let until = end_date.and_time(NaiveTime::MIN) + TimeDelta::days(1);
        let selected: Vec<ExternalEvent> = events
            .iter()
            .filter(|e| from <= e.start && e.start < until)
            .cloned()
            .collect();
        if selected.len() > MAX_EVENTS_PER_SCOPE {
            return Err(SourceError::TooManyEvents {
                calendar_id: calendar_id.to_string(),
                limit: MAX_EVENTS_PER_SCOPE,
            });
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: &str = r#"{
        "calendars": {
            "cal-ana": [
                {"id": "e1", "summary": "Corte Juan", "start": "2030-01-07T10:00:00", "end": "2030-01-07T10:30:00"},
                {"id": "e2", "summary": "Tinte", "start": "2030-01-08T16:00:00", "end": "2030-01-08T17:30:00",
                 "private": {"reservation_id": "res_7", "professional_id": "ana"}},
                {"id": "e3", "start": "2030-01-10T10:00:00", "end": "2030-01-10T10:30:00"}
            ]
        }
    }"#;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, d).unwrap()
    }

    #[test]
    fn range_is_inclusive_of_both_days() {
        let source = JsonFileSource::from_json(EVENTS).unwrap();
        let events = tokio_test::block_on(source.list_events("cal-ana", day(7), day(8))).unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn events_inherit_calendar_id_and_metadata() {
        let source = JsonFileSource::from_json(EVENTS).unwrap();
        let events = tokio_test::block_on(source.list_events("cal-ana", day(8), day(8))).unwrap();
        assert_eq!(events[0].calendar_id, "cal-ana");
        assert_eq!(events[0].metadata("reservation_id"), Some("res_7"));
        assert_eq!(events[0].metadata("service_id"), None);
    }

    #[test]
    fn unknown_calendar_is_an_error() {
        let source = JsonFileSource::from_json(EVENTS).unwrap();
        let result = tokio_test::block_on(source.list_events("cal-luis", day(7), day(7)));
        assert!(matches!(result, Err(SourceError::UnknownCalendar(_))));
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(matches!(
            JsonFileSource::from_json("{\"calendars\": 3}"),
            Err(SourceError::Json(_))
        ));
    }
}
