use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use crate::config::ConfigError;
use crate::engine::merge_overlapping;
use crate::model::Span;

/// Opening windows per weekday. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessHours {
    /// Indexed by `Weekday::num_days_from_monday`, each day sorted and disjoint.
    weekly: [Vec<(NaiveTime, NaiveTime)>; 7],
}

impl BusinessHours {
    /// Every day closed.
    pub fn closed() -> Self {
        Self {
            weekly: Default::default(),
        }
    }

    /// Replace the windows of one weekday. Overlapping or touching windows are merged.
    pub fn with_day(
        mut self,
        weekday: Weekday,
        windows: &[(NaiveTime, NaiveTime)],
    ) -> Result<Self, ConfigError> {
        let mut day: Vec<(NaiveTime, NaiveTime)> = Vec::with_capacity(windows.len());
        for &(open, close) in windows {
            if open >= close {
                return Err(ConfigError::InvalidHours(format!(
                    "{weekday}: window {open}-{close} closes before it opens"
                )));
            }
            day.push((open, close));
        }
        day.sort();
        let mut merged: Vec<(NaiveTime, NaiveTime)> = Vec::with_capacity(day.len());
        for (open, close) in day {
            if let Some(last) = merged.last_mut()
                && open <= last.1 {
                    last.1 = last.1.max(close);
                    continue;
                }
            merged.push((open, close));
        }
        self.weekly[weekday.num_days_from_monday() as usize] = merged;
        Ok(self)
    }

    pub fn windows(&self, weekday: Weekday) -> &[(NaiveTime, NaiveTime)] {
        &self.weekly[weekday.num_days_from_monday() as usize]
    }

    /// Open windows of a concrete day as spans, ascending. Empty when closed.
    pub fn windows_on(&self, day: NaiveDate) -> Vec<Span> {
        let spans: Vec<Span> = self
            .windows(day.weekday())
            .iter()
            .map(|&(open, close)| Span::new(day.and_time(open), day.and_time(close)))
            .collect();
        merge_overlapping(&spans)
    }

    /// True when `span` lies entirely inside one open window of its start day.
    pub fn fits(&self, span: &Span) -> bool {
        self.windows_on(span.start.date())
            .iter()
            .any(|w| w.contains_span(span))
    }
}

impl Default for BusinessHours {
    /// Weekdays 10:00-14:00 and 16:00-20:00, Saturday mornings, Sunday closed.
    fn default() -> Self {
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).expect("valid hour");
        let split = [(t(10), t(14)), (t(16), t(20))];
        let mut hours = Self::closed();
        for weekday in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ] {
            hours.weekly[weekday.num_days_from_monday() as usize] = split.to_vec();
        }
        hours.weekly[Weekday::Sat.num_days_from_monday() as usize] = vec![(t(10), t(14))];
        hours
    }
}
