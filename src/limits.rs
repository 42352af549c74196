use chrono::TimeDelta;

pub const MAX_RESERVATIONS_PER_PROFESSIONAL: usize = 100_000;
pub const MAX_EVENTS_PER_SCOPE: usize = 10_000;
pub const MAX_SCOPE_DAYS: i64 = 366;
pub const MAX_SUMMARY_LEN: usize = 1024;
/// Attempts to pin a reservation whose professional changes under us.
pub const MAX_LOCK_RETRIES: usize = 8;

pub fn max_reservation_duration() -> TimeDelta {
    TimeDelta::hours(24)
}
