use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::model::{ReservationId, ServiceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Service,
    Professional,
    Reservation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => f.write_str("service"),
            EntityKind::Professional => f.write_str("professional"),
            EntityKind::Reservation => f.write_str("reservation"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("professional {professional_id} does not perform service {service_id}")]
    Unauthorized {
        professional_id: String,
        service_id: ServiceId,
    },

    #[error("conflict with reservation: {0}")]
    Conflict(ReservationId),

    #[error("no professional for {service_id} is free at {start}")]
    NoProfessionalFree {
        service_id: ServiceId,
        start: NaiveDateTime,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// Both flavours of "the time is taken".
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_) | EngineError::NoProfessionalFree { .. }
        )
    }
}
