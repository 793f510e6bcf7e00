use thiserror::Error;
use ulid::Ulid;

use crate::model::EntityRef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed input; rejected before any state mutation.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    /// The candidate interval overlaps a committed one.
    #[error("time conflicts with an existing {} ({})", .0.kind, .0.id)]
    Conflict(EntityRef),

    #[error("group session {session_id} is full ({max} participants)")]
    CapacityExceeded { session_id: Ulid, max: u32 },

    /// Illegal lifecycle transition; the prior state is unchanged.
    #[error("cannot {action} {entity} {id} in status {from}")]
    StateTransition {
        entity: &'static str,
        id: Ulid,
        from: &'static str,
        action: &'static str,
    },

    #[error("cannot delete appointment {id}: {reason}")]
    NotDeletable { id: Ulid, reason: &'static str },

    #[error("cannot delete provider {0}: it still owns appointments or group sessions")]
    HasDependents(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// Storage failure that survived the bounded retry at the persistence boundary.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Only storage failures are worth retrying; domain errors never change outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
