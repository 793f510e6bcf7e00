//! Appointment and registration lifecycles.
//!
//! ```text
//! PENDING ──confirm / auto-confirm──▶ CONFIRMED ──complete──▶ COMPLETED
//!    │                                   │ └──no-show──▶ NO_SHOW
//!    └──cancel──▶ CANCELLED ◀──cancel────┘
//!
//! REGISTERED ──confirm──▶ CONFIRMED
//!    └────────cancel────────┴──▶ CANCELLED
//! ```
//!
//! Completed, cancelled and no-show appointments are terminal. Cancelling an
//! already-cancelled registration is a no-op.

use ulid::Ulid;

use crate::model::{AppointmentStatus, RegistrationStatus};

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentAction {
    Confirm,
    /// System-driven confirm at creation time, gated by provider policy.
    AutoConfirm,
    Cancel,
    Complete,
    NoShow,
}

impl AppointmentAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::AutoConfirm => "auto-confirm",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::NoShow => "mark as no-show",
        }
    }

    /// The action a caller means when asking for `target` status.
    pub fn toward(target: AppointmentStatus) -> Result<Self, EngineError> {
        match target {
            AppointmentStatus::Confirmed => Ok(Self::Confirm),
            AppointmentStatus::Cancelled => Ok(Self::Cancel),
            AppointmentStatus::Completed => Ok(Self::Complete),
            AppointmentStatus::NoShow => Ok(Self::NoShow),
            AppointmentStatus::Pending => Err(EngineError::Validation(
                "appointments cannot be moved back to pending".into(),
            )),
        }
    }
}

pub fn next_appointment_status(
    id: Ulid,
    from: AppointmentStatus,
    action: AppointmentAction,
) -> Result<AppointmentStatus, EngineError> {
    use AppointmentAction as A;
    use AppointmentStatus as S;
    match (from, action) {
        (S::Pending, A::Confirm | A::AutoConfirm) => Ok(S::Confirmed),
        (S::Pending | S::Confirmed, A::Cancel) => Ok(S::Cancelled),
        (S::Confirmed, A::Complete) => Ok(S::Completed),
        (S::Confirmed, A::NoShow) => Ok(S::NoShow),
        _ => Err(EngineError::StateTransition {
            entity: "appointment",
            id,
            from: from.as_str(),
            action: action.as_str(),
        }),
    }
}

/// Status of a freshly accepted booking.
pub fn initial_appointment_status(id: Ulid, auto_confirm: bool) -> Result<AppointmentStatus, EngineError> {
    if auto_confirm {
        next_appointment_status(id, AppointmentStatus::Pending, AppointmentAction::AutoConfirm)
    } else {
        Ok(AppointmentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationAction {
    Confirm,
    Cancel,
}

impl RegistrationAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
        }
    }

    pub fn toward(target: RegistrationStatus) -> Result<Self, EngineError> {
        match target {
            RegistrationStatus::Confirmed => Ok(Self::Confirm),
            RegistrationStatus::Cancelled => Ok(Self::Cancel),
            RegistrationStatus::Registered => Err(EngineError::Validation(
                "registrations cannot be moved back to registered".into(),
            )),
        }
    }
}

/// Returns the new status; `Cancelled → Cancelled` is allowed and means nothing changes.
pub fn next_registration_status(
    id: Ulid,
    from: RegistrationStatus,
    action: RegistrationAction,
) -> Result<RegistrationStatus, EngineError> {
    use RegistrationAction as A;
    use RegistrationStatus as S;
    match (from, action) {
        (S::Registered, A::Confirm) => Ok(S::Confirmed),
        (_, A::Cancel) => Ok(S::Cancelled),
        _ => Err(EngineError::StateTransition {
            entity: "registration",
            id,
            from: from.as_str(),
            action: action.as_str(),
        }),
    }
}
