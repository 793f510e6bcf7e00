//! Group sessions and their registrations.
//!
//! A session's interval lives on its provider's calendar, so creating or
//! cancelling one takes the provider lock (then the session lock). Seat
//! accounting only takes the session lock: the capacity check and the
//! counter update are one unit per session and never touch the provider.

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_interval_room, check_no_conflict, now_ms, validate_span};
use super::lifecycle::{next_registration_status, RegistrationAction};
use super::{Engine, EngineError, SharedSessionState};

impl Engine {
    pub async fn create_group_session(
        &self,
        id: Ulid,
        provider_id: Ulid,
        group_class_id: Ulid,
        span: Span,
        max_participants: u32,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if max_participants == 0 || max_participants > MAX_PARTICIPANTS {
            return Err(EngineError::Validation(format!(
                "max_participants must be 1-{MAX_PARTICIPANTS}, got {max_participants}"
            )));
        }
        let _gate = self.commit_gate.read().await;
        let mut ps = self.provider_write(provider_id).await?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_interval_room(&ps)?;
        check_no_conflict(&ps, &span, None)?;

        let event = Event::GroupSessionCreated {
            id,
            provider_id,
            group_class_id,
            span,
            max_participants,
            at: now_ms(),
        };
        self.persist_and_apply(&mut ps, &event).await
    }

    /// Frees the session's interval and cancels every active registration
    /// in the same WAL record.
    pub async fn cancel_group_session(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut ps = self.resolve_entity_write("group session", id).await?;
        let shared = self.session(id)?;
        let mut ss = shared.lock().await;
        if ss.session.status == SessionStatus::Cancelled {
            return Err(EngineError::StateTransition {
                entity: "group session",
                id,
                from: ss.session.status.as_str(),
                action: "cancel",
            });
        }

        let released = ss.session.current_participants;
        let event = Event::GroupSessionCancelled {
            id,
            provider_id: ps.id,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.store.apply_to_provider(&mut ps, &event);
        self.store.apply_to_session(&mut ss, &event);
        self.notify.send(ps.id, &event);
        info!("group session {id} cancelled, {released} registrations released");
        Ok(())
    }

    /// Take a seat. The check `current < max` and the increment are one unit
    /// under the session lock.
    pub async fn register(
        &self,
        id: Ulid,
        session_id: Ulid,
        client_id: Ulid,
    ) -> Result<Registration, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.session(session_id)?;
        let mut ss = shared.lock().await;
        if ss.session.status == SessionStatus::Cancelled {
            return Err(EngineError::StateTransition {
                entity: "group session",
                id: session_id,
                from: ss.session.status.as_str(),
                action: "register for",
            });
        }
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = ss
            .registrations
            .iter()
            .find(|r| r.client_id == client_id && r.status.is_active())
        {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        if ss.session.current_participants >= ss.session.max_participants {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
            debug!(
                "session {session_id} full ({}/{}), client {client_id} rejected",
                ss.session.current_participants, ss.session.max_participants
            );
            return Err(EngineError::CapacityExceeded {
                session_id,
                max: ss.session.max_participants,
            });
        }

        let event = Event::RegistrationCreated {
            id,
            session_id,
            client_id,
            at: now_ms(),
        };
        self.persist_and_apply_session(&mut ss, &event).await?;
        registration(&ss, id)
    }

    pub async fn transition_registration(
        &self,
        id: Ulid,
        action: RegistrationAction,
    ) -> Result<Registration, EngineError> {
        let _gate = self.commit_gate.read().await;
        let session_id = self
            .store
            .session_for_registration(&id)
            .ok_or_else(|| EngineError::not_found("registration", id))?;
        let shared = self.session(session_id)?;
        let mut ss = shared.lock().await;
        let current = registration(&ss, id)?.status;
        let status = next_registration_status(id, current, action)?;
        if status == current {
            return registration(&ss, id);
        }

        let event = Event::RegistrationStatusChanged {
            id,
            session_id,
            status,
            at: now_ms(),
        };
        self.persist_and_apply_session(&mut ss, &event).await?;
        registration(&ss, id)
    }

    pub async fn update_registration_status(
        &self,
        id: Ulid,
        status: RegistrationStatus,
    ) -> Result<Registration, EngineError> {
        self.transition_registration(id, RegistrationAction::toward(status)?)
            .await
    }

    /// Idempotent: cancelling a cancelled registration returns it unchanged.
    pub async fn cancel_registration(&self, id: Ulid) -> Result<Registration, EngineError> {
        self.transition_registration(id, RegistrationAction::Cancel).await
    }

    fn session(&self, id: Ulid) -> Result<SharedSessionState, EngineError> {
        self.store
            .get_session(&id)
            .ok_or_else(|| EngineError::not_found("group session", id))
    }
}

fn registration(ss: &SessionState, id: Ulid) -> Result<Registration, EngineError> {
    ss.registrations
        .iter()
        .find(|r| r.id == id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("registration", id))
}
