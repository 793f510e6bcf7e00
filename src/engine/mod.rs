mod availability;
mod capacity;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod recurrence;
mod store;

pub use availability::{
    format_clock, free_slots, merge_overlapping, parse_clock, subtract_intervals, within_working_hours,
    working_spans,
};
pub use error::EngineError;
pub use lifecycle::{
    next_appointment_status, next_registration_status, AppointmentAction, RegistrationAction,
};
pub use mutations::{BookingRequest, RejectedInstance, SeriesMode, SeriesOutcome};
pub use recurrence::{Frequency, Occurrences, RecurrenceRule, Termination, WeekdaySet};
pub use store::{InMemoryStore, SharedProviderState, SharedSessionState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::{WAL_APPEND_RETRIES, WAL_RETRY_BACKOFF_MS};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

use store::event_provider_id;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch; roll back on failure.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let events: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(events as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed, rolling back batch of {events} events: {e}");
        if let Err(e) = wal.rollback() {
            warn!("WAL rollback failed: {e}");
        }
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (events, _) in batch {
        for event in events {
            wal.append_buffered(event)?;
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's scheduling state: every provider calendar and group session,
/// backed by a write-ahead log.
///
/// Every mutation takes the commit gate shared, then the provider lock (and,
/// for group sessions, the session lock after it). The conflict or capacity
/// check and the WAL append happen under those locks, so "check + commit" is
/// one unit per provider and per session.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Shared by mutations, exclusive while compaction snapshots state.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes provider creation and deletion.
    pub(super) registry_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        debug!(
            "replayed {} events into {} providers",
            events.len(),
            engine.store.provider_count()
        );
        Ok(engine)
    }

    /// Nothing else holds these locks during replay, so `try_*` always succeeds.
    /// Replay may run inside an async context (lazy tenant creation), which
    /// rules out the blocking lock variants.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ProviderCreated {
                id,
                name,
                settings,
                at,
            } => {
                self.store
                    .insert_provider(ProviderState::new(*id, name.clone(), *settings, *at));
            }
            Event::ProviderDeleted { id } => {
                if let Some(shared) = self.store.get_provider(id) {
                    match shared.try_read() {
                        Ok(ps) => self.store.remove_provider(&ps),
                        Err(_) => warn!("replay: provider {id} busy, delete skipped"),
                    }
                }
            }
            Event::RegistrationCreated { session_id, .. }
            | Event::RegistrationStatusChanged { session_id, .. } => {
                self.replay_on_session(session_id, event);
            }
            Event::GroupSessionCancelled { id, provider_id, .. } => {
                self.replay_on_provider(provider_id, event);
                self.replay_on_session(id, event);
            }
            other => {
                if let Some(provider_id) = event_provider_id(other) {
                    self.replay_on_provider(&provider_id, other);
                }
            }
        }
    }

    fn replay_on_provider(&self, provider_id: &Ulid, event: &Event) {
        let Some(shared) = self.store.get_provider(provider_id) else {
            return;
        };
        match shared.try_write() {
            Ok(mut ps) => self.store.apply_to_provider(&mut ps, event),
            Err(_) => warn!("replay: provider {provider_id} busy, event skipped"),
        };
    }

    fn replay_on_session(&self, session_id: &Ulid, event: &Event) {
        let Some(shared) = self.store.get_session(session_id) else {
            return;
        };
        match shared.try_lock() {
            Ok(mut ss) => self.store.apply_to_session(&mut ss, event),
            Err(_) => warn!("replay: session {session_id} busy, event skipped"),
        };
    }

    /// Durably append events as one unit via the group-commit writer.
    ///
    /// Storage failures are retried a bounded number of times (the writer
    /// rolls a failed batch back first); what survives the retries is
    /// surfaced as `Unavailable`.
    pub(super) async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            match self.wal_send(events.to_vec()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WAL_APPEND_RETRIES => {
                    attempt += 1;
                    metrics::counter!(observability::WAL_APPEND_RETRIES_TOTAL).increment(1);
                    warn!("WAL append failed (attempt {attempt}/{WAL_APPEND_RETRIES}): {e}");
                    tokio::time::sleep(Duration::from_millis(WAL_RETRY_BACKOFF_MS * u64::from(attempt))).await;
                }
                Err(e) => return Err(EngineError::Unavailable(e)),
            }
        }
    }

    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(std::slice::from_ref(event)).await
    }

    async fn wal_send(&self, events: Vec<Event>) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| "WAL writer shut down".to_string())?;
        rx.await
            .map_err(|_| "WAL writer dropped response".to_string())?
            .map_err(|e| e.to_string())
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.store.get_provider(id)
    }

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.store.get_session(id)
    }

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.store.provider_for_entity(entity_id)
    }

    /// WAL-append + apply + notify for a provider-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_provider(ps, event);
        self.notify.send(ps.id, event);
        Ok(())
    }

    /// WAL-append + apply + notify for a session-scoped event.
    pub(super) async fn persist_and_apply_session(
        &self,
        ss: &mut SessionState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_session(ss, event);
        self.notify.send(ss.session.provider_id, event);
        Ok(())
    }

    pub(super) async fn provider_write(
        &self,
        provider_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let shared = self
            .store
            .get_provider(&provider_id)
            .ok_or_else(|| EngineError::not_found("provider", provider_id))?;
        let guard = shared.write_owned().await;
        // Deleted while we waited for the lock.
        if !self.store.contains_provider(&provider_id) {
            return Err(EngineError::not_found("provider", provider_id));
        }
        Ok(guard)
    }

    /// Lookup entity → provider, acquire the provider write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity: &'static str,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .store
            .provider_for_entity(&entity_id)
            .ok_or_else(|| EngineError::not_found(entity, entity_id))?;
        self.provider_write(provider_id).await
    }
}
