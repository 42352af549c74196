mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reconcile;

pub use availability::{busy_spans, merge_overlapping, slot_starts, subtract_intervals};
pub use error::{EngineError, EntityKind};
pub use reconcile::ImportOptions;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::hours::BusinessHours;
use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;
use crate::wal::Wal;

pub type SharedProfessionalState = Arc<RwLock<ProfessionalState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
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

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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
        WalCommand::Append { .. } => unreachable!(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Accept bookings and reschedules that start before now.
    pub allow_past_bookings: bool,
}

/// Write guards over a set of professionals, acquired in id order.
pub(super) struct WriteSet {
    guards: Vec<OwnedRwLockWriteGuard<ProfessionalState>>,
}

impl WriteSet {
    pub(super) fn get(&self, professional_id: &str) -> Option<&ProfessionalState> {
        self.guards
            .iter()
            .find(|g| g.id == professional_id)
            .map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, professional_id: &str) -> Option<&mut ProfessionalState> {
        self.guards
            .iter_mut()
            .find(|g| g.id == professional_id)
            .map(|g| &mut **g)
    }
}

/// The reservation store. One lock per professional; every check-and-commit
/// runs under the write lock of each professional it touches.
pub struct Engine {
    catalog: Arc<Catalog>,
    hours: Arc<BusinessHours>,
    options: EngineOptions,
    pub(super) state: DashMap<ProfessionalId, SharedProfessionalState>,
    /// Reverse lookup: reservation id → owning professional + insertion order.
    pub(super) placements: DashMap<ReservationId, Placement>,
    next_seq: AtomicU64,
    pub(super) wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Engine {
    /// A store that lives only in memory.
    pub fn in_memory(catalog: Catalog, hours: BusinessHours, options: EngineOptions) -> Self {
        let state = DashMap::new();
        for p in catalog.professionals() {
            state.insert(
                p.id.clone(),
                Arc::new(RwLock::new(ProfessionalState::new(p.id.clone()))),
            );
        }
        Self {
            catalog: Arc::new(catalog),
            hours: Arc::new(hours),
            options,
            state,
            placements: DashMap::new(),
            next_seq: AtomicU64::new(0),
            wal_tx: None,
        }
    }

    /// A store backed by the WAL at `wal_path`, replaying whatever it holds.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn open(
        catalog: Catalog,
        hours: BusinessHours,
        options: EngineOptions,
        wal_path: PathBuf,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self::in_memory(catalog, hours, options);
        // Replay runs before anyone else holds these Arcs, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }
        engine.wal_tx = Some(wal_tx);
        info!(
            events = events.len(),
            reservations = engine.reservation_count(),
            "replayed WAL {}",
            wal_path.display()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        let mut ids = event.professionals();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(ps) = self.get_professional(id) else {
                warn!(professional = id, "replay: professional not in catalog, skipping event");
                return;
            };
            guards.push(ps.try_write_owned().expect("replay: uncontended write"));
        }
        self.apply_event(&mut WriteSet { guards }, event);
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn hours(&self) -> &BusinessHours {
        &self.hours
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn reservation_count(&self) -> usize {
        self.placements.len()
    }

    pub fn is_persistent(&self) -> bool {
        self.wal_tx.is_some()
    }

    /// Write event to WAL via the background group-commit writer.
    /// No-op for in-memory stores.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub(super) fn get_professional(&self, id: &str) -> Option<SharedProfessionalState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn placement_of(&self, reservation_id: &str) -> Option<ProfessionalId> {
        self.placements
            .get(reservation_id)
            .map(|p| p.professional_id.clone())
    }

    /// Acquire write locks in sorted order to prevent deadlocks.
    pub(super) async fn lock_professionals(&self, ids: &[&str]) -> Result<WriteSet, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let ps = self
                .get_professional(id)
                .ok_or_else(|| EngineError::not_found(EntityKind::Professional, id))?;
            guards.push(ps.write_owned().await);
        }
        Ok(WriteSet { guards })
    }

    /// Read locks on every professional, taken in id order and held together.
    pub(super) async fn read_all(&self) -> Vec<OwnedRwLockReadGuard<ProfessionalState>> {
        let mut ids: Vec<ProfessionalId> = self.state.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(ps) = self.get_professional(id) {
                guards.push(ps.read_owned().await);
            }
        }
        guards
    }

    /// Reservations under `guards`, in insertion order.
    pub(super) fn live_in_order(
        &self,
        guards: &[OwnedRwLockReadGuard<ProfessionalState>],
    ) -> Vec<Reservation> {
        let mut live: Vec<(u64, Reservation)> = Vec::with_capacity(self.reservation_count());
        for guard in guards {
            for r in &guard.reservations {
                if let Some(p) = self.placements.get(&r.id) {
                    live.push((p.seq, r.clone()));
                }
            }
        }
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, r)| r).collect()
    }

    /// Lock the professional currently owning `reservation_id` (plus `extra`).
    /// Re-checks ownership once the locks are held, since a concurrent move
    /// may have relocated the reservation between lookup and lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &str,
        extra: Option<&str>,
    ) -> Result<Option<(ProfessionalId, WriteSet)>, EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let Some(owner) = self.placement_of(reservation_id) else {
                return Ok(None);
            };
            let mut ids = vec![owner.as_str()];
            ids.extend(extra);
            let set = self.lock_professionals(&ids).await?;
            if set
                .get(&owner)
                .is_some_and(|ps| ps.get(reservation_id).is_some())
            {
                return Ok(Some((owner, set)));
            }
            drop(set);
            tokio::task::yield_now().await;
        }
        Ok(None)
    }

    /// Reserve `reservation_id` for an insert on `professional_id`.
    /// Returns false when the id is already taken.
    pub(super) fn claim_placement(&self, reservation_id: &str, professional_id: &str) -> bool {
        match self.placements.entry(reservation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Placement {
                    professional_id: professional_id.to_string(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                true
            }
        }
    }

    pub(super) fn release_claim(&self, reservation_id: &str) {
        self.placements.remove(reservation_id);
    }

    /// WAL-append + apply in one call. The caller holds every lock the event needs.
    pub(super) async fn persist_and_apply(
        &self,
        set: &mut WriteSet,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(set, event);
        Ok(())
    }

    /// Apply an event to locked professional states (no locking here).
    fn apply_event(&self, set: &mut WriteSet, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                if let Some(ps) = set.get_mut(&reservation.professional_id) {
                    ps.insert_reservation(reservation.clone());
                }
                self.placements
                    .entry(reservation.id.clone())
                    .and_modify(|p| p.professional_id = reservation.professional_id.clone())
                    .or_insert_with(|| Placement {
                        professional_id: reservation.professional_id.clone(),
                        seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    });
            }
            Event::ReservationUpdated {
                reservation,
                previous_professional_id,
            } => {
                if let Some(ps) = set.get_mut(previous_professional_id) {
                    ps.remove_reservation(&reservation.id);
                }
                if let Some(ps) = set.get_mut(&reservation.professional_id) {
                    ps.insert_reservation(reservation.clone());
                }
                if let Some(mut p) = self.placements.get_mut(&reservation.id) {
                    p.professional_id = reservation.professional_id.clone();
                }
            }
            Event::ReservationCancelled { id, professional_id } => {
                if let Some(ps) = set.get_mut(professional_id) {
                    ps.remove_reservation(id);
                }
                self.placements.remove(id);
            }
        }
    }
}
