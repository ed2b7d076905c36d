use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use log::{info, warn};

use crate::{config::PersistedState, error::PersistenceError, storage::StateStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Bag,
    Gift,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseDelta {
    pub bag: u64,
    pub gift: u64,
}

impl PulseDelta {
    pub fn is_empty(&self) -> bool {
        self.bag == 0 && self.gift == 0
    }
}

/// Pulse counts recorded from edge callbacks and not yet folded into the
/// totals.
///
/// `record` is a single `fetch_add(Release)` and never blocks or allocates,
/// so it may run in interrupt context. `drain` swaps each count to zero with
/// `AcqRel`; every recorded pulse is observed by exactly one drain.
#[derive(Debug, Default)]
pub struct PulseCounters {
    bag: AtomicU64,
    gift: AtomicU64,
}

impl PulseCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: PulseKind) {
        self.counter(kind).fetch_add(1, Ordering::Release);
    }

    pub fn drain(&self) -> PulseDelta {
        PulseDelta {
            bag: self.bag.swap(0, Ordering::AcqRel),
            gift: self.gift.swap(0, Ordering::AcqRel),
        }
    }

    fn counter(&self, kind: PulseKind) -> &AtomicU64 {
        match kind {
            PulseKind::Bag => &self.bag,
            PulseKind::Gift => &self.gift,
        }
    }
}

/// Fields of a `Counters.Set` command; `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterUpdate {
    pub total_bag: Option<f64>,
    pub total_gift: Option<f64>,
    pub init_bag: Option<f64>,
    pub init_gift: Option<f64>,
}

impl CounterUpdate {
    pub fn is_empty(&self) -> bool {
        self.total_bag.is_none()
            && self.total_gift.is_none()
            && self.init_bag.is_none()
            && self.init_gift.is_none()
    }
}

/// Owner of the persisted record and the only writer of durable storage.
///
/// Every setter folds pending pulses first and writes through to storage.
#[derive(Debug)]
pub struct CounterStore<S> {
    state: PersistedState,
    pulses: Arc<PulseCounters>,
    storage: S,
}

impl<S: StateStorage> CounterStore<S> {
    /// Load the record from `storage`, falling back to defaults.
    pub fn open(storage: S) -> Self {
        let mut store = Self::with_state(storage, PersistedState::default());
        match store.load() {
            Ok(state) => {
                info!(
                    "state loaded: bags={}, gifts={}, auto={}, hours={}..{}",
                    state.total_bag, state.total_gift, state.enable_auto, state.on_hour, state.off_hour
                );
                store.state = state;
            }
            Err(err) => warn!("failed to load state, using defaults: {err}"),
        }
        store
    }

    pub fn with_state(storage: S, state: PersistedState) -> Self {
        Self {
            state,
            pulses: Arc::new(PulseCounters::new()),
            storage,
        }
    }

    /// Read and decode the stored document without touching the live record.
    pub fn load(&self) -> Result<PersistedState, PersistenceError> {
        let raw = self.storage.read()?;
        serde_json::from_slice::<PersistedState>(&raw).map_err(PersistenceError::Parse)
    }

    /// Handle for edge callbacks.
    pub fn pulse_counters(&self) -> Arc<PulseCounters> {
        Arc::clone(&self.pulses)
    }

    pub fn increment_bag(&self) {
        self.pulses.record(PulseKind::Bag);
    }

    pub fn increment_gift(&self) {
        self.pulses.record(PulseKind::Gift);
    }

    /// Fold pending pulses into the totals without persisting.
    pub fn fold_pulses(&mut self) -> PulseDelta {
        let delta = self.pulses.drain();
        if !delta.is_empty() {
            self.state.total_bag += delta.bag as f64;
            self.state.total_gift += delta.gift as f64;
            info!(
                "pulses folded: +{} bags, +{} gifts (totals {} / {})",
                delta.bag, delta.gift, self.state.total_bag, self.state.total_gift
            );
        }
        delta
    }

    /// Fold pending pulses and persist if any were pending.
    pub fn absorb_pulses(&mut self) -> PulseDelta {
        let delta = self.fold_pulses();
        if !delta.is_empty() {
            let _ = self.persist();
        }
        delta
    }

    pub fn set_total_bag(&mut self, value: f64) {
        self.update(|state| state.total_bag = value);
    }

    pub fn set_total_gift(&mut self, value: f64) {
        self.update(|state| state.total_gift = value);
    }

    pub fn set_init_bag(&mut self, value: f64) {
        self.update(|state| state.init_bag = value);
    }

    pub fn set_init_gift(&mut self, value: f64) {
        self.update(|state| state.init_gift = value);
    }

    pub fn set_enable_auto(&mut self, enabled: bool) {
        self.update(|state| state.enable_auto = enabled);
    }

    pub fn set_on_hour(&mut self, hour: i32) {
        self.update(|state| state.on_hour = hour);
    }

    pub fn set_off_hour(&mut self, hour: i32) {
        self.update(|state| state.off_hour = hour);
    }

    /// Apply every present field with a single write. Returns false, without
    /// persisting, when the update carries no field.
    pub fn set_counters(&mut self, update: &CounterUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        self.update(|state| {
            if let Some(value) = update.total_bag {
                state.total_bag = value;
            }
            if let Some(value) = update.total_gift {
                state.total_gift = value;
            }
            if let Some(value) = update.init_bag {
                state.init_bag = value;
            }
            if let Some(value) = update.init_gift {
                state.init_gift = value;
            }
        });
        true
    }

    pub fn snapshot(&mut self) -> PersistedState {
        self.fold_pulses();
        self.state.clone()
    }

    /// Write the current record. Failures are logged and returned; the
    /// in-memory record stays authoritative either way.
    pub fn persist(&mut self) -> Result<(), PersistenceError> {
        self.fold_pulses();

        let mut document = self.state.clone();
        document.last_saved_at = Some(Utc::now());

        let result = serde_json::to_vec(&document)
            .map_err(PersistenceError::Encode)
            .and_then(|payload| self.storage.write(&payload));

        match result {
            Ok(()) => {
                self.state.last_saved_at = document.last_saved_at;
                Ok(())
            }
            Err(err) => {
                warn!("failed to persist state: {err}");
                Err(err)
            }
        }
    }

    fn update(&mut self, apply: impl FnOnce(&mut PersistedState)) {
        self.fold_pulses();
        apply(&mut self.state);
        let _ = self.persist();
    }
}
