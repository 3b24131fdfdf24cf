//! Memory admission control and eviction
//!
//! The manager tracks a single byte budget shared by every resident model.
//! All admission, commit, release and eviction decisions run under one lock,
//! so two callers can never both observe the same free space. Release hooks
//! of evicted models run after the lock is dropped, exactly once each.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use common::error::LifecycleError;
use common::models::ModelPriority;
use common::utils::format_bytes;
use runtime_config::MemoryConfiguration;

/// Callback that releases the inference service behind a resident model
pub type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// Memory manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request does not fit even after every permitted eviction
    #[error("insufficient memory: requested {requested} bytes, {available} bytes obtainable")]
    InsufficientMemory { requested: u64, available: u64 },

    /// The model already holds an entry or a pending reservation
    #[error("model {0} is already admitted")]
    AlreadyResident(String),

    /// Internal accounting no longer adds up
    #[error("memory accounting invariant violated: {0}")]
    InvariantViolated(String),
}

impl From<MemoryError> for LifecycleError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::InsufficientMemory { requested, available } => {
                LifecycleError::InsufficientMemory { requested, available }
            }
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

/// Snapshot of the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Hard ceiling in bytes
    pub ceiling: u64,
    /// Bytes held by resident models and pending reservations
    pub committed: u64,
    /// Headroom below the ceiling that is never allocated
    pub safety_margin: u64,
}

impl MemoryBudget {
    /// Largest total that admissions may reach
    pub fn admission_limit(&self) -> u64 {
        self.ceiling.saturating_sub(self.safety_margin)
    }

    /// Bytes that can be admitted without eviction
    pub fn available(&self) -> u64 {
        self.admission_limit().saturating_sub(self.committed)
    }
}

/// A resident model as seen by the memory manager
pub struct LoadedModelEntry {
    /// Model id
    pub model_id: String,
    /// Resident size in bytes
    pub size: u64,
    /// Last time the model was handed to a caller
    pub last_access: Instant,
    /// Eviction priority
    pub priority: ModelPriority,
    /// Logical access clock, strictly increasing across the manager
    access_tick: u64,
    /// Invoked once when the entry is evicted or released
    release: Option<ReleaseHook>,
}

impl fmt::Debug for LoadedModelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModelEntry")
            .field("model_id", &self.model_id)
            .field("size", &self.size)
            .field("last_access", &self.last_access)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Public view of a resident entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentModel {
    /// Model id
    pub model_id: String,
    /// Resident size in bytes
    pub size: u64,
    /// Eviction priority
    pub priority: ModelPriority,
    /// Last access time
    pub last_access: Instant,
}

/// Result of a granted admission
#[derive(Debug)]
pub struct Admission {
    /// Models evicted to make room, in eviction order
    pub evicted: Vec<String>,
    /// Provisional claim on the budget
    pub reservation: Reservation,
}

struct MemoryState {
    ceiling: u64,
    safety_margin: u64,
    pressure_margin_multiplier: f64,
    committed: u64,
    entries: HashMap<String, LoadedModelEntry>,
    reservations: HashMap<String, u64>,
    clock: u64,
}

impl MemoryState {
    fn budget(&self) -> MemoryBudget {
        MemoryBudget {
            ceiling: self.ceiling,
            committed: self.committed,
            safety_margin: self.safety_margin,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Eviction candidates, lowest priority first, then least recently used
    fn eviction_order(&self, include_critical: bool) -> Vec<(String, u64)> {
        let mut candidates: Vec<&LoadedModelEntry> = self
            .entries
            .values()
            .filter(|entry| entry.priority != ModelPriority::Critical)
            .collect();
        candidates.sort_by(|a, b| {
            (a.priority, a.access_tick, &a.model_id).cmp(&(b.priority, b.access_tick, &b.model_id))
        });

        if include_critical {
            let mut critical: Vec<&LoadedModelEntry> = self
                .entries
                .values()
                .filter(|entry| entry.priority == ModelPriority::Critical)
                .collect();
            critical.sort_by(|a, b| (a.access_tick, &a.model_id).cmp(&(b.access_tick, &b.model_id)));
            candidates.extend(critical);
        }

        candidates
            .into_iter()
            .map(|entry| (entry.model_id.clone(), entry.size))
            .collect()
    }

    /// Shortest prefix of the eviction order that frees `needed` bytes
    fn plan_eviction(&self, needed: u64, include_critical: bool) -> Result<Vec<String>, u64> {
        let mut freed = 0u64;
        let mut plan = Vec::new();

        for (model_id, size) in self.eviction_order(include_critical) {
            if freed >= needed {
                break;
            }
            freed += size;
            plan.push(model_id);
        }

        if freed >= needed {
            Ok(plan)
        } else {
            Err(freed)
        }
    }

    fn evict(&mut self, plan: &[String]) -> Vec<(String, Option<ReleaseHook>)> {
        plan.iter()
            .filter_map(|model_id| self.entries.remove(model_id))
            .map(|mut entry| {
                self.committed -= entry.size;
                (entry.model_id, entry.release.take())
            })
            .collect()
    }

    fn verify(&self) -> Result<(), MemoryError> {
        let resident: u64 = self.entries.values().map(|entry| entry.size).sum();
        let reserved: u64 = self.reservations.values().sum();

        if resident + reserved != self.committed {
            return Err(MemoryError::InvariantViolated(format!(
                "committed {} != resident {} + reserved {}",
                self.committed, resident, reserved
            )));
        }
        if self.committed > self.ceiling {
            return Err(MemoryError::InvariantViolated(format!(
                "committed {} exceeds ceiling {}",
                self.committed, self.ceiling
            )));
        }
        Ok(())
    }
}

/// Memory manager shared by every acquisition
#[derive(Clone)]
pub struct MemoryManager {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryManager {
    /// Creates a memory manager with an explicit ceiling and margin
    pub fn new(ceiling: u64, safety_margin: u64) -> Self {
        Self::with_pressure_multiplier(ceiling, safety_margin, 2.0)
    }

    /// Creates a memory manager with a custom pressure-sweep margin multiplier
    pub fn with_pressure_multiplier(ceiling: u64, safety_margin: u64, pressure_margin_multiplier: f64) -> Self {
        info!(
            "Memory budget: ceiling {}, safety margin {}",
            format_bytes(ceiling),
            format_bytes(safety_margin)
        );

        Self {
            state: Arc::new(Mutex::new(MemoryState {
                ceiling,
                safety_margin,
                pressure_margin_multiplier: pressure_margin_multiplier.max(1.0),
                committed: 0,
                entries: HashMap::new(),
                reservations: HashMap::new(),
                clock: 0,
            })),
        }
    }

    /// Creates a memory manager from configuration, sizing the ceiling from the host when unset
    pub fn from_config(config: &MemoryConfiguration) -> Self {
        let ceiling = crate::monitor::resolve_ceiling(config);
        Self::with_pressure_multiplier(ceiling, config.safety_margin, config.pressure_margin_multiplier)
    }

    /// Requests room for a model, evicting lower-priority residents when needed
    ///
    /// The returned reservation counts against the budget immediately and is
    /// rolled back if dropped without [`Reservation::commit`].
    pub fn admit(&self, model_id: &str, estimated_size: u64, priority: ModelPriority) -> Result<Admission, MemoryError> {
        let (evicted, reservation) = {
            let mut state = self.state.lock();

            if state.entries.contains_key(model_id) || state.reservations.contains_key(model_id) {
                return Err(MemoryError::AlreadyResident(model_id.to_string()));
            }

            let limit = state.budget().admission_limit();
            if estimated_size > limit {
                warn!(
                    "Model {} needs {} but the budget can never hold more than {}",
                    model_id,
                    format_bytes(estimated_size),
                    format_bytes(limit)
                );
                return Err(MemoryError::InsufficientMemory {
                    requested: estimated_size,
                    available: limit,
                });
            }

            let mut evicted = Vec::new();
            if state.committed + estimated_size > limit {
                let needed = state.committed + estimated_size - limit;
                let include_critical = priority == ModelPriority::Critical;

                let plan = state.plan_eviction(needed, include_critical).map_err(|freeable| {
                    MemoryError::InsufficientMemory {
                        requested: estimated_size,
                        available: state.budget().available() + freeable,
                    }
                })?;

                debug!("Evicting {:?} to admit {} ({} needed)", plan, model_id, format_bytes(needed));
                evicted = state.evict(&plan);
            }

            state.committed += estimated_size;
            state.reservations.insert(model_id.to_string(), estimated_size);

            if let Err(e) = state.verify() {
                error!("{}", e);
                state.committed -= estimated_size;
                state.reservations.remove(model_id);
                drop(state);
                run_hooks(evicted);
                return Err(e);
            }

            let reservation = Reservation {
                manager: self.clone(),
                model_id: model_id.to_string(),
                size: estimated_size,
                priority,
                settled: false,
            };
            (evicted, reservation)
        };

        let evicted_ids = run_hooks(evicted);

        info!(
            "Admitted {} ({}, {}), evicted {:?}",
            model_id,
            format_bytes(estimated_size),
            priority,
            evicted_ids
        );

        Ok(Admission {
            evicted: evicted_ids,
            reservation,
        })
    }

    /// Releases a resident model; returns false if it was not resident
    pub fn release(&self, model_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.evict(&[model_id.to_string()])
        };

        if removed.is_empty() {
            debug!("Release of {} ignored, model is not resident", model_id);
            return false;
        }

        run_hooks(removed);
        info!("Released {}", model_id);
        true
    }

    /// Records an access to a resident model; returns false if it was not resident
    pub fn touch(&self, model_id: &str) -> bool {
        let mut state = self.state.lock();
        let tick = state.tick();
        match state.entries.get_mut(model_id) {
            Some(entry) => {
                entry.access_tick = tick;
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Proactively evicts models against an enlarged safety margin
    ///
    /// Invoked by the host when available memory runs low. Critical models are
    /// never evicted by a sweep.
    pub fn on_pressure_signal(&self) -> Vec<String> {
        let evicted = {
            let mut state = self.state.lock();
            let margin = (state.safety_margin as f64 * state.pressure_margin_multiplier) as u64;
            let limit = state.ceiling.saturating_sub(margin);

            if state.committed <= limit {
                debug!("Pressure signal: committed {} within {}", state.committed, limit);
                return Vec::new();
            }

            let needed = state.committed - limit;
            let plan = match state.plan_eviction(needed, false) {
                Ok(plan) => plan,
                Err(_) => {
                    warn!("Pressure signal: evicting every non-critical model still leaves the budget above {}", limit);
                    state.eviction_order(false).into_iter().map(|(id, _)| id).collect()
                }
            };
            state.evict(&plan)
        };

        let evicted_ids = run_hooks(evicted);
        if !evicted_ids.is_empty() {
            info!("Pressure signal evicted {:?}", evicted_ids);
        }
        evicted_ids
    }

    /// Bytes held by resident models and pending reservations
    pub fn current_usage(&self) -> u64 {
        self.state.lock().committed
    }

    /// Snapshot of the budget
    pub fn budget(&self) -> MemoryBudget {
        self.state.lock().budget()
    }

    /// Returns true if the model holds a committed entry
    pub fn is_resident(&self, model_id: &str) -> bool {
        self.state.lock().entries.contains_key(model_id)
    }

    /// Resident models, least recently used first
    pub fn entries(&self) -> Vec<ResidentModel> {
        let state = self.state.lock();
        let mut entries: Vec<&LoadedModelEntry> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.access_tick);
        entries
            .into_iter()
            .map(|entry| ResidentModel {
                model_id: entry.model_id.clone(),
                size: entry.size,
                priority: entry.priority,
                last_access: entry.last_access,
            })
            .collect()
    }

    /// Checks the accounting invariants
    pub fn verify(&self) -> Result<(), MemoryError> {
        self.state.lock().verify()
    }
}

fn run_hooks(evicted: Vec<(String, Option<ReleaseHook>)>) -> Vec<String> {
    evicted
        .into_iter()
        .map(|(model_id, hook)| {
            if let Some(hook) = hook {
                hook();
            }
            model_id
        })
        .collect()
}

/// Provisional claim on the budget
///
/// Commit it once the model is loaded; dropping it returns the bytes.
pub struct Reservation {
    manager: MemoryManager,
    model_id: String,
    size: u64,
    priority: ModelPriority,
    settled: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("model_id", &self.model_id)
            .field("size", &self.size)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Reservation {
    /// Reserved bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Turns the reservation into a resident entry owning `release`
    pub fn commit(mut self, release: ReleaseHook) {
        let mut state = self.manager.state.lock();
        state.reservations.remove(&self.model_id);
        let tick = state.tick();
        state.entries.insert(
            self.model_id.clone(),
            LoadedModelEntry {
                model_id: self.model_id.clone(),
                size: self.size,
                last_access: Instant::now(),
                priority: self.priority,
                access_tick: tick,
                release: Some(release),
            },
        );
        self.settled = true;
        debug!("Committed {} as resident", self.model_id);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.manager.state.lock();
        if state.reservations.remove(&self.model_id).is_some() {
            state.committed -= self.size;
            debug!("Rolled back reservation of {} for {}", format_bytes(self.size), self.model_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> ReleaseHook {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn load(manager: &MemoryManager, id: &str, size: u64, priority: ModelPriority) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let admission = manager.admit(id, size, priority).unwrap();
        admission.reservation.commit(counting_hook(&counter));
        counter
    }

    #[test]
    fn test_admit_without_eviction() {
        let manager = MemoryManager::new(GB, 0);
        let admission = manager.admit("x", 500 * MB, ModelPriority::Normal).unwrap();
        assert!(admission.evicted.is_empty());
        admission.reservation.commit(Box::new(|| {}));

        assert_eq!(manager.current_usage(), 500 * MB);
        assert!(manager.is_resident("x"));
        manager.verify().unwrap();
    }

    #[test]
    fn test_lru_eviction_invokes_hook_once() {
        let manager = MemoryManager::new(GB, 0);
        let x_released = load(&manager, "x", 500 * MB, ModelPriority::Normal);

        let admission = manager.admit("y", 700 * MB, ModelPriority::Normal).unwrap();
        assert_eq!(admission.evicted, vec!["x".to_string()]);
        admission.reservation.commit(Box::new(|| {}));

        assert_eq!(manager.current_usage(), 700 * MB);
        assert_eq!(x_released.load(Ordering::SeqCst), 1);
        assert!(!manager.is_resident("x"));

        // releasing again is a no-op
        assert!(!manager.release("x"));
        assert_eq!(x_released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evicts_minimal_lowest_priority_lru_prefix() {
        let manager = MemoryManager::new(1000, 0);
        load(&manager, "high-old", 300, ModelPriority::High);
        load(&manager, "normal-old", 300, ModelPriority::Normal);
        load(&manager, "low", 200, ModelPriority::Low);
        load(&manager, "normal-new", 200, ModelPriority::Normal);

        // full; 400 bytes must go: low (200) then normal-old (300)
        let admission = manager.admit("incoming", 400, ModelPriority::Normal).unwrap();
        assert_eq!(admission.evicted, vec!["low".to_string(), "normal-old".to_string()]);
        admission.reservation.commit(Box::new(|| {}));

        assert!(manager.is_resident("high-old"));
        assert!(manager.is_resident("normal-new"));
        assert_eq!(manager.current_usage(), 900);
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let manager = MemoryManager::new(1000, 0);
        load(&manager, "a", 500, ModelPriority::Normal);
        load(&manager, "b", 500, ModelPriority::Normal);
        assert!(manager.touch("a"));

        let admission = manager.admit("c", 400, ModelPriority::Normal).unwrap();
        assert_eq!(admission.evicted, vec!["b".to_string()]);
    }

    #[test]
    fn test_critical_entries_are_protected() {
        let manager = MemoryManager::new(1000, 0);
        let critical_released = load(&manager, "critical", 600, ModelPriority::Critical);
        load(&manager, "normal", 300, ModelPriority::Normal);

        let err = manager.admit("big", 500, ModelPriority::High).unwrap_err();
        assert_eq!(
            err,
            MemoryError::InsufficientMemory {
                requested: 500,
                available: 400
            }
        );
        // nothing was evicted by the failed admission
        assert!(manager.is_resident("normal"));
        assert_eq!(critical_released.load(Ordering::SeqCst), 0);
        assert_eq!(manager.current_usage(), 900);
    }

    #[test]
    fn test_critical_request_may_evict_critical_as_last_resort() {
        let manager = MemoryManager::new(1000, 0);
        let critical_released = load(&manager, "critical", 600, ModelPriority::Critical);
        load(&manager, "normal", 300, ModelPriority::Normal);

        let admission = manager.admit("other-critical", 900, ModelPriority::Critical).unwrap();
        assert_eq!(admission.evicted, vec!["normal".to_string(), "critical".to_string()]);
        assert_eq!(critical_released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_larger_than_budget_is_denied_without_eviction() {
        let manager = MemoryManager::new(1000, 100);
        load(&manager, "a", 500, ModelPriority::Low);

        let err = manager.admit("huge", 901, ModelPriority::Normal).unwrap_err();
        assert!(matches!(err, MemoryError::InsufficientMemory { available: 900, .. }));
        assert!(manager.is_resident("a"));
    }

    #[test]
    fn test_safety_margin_is_never_allocated() {
        let manager = MemoryManager::new(1000, 200);
        load(&manager, "a", 800, ModelPriority::Normal);
        assert_eq!(manager.budget().available(), 0);

        let admission = manager.admit("b", 1, ModelPriority::Normal).unwrap();
        assert_eq!(admission.evicted, vec!["a".to_string()]);
    }

    #[test]
    fn test_dropped_reservation_rolls_back() {
        let manager = MemoryManager::new(1000, 0);
        {
            let admission = manager.admit("a", 600, ModelPriority::Normal).unwrap();
            assert_eq!(manager.current_usage(), 600);
            assert!(!manager.is_resident("a"));
            drop(admission);
        }
        assert_eq!(manager.current_usage(), 0);
        manager.verify().unwrap();
    }

    #[test]
    fn test_duplicate_admission_is_rejected() {
        let manager = MemoryManager::new(1000, 0);
        let _pending = manager.admit("a", 100, ModelPriority::Normal).unwrap();
        assert_eq!(
            manager.admit("a", 100, ModelPriority::Normal).unwrap_err(),
            MemoryError::AlreadyResident("a".to_string())
        );
    }

    #[test]
    fn test_pressure_signal_uses_enlarged_margin() {
        let manager = MemoryManager::with_pressure_multiplier(1000, 100, 3.0);
        load(&manager, "critical", 300, ModelPriority::Critical);
        load(&manager, "old", 200, ModelPriority::Normal);
        load(&manager, "new", 200, ModelPriority::Normal);

        // limit under pressure = 1000 - 300 = 700; committed = 700
        assert!(manager.on_pressure_signal().is_empty());

        load(&manager, "extra", 100, ModelPriority::Low);
        let evicted = manager.on_pressure_signal();
        assert_eq!(evicted, vec!["extra".to_string()]);
        assert!(manager.is_resident("critical"));
        assert_eq!(manager.current_usage(), 700);
    }

    #[test]
    fn test_concurrent_admissions_never_overshoot() {
        let manager = MemoryManager::new(1000, 0);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    if let Ok(admission) = manager.admit(&format!("m{}", i), 300, ModelPriority::Critical) {
                        admission.reservation.commit(Box::new(|| {}));
                    }
                    manager.verify().unwrap();
                    assert!(manager.current_usage() <= 1000);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(manager.current_usage() <= 1000);
        manager.verify().unwrap();
    }
}
