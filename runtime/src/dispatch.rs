use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use log::{debug, trace};

use crate::{
    CallKind, ConfigError, Method, ObjectModel, Resolution, RuntimeError,
    Selector, ShapeId, ValidityToken, Value,
};

pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 8;
const MAX_CHAIN_LENGTH_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Distinct live shapes a call site caches before it degrades.
    pub max_chain_length: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
        }
    }
}

impl DispatchSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chain_length == 0 {
            return Err(ConfigError("max chain length must be at least 1"));
        }
        if self.max_chain_length > MAX_CHAIN_LENGTH_LIMIT {
            return Err(ConfigError("max chain length must be at most 64"));
        }
        Ok(())
    }
}

/// One memoized `shape -> method` binding. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    expected: ShapeId,
    token: ValidityToken,
    method: Arc<Method>,
}

impl CacheEntry {
    fn from_resolution(resolution: &Resolution) -> Self {
        Self {
            expected: resolution.shape.id(),
            token: resolution.shape.token().clone(),
            method: resolution.method.clone(),
        }
    }

    pub fn expected(&self) -> ShapeId {
        self.expected
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline(always)]
    pub fn is_live(&self) -> bool {
        self.token.is_valid()
    }
}

#[derive(Debug)]
enum DispatchState {
    /// Newest entry first.
    Cached(Vec<CacheEntry>),
    Megamorphic,
}

enum Probe {
    Hit(Arc<Method>),
    Miss,
    Stale,
    Megamorphic,
}

#[derive(Debug, Default)]
pub struct CallSiteStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    megamorphic_lookups: AtomicU64,
    respecializations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSiteStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Dead entries dropped from the chain on rebuild.
    pub invalidations: u64,
    pub megamorphic_lookups: u64,
    pub respecializations: u64,
}

impl CallSiteStats {
    #[inline(always)]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallSiteStatsSnapshot {
        CallSiteStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            megamorphic_lookups: self
                .megamorphic_lookups
                .load(Ordering::Relaxed),
            respecializations: self.respecializations.load(Ordering::Relaxed),
        }
    }
}

impl CallSiteStatsSnapshot {
    pub fn merge(self, other: Self) -> Self {
        Self {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            invalidations: self.invalidations + other.invalidations,
            megamorphic_lookups: self.megamorphic_lookups
                + other.megamorphic_lookups,
            respecializations: self.respecializations
                + other.respecializations,
        }
    }

    pub fn dispatches(&self) -> u64 {
        self.hits + self.misses + self.megamorphic_lookups
    }
}

/// Inline cache of one call site.
///
/// Readers pin the epoch and walk an immutable chain; writers build a new
/// chain and publish it with a single compare-and-swap. A site that sees
/// more distinct live shapes than `max_chain_length` becomes megamorphic
/// for good.
pub struct CallSite {
    selector: Selector,
    kind: CallKind,
    max_chain_length: usize,
    state: Atomic<DispatchState>,
    stats: CallSiteStats,
}

impl CallSite {
    pub fn new(
        selector: Selector,
        kind: CallKind,
        settings: &DispatchSettings,
    ) -> Self {
        Self {
            selector,
            kind,
            max_chain_length: settings.max_chain_length,
            state: Atomic::null(),
            stats: CallSiteStats::default(),
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn max_chain_length(&self) -> usize {
        self.max_chain_length
    }

    pub fn stats(&self) -> CallSiteStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dispatch(
        &self,
        model: &dyn ObjectModel,
        receiver: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let shape = model.current_shape(receiver);

        match self.probe(shape) {
            Probe::Hit(method) => {
                CallSiteStats::bump(&self.stats.hits);
                return method.invoke(receiver, args);
            }
            Probe::Megamorphic => {
                CallSiteStats::bump(&self.stats.megamorphic_lookups);
                let resolution =
                    model.resolve(receiver, &self.selector, self.kind)?;
                return resolution.method.invoke(receiver, args);
            }
            Probe::Stale => {
                CallSiteStats::bump(&self.stats.misses);
                trace!("{}: entry for {shape} is dead", self.selector);
            }
            Probe::Miss => {
                CallSiteStats::bump(&self.stats.misses);
                trace!("{}: miss for {shape}", self.selector);
            }
        }

        let resolution = model.resolve(receiver, &self.selector, self.kind)?;
        self.install(&resolution);
        resolution.method.invoke(receiver, args)
    }

    fn probe(&self, shape: ShapeId) -> Probe {
        let guard = epoch::pin();
        let state = self.state.load(Ordering::Acquire, &guard);
        // SAFETY: states are only reclaimed through `defer_destroy` after
        // being unlinked, and we hold a pin.
        match unsafe { state.as_ref() } {
            None => Probe::Miss,
            Some(DispatchState::Megamorphic) => Probe::Megamorphic,
            Some(DispatchState::Cached(entries)) => {
                match entries.iter().find(|e| e.expected == shape) {
                    Some(entry) if entry.is_live() => {
                        Probe::Hit(entry.method.clone())
                    }
                    Some(_) => Probe::Stale,
                    None => Probe::Miss,
                }
            }
        }
    }

    /// Publishes a chain that includes `resolution`, unless it is already
    /// dead, already cached, or the site has degraded.
    fn install(&self, resolution: &Resolution) {
        if !resolution.shape.is_valid() {
            return;
        }
        let shape = resolution.shape.id();
        let guard = epoch::pin();

        loop {
            let current = self.state.load(Ordering::Acquire, &guard);
            // SAFETY: see `probe`.
            let (live, pruned) = match unsafe { current.as_ref() } {
                Some(DispatchState::Megamorphic) => return,
                Some(DispatchState::Cached(entries)) => {
                    let live: Vec<CacheEntry> = entries
                        .iter()
                        .filter(|e| e.is_live())
                        .cloned()
                        .collect();
                    let pruned = entries.len() - live.len();
                    (live, pruned)
                }
                None => (Vec::new(), 0),
            };

            if live.iter().any(|e| e.expected == shape) {
                return;
            }

            let degrade = live.len() >= self.max_chain_length;
            let next = if degrade {
                DispatchState::Megamorphic
            } else {
                let mut chain = Vec::with_capacity(live.len() + 1);
                chain.push(CacheEntry::from_resolution(resolution));
                chain.extend(live);
                DispatchState::Cached(chain)
            };

            match self.state.compare_exchange(
                current,
                Owned::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if !current.is_null() {
                        // SAFETY: `current` is unlinked; readers still
                        // pinned on it keep it alive until they unpin.
                        unsafe { guard.defer_destroy(current) };
                    }
                    self.stats
                        .invalidations
                        .fetch_add(pruned as u64, Ordering::Relaxed);
                    if degrade {
                        debug!(
                            "{}: degraded to megamorphic after {} shapes",
                            self.selector, self.max_chain_length
                        );
                    } else {
                        CallSiteStats::bump(&self.stats.respecializations);
                        debug!(
                            "{}: cached {shape} -> {}#{}",
                            self.selector,
                            resolution.method.owner(),
                            resolution.method.name()
                        );
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        let guard = epoch::pin();
        let state = self.state.load(Ordering::Acquire, &guard);
        // SAFETY: see `probe`.
        matches!(unsafe { state.as_ref() }, Some(DispatchState::Megamorphic))
    }

    /// Number of entries in the published chain, dead ones included.
    pub fn cache_len(&self) -> usize {
        let guard = epoch::pin();
        let state = self.state.load(Ordering::Acquire, &guard);
        // SAFETY: see `probe`.
        match unsafe { state.as_ref() } {
            Some(DispatchState::Cached(entries)) => entries.len(),
            _ => 0,
        }
    }

    pub fn cached_shapes(&self) -> Vec<ShapeId> {
        self.snapshot_entries()
            .iter()
            .map(CacheEntry::expected)
            .collect()
    }

    pub fn snapshot_entries(&self) -> Vec<CacheEntry> {
        let guard = epoch::pin();
        let state = self.state.load(Ordering::Acquire, &guard);
        // SAFETY: see `probe`.
        match unsafe { state.as_ref() } {
            Some(DispatchState::Cached(entries)) => entries.clone(),
            _ => Vec::new(),
        }
    }
}

impl Drop for CallSite {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can be holding the state.
        unsafe {
            let guard = epoch::unprotected();
            let state = self.state.load(Ordering::Relaxed, guard);
            if !state.is_null() {
                drop(state.into_owned());
            }
        }
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("selector", &self.selector)
            .field("kind", &self.kind)
            .field("degraded", &self.is_degraded())
            .field("entries", &self.cache_len())
            .finish()
    }
}
