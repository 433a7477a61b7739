//! The coverage map and the edge id allocator feeding it.
//!
//! Instrumented code bumps one 8-bit counter per edge id. The map grows while classes are
//! instrumented; ids are never reused, so the map only ever gets longer.

use std::sync::{
    Mutex, OnceLock, PoisonError, RwLock,
    atomic::{AtomicU8, Ordering},
};

use crate::{COVERAGE_MAP_INITIAL_SIZE, COVERAGE_MAP_MAX_SIZE, Error};

/// A dense, zero-based edge identifier
pub type EdgeId = u32;

/// The counter value after one more hit.
///
/// Wraps from 255 to 1, so a counter that was hit once never reads 0 again.
#[inline]
#[must_use]
pub const fn saturating_increment(counter: u8) -> u8 {
    let next = counter as u32 + 1;
    (next + (next >> 8)) as u8
}

/// A growable buffer of 8-bit hit counters, indexed by [`EdgeId`]
#[derive(Debug)]
pub struct CoverageMap {
    counters: RwLock<Vec<AtomicU8>>,
    max_capacity: usize,
}

impl CoverageMap {
    /// A zeroed map of `capacity` counters that may grow up to `max_capacity`
    #[must_use]
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(capacity);
        Self {
            counters: RwLock::new((0..capacity).map(|_| AtomicU8::new(0)).collect()),
            max_capacity,
        }
    }

    /// Number of counters currently backed by memory
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The largest capacity [`Self::ensure_capacity`] will grow to
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Reads the counter at `offset`
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<u8> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters.get(offset).map(|c| c.load(Ordering::Relaxed))
    }

    /// Overwrites the counter at `offset`
    pub fn put(&self, offset: usize, value: u8) -> Result<(), Error> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.get(offset).ok_or_else(|| {
            Error::illegal_argument(format!(
                "offset {offset} out of bounds of the coverage map ({})",
                counters.len()
            ))
        })?;
        counter.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Records one hit at `offset`, returning the new counter value
    pub fn hit(&self, offset: usize) -> Result<u8, Error> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.get(offset).ok_or_else(|| {
            Error::illegal_argument(format!(
                "offset {offset} out of bounds of the coverage map ({})",
                counters.len()
            ))
        })?;
        let prev = counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(saturating_increment(c))
            })
            .unwrap_or_else(|c| c);
        Ok(saturating_increment(prev))
    }

    /// Grows the map, doubling, until it holds at least `required` counters.
    ///
    /// Existing counters keep their offsets and values.
    pub fn ensure_capacity(&self, required: usize) -> Result<(), Error> {
        if required <= self.capacity() {
            return Ok(());
        }
        if required > self.max_capacity {
            return Err(Error::map_growth(format!(
                "coverage map needs {required} counters, the maximum is {}",
                self.max_capacity
            )));
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        let old = counters.len();
        if required <= old {
            return Ok(());
        }
        let mut new = old.max(1);
        while new < required {
            new = new.saturating_mul(2);
        }
        let new = new.min(self.max_capacity);
        counters.resize_with(new, || AtomicU8::new(0));
        log::trace!("coverage map grown from {old} to {new} counters");
        Ok(())
    }

    /// A copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Sets every counter back to zero, keeping the capacity
    pub fn reset(&self) {
        for counter in self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Hands out edge ids and keeps the [`CoverageMap`] large enough to hold them
#[derive(Debug)]
pub struct CoverageState {
    map: CoverageMap,
    next_id: Mutex<EdgeId>,
    fixed_capacity: bool,
}

impl Default for CoverageState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageState {
    /// A growable map with the build-time default sizes
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(COVERAGE_MAP_INITIAL_SIZE, COVERAGE_MAP_MAX_SIZE)
    }

    /// A growable map starting at `initial` counters, capped at `max`
    #[must_use]
    pub fn with_capacity(initial: usize, max: usize) -> Self {
        Self {
            map: CoverageMap::new(initial, max),
            next_id: Mutex::new(0),
            fixed_capacity: false,
        }
    }

    /// A map that never grows; allocating past `capacity` fails
    #[must_use]
    pub fn fixed(capacity: usize) -> Self {
        Self {
            map: CoverageMap::new(capacity, capacity),
            next_id: Mutex::new(0),
            fixed_capacity: true,
        }
    }

    /// The process-wide instance used by default
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<CoverageState> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// The counters
    #[must_use]
    pub fn map(&self) -> &CoverageMap {
        &self.map
    }

    /// Whether the map is kept at its initial capacity
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.fixed_capacity
    }

    /// Allocates the next edge id, growing the map first if it would not fit.
    ///
    /// Allocation and growth happen under one lock, so concurrent callers never see an id
    /// the map cannot hold.
    pub fn next_edge_id(&self) -> Result<EdgeId, Error> {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        let required = id as usize + 1;
        if self.fixed_capacity {
            if required > self.map.capacity() {
                return Err(Error::map_growth(format!(
                    "edge id {id} does not fit the fixed coverage map of {} counters",
                    self.map.capacity()
                )));
            }
        } else {
            self.map.ensure_capacity(required)?;
        }
        *next = id
            .checked_add(1)
            .ok_or_else(|| Error::map_growth("edge ids exhausted"))?;
        Ok(id)
    }

    /// Number of edge ids handed out so far
    #[must_use]
    pub fn edges_allocated(&self) -> usize {
        *self.next_id.lock().unwrap_or_else(PoisonError::into_inner) as usize
    }

    /// Starts allocating at 0 again. The map keeps its size and counters.
    pub fn reset_edge_ids(&self) {
        *self.next_id.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}
