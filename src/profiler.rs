/// Profiler.
/// Per-function call and wall-time accounting stamped with a monotonic
/// clock on enter/exit. A function is a hot spot once its share of the
/// total recorded time crosses `hot_frac` and its call count exceeds
/// `hot_call_min`; the coordinator polls hot spots between statements
/// and at call returns, never inside tight loops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const HOT_THRESHOLD_FRAC: f64 = 0.05;
pub const HOT_CALL_MIN: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct FuncStats {
    pub call_count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl Default for FuncStats {
    fn default() -> Self {
        FuncStats { call_count: 0, total_ns: 0, min_ns: u64::MAX, max_ns: 0 }
    }
}

pub struct Profiler {
    stats: Mutex<HashMap<Arc<str>, FuncStats>>,
    stack: Mutex<Vec<(Arc<str>, Instant)>>,
    grand_total_ns: AtomicU64,
    pub hot_frac: f64,
    pub hot_call_min: u64,
}

impl Profiler {
    pub fn new(hot_frac: f64, hot_call_min: u64) -> Self {
        Profiler {
            stats: Mutex::new(HashMap::new()),
            stack: Mutex::new(Vec::new()),
            grand_total_ns: AtomicU64::new(0),
            hot_frac,
            hot_call_min,
        }
    }

    #[inline]
    pub fn enter(&self, name: &Arc<str>) {
        {
            let mut stats = self.stats.lock();
            stats.entry(name.clone()).or_default().call_count += 1;
        }
        self.stack.lock().push((name.clone(), Instant::now()));
    }

    #[inline]
    pub fn exit(&self, name: &Arc<str>) {
        let entry = self.stack.lock().pop();
        let Some((entered, at)) = entry else { return };
        debug_assert_eq!(entered.as_ref(), name.as_ref());
        let elapsed = at.elapsed().as_nanos() as u64;
        let mut stats = self.stats.lock();
        if let Some(s) = stats.get_mut(&entered) {
            s.total_ns += elapsed;
            s.min_ns = s.min_ns.min(elapsed);
            s.max_ns = s.max_ns.max(elapsed);
        }
        self.grand_total_ns.fetch_add(elapsed, Ordering::Relaxed);
    }

    pub fn call_count(&self, name: &str) -> u64 {
        self.stats.lock().get(name).map(|s| s.call_count).unwrap_or(0)
    }

    pub fn stats_for(&self, name: &str) -> Option<FuncStats> {
        self.stats.lock().get(name).copied()
    }

    /// Hot-spot test: time share over threshold and enough calls.
    pub fn is_hot(&self, name: &str) -> bool {
        let total = self.grand_total_ns.load(Ordering::Relaxed);
        if total == 0 {
            return false;
        }
        let stats = self.stats.lock();
        let Some(s) = stats.get(name) else { return false };
        s.call_count > self.hot_call_min
            && (s.total_ns as f64 / total as f64) > self.hot_frac
    }

    pub fn hot_spots(&self) -> Vec<Arc<str>> {
        let total = self.grand_total_ns.load(Ordering::Relaxed);
        if total == 0 {
            return Vec::new();
        }
        let stats = self.stats.lock();
        let mut hot: Vec<(Arc<str>, u64)> = stats
            .iter()
            .filter(|(_, s)| {
                s.call_count > self.hot_call_min
                    && (s.total_ns as f64 / total as f64) > self.hot_frac
            })
            .map(|(name, s)| (name.clone(), s.total_ns))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1));
        hot.into_iter().map(|(name, _)| name).collect()
    }

    /// Every profiled function, heaviest first. Used by the stats
    /// report.
    pub fn report(&self) -> Vec<(Arc<str>, FuncStats)> {
        let stats = self.stats.lock();
        let mut all: Vec<(Arc<str>, FuncStats)> =
            stats.iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns));
        all
    }

    pub fn total_ns(&self) -> u64 {
        self.grand_total_ns.load(Ordering::Relaxed)
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Profiler::new(HOT_THRESHOLD_FRAC, HOT_CALL_MIN)
    }
}
