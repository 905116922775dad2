/// Inline caches.
/// Every call, method-call, index and member expression owns a site id
/// assigned at parse time; the cache stores recent dispatch outcomes
/// per site, keyed by the receiver's `TypeKey`. Entries live in a
/// fixed-size inline array so the monomorphic path is a single
/// comparison and the polymorphic path a short linear scan.
///
/// State machine per site:
///   Uninit -> Mono on the first recorded dispatch
///   Mono   -> Poly on a second receiver type
///   Poly   -> Mega once more than POLY_MAX types are seen
/// A megamorphic site stops caching; lookups always miss.

use crate::value::TypeKey;
use std::collections::HashMap;
use std::sync::Arc;

pub const POLY_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninit,
    Mono,
    Poly,
    Mega,
}

/// Where a cached dispatch goes. Method calls resolve to a slot in the
/// method table; member reads, element loads and plain calls only need
/// the dispatch shape confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTarget {
    BuiltinMethod(u16),
    ObjectField,
    DictEntry,
    Element,
    Callable,
}

#[derive(Debug, Clone, Copy)]
pub struct IcEntry {
    pub key: TypeKey,
    pub target: DispatchTarget,
    pub hits: u32,
}

#[derive(Debug)]
pub struct CallSite {
    pub site_id: u32,
    pub method_name: Arc<str>,
    pub state: IcState,
    pub entries: [Option<IcEntry>; POLY_MAX],
    pub hits: u64,
    pub misses: u64,
}

impl CallSite {
    fn new(site_id: u32, method_name: Arc<str>) -> Self {
        CallSite {
            site_id,
            method_name,
            state: IcState::Uninit,
            entries: [None; POLY_MAX],
            hits: 0,
            misses: 0,
        }
    }

    #[inline(always)]
    fn lookup(&mut self, key: TypeKey) -> Option<DispatchTarget> {
        match self.state {
            IcState::Mono => {
                if let Some(entry) = &mut self.entries[0] {
                    if entry.key == key {
                        entry.hits += 1;
                        self.hits += 1;
                        return Some(entry.target);
                    }
                }
                self.misses += 1;
                None
            }
            IcState::Poly => {
                for slot in self.entries.iter_mut() {
                    if let Some(entry) = slot {
                        if entry.key == key {
                            entry.hits += 1;
                            self.hits += 1;
                            return Some(entry.target);
                        }
                    }
                }
                self.misses += 1;
                None
            }
            IcState::Uninit | IcState::Mega => {
                self.misses += 1;
                None
            }
        }
    }

    fn update(&mut self, key: TypeKey, target: DispatchTarget) {
        if self.state == IcState::Mega {
            return;
        }
        // Replace an existing entry for the same type in place.
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.key == key {
                    entry.target = target;
                    return;
                }
            }
        }
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(IcEntry { key, target, hits: 0 });
                let filled = self.entries.iter().filter(|e| e.is_some()).count();
                self.state = if filled == 1 { IcState::Mono } else { IcState::Poly };
                return;
            }
        }
        // All POLY_MAX slots taken and a new type arrived.
        self.state = IcState::Mega;
        self.entries = [None; POLY_MAX];
    }

    fn reset(&mut self) {
        self.state = IcState::Uninit;
        self.entries = [None; POLY_MAX];
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IcStats {
    pub sites: usize,
    pub mono: usize,
    pub poly: usize,
    pub mega: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
pub struct IcManager {
    sites: HashMap<u32, CallSite>,
}

impl IcManager {
    pub fn new() -> Self {
        IcManager { sites: HashMap::new() }
    }

    pub fn lookup(&mut self, site_id: u32, key: TypeKey) -> Option<DispatchTarget> {
        self.sites.get_mut(&site_id)?.lookup(key)
    }

    pub fn update(
        &mut self,
        site_id: u32,
        method_name: &Arc<str>,
        key: TypeKey,
        target: DispatchTarget,
    ) {
        self.sites
            .entry(site_id)
            .or_insert_with(|| CallSite::new(site_id, method_name.clone()))
            .update(key, target);
    }

    pub fn state(&self, site_id: u32) -> IcState {
        self.sites.get(&site_id).map(|s| s.state).unwrap_or(IcState::Uninit)
    }

    pub fn invalidate(&mut self, site_id: u32) {
        if let Some(site) = self.sites.get_mut(&site_id) {
            site.reset();
        }
    }

    /// Reset every site caching the given method name; used when a
    /// module rebind replaces a callable.
    pub fn invalidate_method(&mut self, name: &str) {
        for site in self.sites.values_mut() {
            if site.method_name.as_ref() == name {
                site.reset();
            }
        }
    }

    /// Monomorphic sites with a strong hit count, ordered best first.
    /// The JIT treats these as inlining candidates; megamorphic sites
    /// never appear here.
    pub fn inline_candidates(&self, min_hits: u64) -> Vec<u32> {
        let mut candidates: Vec<(u32, u64)> = self
            .sites
            .values()
            .filter(|s| s.state == IcState::Mono && s.hits >= min_hits)
            .map(|s| (s.site_id, s.hits))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.into_iter().map(|(id, _)| id).collect()
    }

    pub fn stats(&self) -> IcStats {
        let mut stats = IcStats { sites: self.sites.len(), ..Default::default() };
        for site in self.sites.values() {
            match site.state {
                IcState::Mono => stats.mono += 1,
                IcState::Poly => stats.poly += 1,
                IcState::Mega => stats.mega += 1,
                IcState::Uninit => {}
            }
            stats.hits += site.hits;
            stats.misses += site.misses;
        }
        stats
    }
}
