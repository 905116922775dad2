/// JIT compilation pipeline: AST lowering to a stack IR, optimization
/// passes, and a native backend over an executable code buffer. The
/// manager tracks per-function tiering state for the coordinator.
///
/// Tiers:
///   Interp    - tree-walk only; the function never lowered or bailed.
///   Baseline  - raw IR running on the IR interpreter.
///   Optimized - IR after DCE/folding/LICM, with native code when the
///               function fits the numeric subset.
///
/// Each promotion produces a fresh `JitFunction`; the previous one is
/// dropped once no executing frame still holds it, so code regions are
/// never patched in place.

pub mod backend;
pub mod codebuf;
pub mod ir;
pub mod lower;
pub mod opt;

use crate::ast::FuncDef;
use crate::jit::ir::{JitFunction, Tier};
use crate::jit::opt::OptConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub compiled_baseline: u64,
    pub compiled_optimized: u64,
    pub native_emitted: u64,
    pub lowering_bailed: u64,
    pub deopts: u64,
}

#[derive(Debug, Clone)]
pub struct SideExit {
    pub fn_id: u32,
    pub reason: &'static str,
}

pub struct JitManager {
    functions: HashMap<u32, Arc<JitFunction>>,
    exec_counts: HashMap<u32, u64>,
    blacklist: HashSet<u32>,
    side_exits: Vec<SideExit>,
    /// Baseline executions before a function is promoted to Optimized.
    pub opt_threshold: u64,
    pub opt_config: OptConfig,
    pub native_enabled: bool,
    pub stats: JitStats,
}

impl JitManager {
    pub fn new(opt_threshold: u64, native_enabled: bool) -> Self {
        JitManager {
            functions: HashMap::new(),
            exec_counts: HashMap::new(),
            blacklist: HashSet::new(),
            side_exits: Vec::new(),
            opt_threshold,
            opt_config: OptConfig::default(),
            native_enabled,
            stats: JitStats::default(),
        }
    }

    pub fn get(&self, fn_id: u32) -> Option<Arc<JitFunction>> {
        self.functions.get(&fn_id).cloned()
    }

    pub fn tier(&self, fn_id: u32) -> Tier {
        self.functions.get(&fn_id).map(|f| f.tier).unwrap_or(Tier::Interp)
    }

    pub fn is_compiled_or_refused(&self, fn_id: u32) -> bool {
        self.functions.contains_key(&fn_id) || self.blacklist.contains(&fn_id)
    }

    /// Lower a hot function to Baseline IR. Constructs the lowerer can
    /// not express blacklist the function so hotness polling stops
    /// retrying it.
    pub fn compile_baseline(&mut self, def: &FuncDef) -> bool {
        if self.is_compiled_or_refused(def.fn_id) {
            return false;
        }
        match lower::lower_function(def) {
            Ok(jf) => {
                self.functions.insert(def.fn_id, Arc::new(jf));
                self.exec_counts.insert(def.fn_id, 0);
                self.stats.compiled_baseline += 1;
                true
            }
            Err(_) => {
                self.blacklist.insert(def.fn_id);
                self.stats.lowering_bailed += 1;
                false
            }
        }
    }

    /// Count one Baseline execution; true when the function is due for
    /// promotion.
    pub fn note_execution(&mut self, fn_id: u32) -> bool {
        let count = self.exec_counts.entry(fn_id).or_insert(0);
        *count += 1;
        *count == self.opt_threshold && self.tier(fn_id) == Tier::Baseline
    }

    /// Promote to the Optimized tier: run the pass pipeline and emit
    /// native code when the result fits the backend's subset.
    pub fn promote(&mut self, fn_id: u32) {
        let Some(current) = self.functions.get(&fn_id) else { return };
        if current.tier != Tier::Baseline {
            return;
        }
        let mut optimized = JitFunction {
            fn_id: current.fn_id,
            name: current.name.clone(),
            param_count: current.param_count,
            names: current.names.clone(),
            strings: current.strings.clone(),
            code: current.code.clone(),
            tier: Tier::Optimized,
            guards: current.guards,
            sites: current.sites.clone(),
            native: None,
            native_size: 0,
        };
        opt::optimize(&mut optimized, &self.opt_config);
        if self.native_enabled {
            if let Some(native) = backend::compile(&optimized) {
                optimized.native_size = native.size;
                optimized.native = Some(native);
                self.stats.native_emitted += 1;
            }
        }
        self.stats.compiled_optimized += 1;
        self.functions.insert(fn_id, Arc::new(optimized));
    }

    /// Deoptimize after a guard failure: drop the native entry, fall
    /// back to Baseline, and hand the caller the inline-cache sites
    /// that need invalidation.
    pub fn record_side_exit(&mut self, fn_id: u32, reason: &'static str) -> Vec<u32> {
        self.stats.deopts += 1;
        self.side_exits.push(SideExit { fn_id, reason });
        let Some(current) = self.functions.get(&fn_id) else { return Vec::new() };
        let sites = current.sites.clone();
        let demoted = JitFunction {
            fn_id: current.fn_id,
            name: current.name.clone(),
            param_count: current.param_count,
            names: current.names.clone(),
            strings: current.strings.clone(),
            code: current.code.clone(),
            tier: Tier::Baseline,
            guards: current.guards,
            sites: current.sites.clone(),
            native: None,
            native_size: 0,
        };
        self.functions.insert(fn_id, Arc::new(demoted));
        // Reset the warm-up count; the function may be promoted again.
        self.exec_counts.insert(fn_id, 0);
        sites
    }

    pub fn side_exits(&self) -> &[SideExit] {
        &self.side_exits
    }

    pub fn tiers(&self) -> Vec<(Arc<str>, Tier)> {
        let mut tiers: Vec<(Arc<str>, Tier)> = self
            .functions
            .values()
            .map(|f| (f.name.clone(), f.tier))
            .collect();
        tiers.sort_by(|a, b| a.0.cmp(&b.0));
        tiers
    }
}
